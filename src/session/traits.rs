use std::future::Future;

use super::types::{ActivityHeartbeat, SessionMetadata, SuspiciousActivityReport};
use crate::error::ServiceError;
use crate::types::{AuthResult, ChildLoginResult, NewParentAccount, SecretToken};

/// Parent account authentication service.
///
/// Results are validated by the controller before they reach a session
/// record, so implementations may pass server payloads through unchanged.
///
/// # Example
///
/// ```rust,ignore
/// impl AccountAuth for MyBackend {
///     async fn login(&self, email: &str, password: &str) -> Result<AuthResult, ServiceError> {
///         self.api.post_login(email, password).await.map_err(into_service_error)
///     }
///     // ...
/// }
/// ```
pub trait AccountAuth: Send + Sync + 'static {
    /// Exchange email and password for a token pair.
    fn login(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<AuthResult, ServiceError>> + Send;

    /// Create a parent account and sign it in.
    fn register(
        &self,
        account: &NewParentAccount,
    ) -> impl Future<Output = Result<AuthResult, ServiceError>> + Send;

    /// Exchange a refresh token for a new token pair.
    ///
    /// Must return [`ServiceError::Unauthorized`] (or a 4xx status) when the
    /// refresh token is expired or revoked, so the failure is classified as
    /// terminal.
    fn refresh(
        &self,
        refresh_token: &SecretToken,
    ) -> impl Future<Output = Result<AuthResult, ServiceError>> + Send;

    /// Revoke the session server-side. Callers treat failure as non-fatal.
    fn logout(
        &self,
        access_token: &SecretToken,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// Child PIN authentication service.
pub trait ChildAuth: Send + Sync + 'static {
    fn child_login(
        &self,
        username: &str,
        pin: &str,
    ) -> impl Future<Output = Result<ChildLoginResult, ServiceError>> + Send;
}

/// Remote service of record for live child session validity.
pub trait SessionAuthority: Send + Sync + 'static {
    /// Current session metadata. [`ServiceError::Unauthorized`] means the
    /// session is no longer valid.
    fn current_session(
        &self,
        access_token: &SecretToken,
    ) -> impl Future<Output = Result<SessionMetadata, ServiceError>> + Send;

    /// Record a page view (heartbeat).
    fn record_activity(
        &self,
        access_token: &SecretToken,
        heartbeat: &ActivityHeartbeat,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Report an anomaly observed on a child session.
    fn report_suspicious_activity(
        &self,
        access_token: &SecretToken,
        report: &SuspiciousActivityReport,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}
