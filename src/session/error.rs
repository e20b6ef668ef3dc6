use super::types::RiskLevel;
use crate::error::ServiceError;
use crate::refresh::RefreshError;

/// Session lifecycle failures.
///
/// The controller recovers every variant locally and always leaves a defined
/// state behind; only [`reason`](Self::reason) is meant for display.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The server could not be reached. Never logs the user out by itself.
    #[error("Network unavailable: {0}")]
    TransientNetworkFailure(String),

    /// The refresh token was rejected. The session has been cleared.
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// No usable session (no refresh token, or the authority rejected it).
    #[error("Session expired")]
    SessionExpired,

    /// Persisted state failed validation and could not be repaired.
    #[error("Session corrupted: {}", .0.join("; "))]
    SessionCorrupted(Vec<String>),

    /// Child session exceeded its maximum duration.
    #[error("Session timed out after {elapsed_minutes} minutes (limit {limit_minutes})")]
    SessionTimedOut {
        elapsed_minutes: i64,
        limit_minutes: u32,
    },

    /// The session authority flagged the child session.
    #[error("Suspicious activity detected (risk {risk_level:?})")]
    SuspiciousActivityDetected { risk_level: RiskLevel },

    /// Forced redirects kept bouncing to the same path; automatic redirects
    /// are halted.
    #[error("Redirect loop detected at {path}")]
    RedirectLoopDetected { path: String },

    /// Credentials rejected locally before any network call.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// A login, registration or authorized request failed at the service.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Human-readable reason for the UI layer.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::TransientNetworkFailure(_) => {
                "We couldn't reach the server. Please try again.".into()
            }
            Self::TokenRefreshFailed(_) | Self::SessionExpired | Self::SessionCorrupted(_) => {
                "Your session has expired. Please log in again.".into()
            }
            Self::SessionTimedOut { .. } => "Session ended — time for a break!".into(),
            Self::SuspiciousActivityDetected { .. } => {
                "We noticed some unusual activity. Ask a parent to help you log in.".into()
            }
            Self::RedirectLoopDetected { .. } => {
                "We couldn't restore your session. Please log in again.".into()
            }
            Self::InvalidCredentials(msg) => msg.clone(),
            Self::Service(e) if e.is_unauthorized() => "Incorrect login details.".into(),
            Self::Service(e) if e.is_transient() => {
                "We couldn't reach the server. Please try again.".into()
            }
            Self::Service(_) => "Something went wrong. Please try again.".into(),
            Self::Config(_) => "The app is not configured correctly.".into(),
        }
    }

    /// Whether the session is gone after this failure.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TokenRefreshFailed(_)
                | Self::SessionExpired
                | Self::SessionCorrupted(_)
                | Self::SessionTimedOut { .. }
                | Self::SuspiciousActivityDetected { .. }
                | Self::RedirectLoopDetected { .. }
        )
    }
}

impl From<RefreshError> for AuthError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Rejected(msg) => Self::TokenRefreshFailed(msg),
            RefreshError::Transient(msg) => Self::TransientNetworkFailure(msg),
        }
    }
}
