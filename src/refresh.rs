//! Single-flight refresh-token exchange.
//!
//! Refresh tokens rotate: a second concurrent exchange would invalidate the
//! token the first one is still using. The coordinator therefore runs at most
//! one exchange per refresh token and lets every concurrent caller holding
//! that token await it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::ServiceError;
use crate::session::AccountAuth;
use crate::types::{AuthResult, SecretToken};

/// Why a refresh did not produce a token pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token is expired, revoked or missing. Terminal.
    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    /// The exchange could not complete (network, server error, timeout).
    /// The caller may retry under its own bounded policy.
    #[error("Refresh unavailable: {0}")]
    Transient(String),
}

impl RefreshError {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl From<ServiceError> for RefreshError {
    fn from(e: ServiceError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Rejected(e.to_string())
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AuthResult, RefreshError>>>;

struct InFlight {
    id: u64,
    token: SecretToken,
    future: RefreshFuture,
}

/// Runs refresh exchanges against an [`AccountAuth`] service, one per token.
pub struct RefreshCoordinator<A> {
    auth: Arc<A>,
    timeout: Duration,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_id: AtomicU64,
}

impl<A: AccountAuth> RefreshCoordinator<A> {
    #[must_use]
    pub fn new(auth: Arc<A>, timeout: Duration) -> Self {
        Self {
            auth,
            timeout,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Whether an exchange is currently running.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Exchange `refresh_token`, or join the exchange already in flight for
    /// the same token.
    ///
    /// The exchange runs on its own task: it completes, commits and clears
    /// the in-flight slot even if every caller stops waiting. `commit` runs
    /// exactly once per exchange, after success and before any caller is
    /// resumed; it is how the new pair gets persisted ahead of retried
    /// requests. A caller that joins an existing exchange has its `commit`
    /// dropped unrun. A different token never joins: it starts its own
    /// exchange and takes over the slot.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Rejected`] for an empty, expired or revoked
    /// token or an invalid response, [`RefreshError::Transient`] for network
    /// failures and timeouts.
    pub async fn refresh<F>(
        &self,
        refresh_token: &SecretToken,
        commit: F,
    ) -> Result<AuthResult, RefreshError>
    where
        F: FnOnce(&AuthResult) + Send + 'static,
    {
        if refresh_token.is_empty() {
            return Err(RefreshError::Rejected("no refresh token".into()));
        }

        let future = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(flight) if flight.token == *refresh_token => {
                    tracing::debug!(flight = flight.id, "Joining in-flight token refresh");
                    flight.future.clone()
                }
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.start(id, refresh_token.clone(), commit);
                    *slot = Some(InFlight {
                        id,
                        token: refresh_token.clone(),
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        future.await
    }

    /// Spawns exchange `id`. Must be called with the slot locked so the task
    /// cannot clear it before it is filled.
    fn start<F>(&self, id: u64, refresh_token: SecretToken, commit: F) -> RefreshFuture
    where
        F: FnOnce(&AuthResult) + Send + 'static,
    {
        let auth = Arc::clone(&self.auth);
        let slot = Arc::clone(&self.in_flight);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let result = exchange(auth, refresh_token, timeout, commit).await;
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|flight| flight.id == id) {
                *slot = None;
            }
            result
        });
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(RefreshError::Transient(format!("refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }
}

async fn exchange<A, F>(
    auth: Arc<A>,
    refresh_token: SecretToken,
    timeout: Duration,
    commit: F,
) -> Result<AuthResult, RefreshError>
where
    A: AccountAuth,
    F: FnOnce(&AuthResult) + Send + 'static,
{
    let token = refresh_token.fingerprint();
    tracing::debug!(token = %token, "Exchanging refresh token");

    let result = match tokio::time::timeout(timeout, auth.refresh(&refresh_token)).await {
        Err(_) => Err(RefreshError::Transient(format!(
            "refresh timed out after {}s",
            timeout.as_secs()
        ))),
        Ok(Err(e)) => Err(RefreshError::from(e)),
        Ok(Ok(result)) => result.validate().map_err(RefreshError::from),
    };

    match &result {
        Ok(refreshed) => {
            commit(refreshed);
            tracing::info!(
                token = %token,
                role = %refreshed.principal.role(),
                "Token refresh succeeded"
            );
        }
        Err(e) => tracing::warn!(token = %token, error = %e, "Token refresh failed"),
    }
    result
}
