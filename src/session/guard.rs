use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio_util::task::TaskTracker;

use super::controller::SessionController;
use super::error::AuthError;
use super::traits::{AccountAuth, ChildAuth, SessionAuthority};
use super::types::{ActivityAction, ActivityHeartbeat, SuspiciousActivityReport};
use crate::error::ServiceError;
use crate::store::KeyValueStorage;
use crate::types::{Principal, SecretToken};

/// Guard behavior for protected child pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardOptions {
    pub(crate) require_active_session: bool,
    pub(crate) max_session_duration_minutes: u32,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            require_active_session: true,
            max_session_duration_minutes: 60,
        }
    }
}

impl GuardOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When false, role checks alone decide access and the session authority
    /// is never queried.
    #[must_use]
    pub fn with_require_active_session(mut self, require: bool) -> Self {
        self.require_active_session = require;
        self
    }

    #[must_use]
    pub fn with_max_session_duration_minutes(mut self, minutes: u32) -> Self {
        self.max_session_duration_minutes = minutes;
        self
    }

    #[must_use]
    pub const fn require_active_session(&self) -> bool {
        self.require_active_session
    }

    #[must_use]
    pub const fn max_session_duration_minutes(&self) -> u32 {
        self.max_session_duration_minutes
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    CheckingSession,
    Allowed,
    Denied(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DenyReason {
    #[display("child login required")]
    ChildLoginRequired,
    #[display("parent session on a child page")]
    ParentLoginRequired,
    #[display("session expired")]
    SessionExpired,
    #[display("session ended — time for a break")]
    SessionTimedOut,
    #[display("unusual activity — ask a parent to help you log in")]
    SuspiciousActivity,
    #[display("unable to validate session")]
    ValidationUnavailable,
}

impl DenyReason {
    /// Message shown on the denied page.
    #[must_use]
    pub fn message(self) -> String {
        self.to_string()
    }

    /// Login route the page should send the user to, if any.
    #[must_use]
    pub fn redirect(self, config: &super::SessionConfig) -> Option<&str> {
        match self {
            Self::ParentLoginRequired => Some(config.parent_login_path()),
            Self::ValidationUnavailable => None,
            _ => Some(config.child_login_path()),
        }
    }

    /// Only a failed validation may succeed on a later check; the session
    /// is still there.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ValidationUnavailable)
    }
}

/// One mounted protected page.
///
/// A mount belongs to one session: the one live when it was mounted, or the
/// first one a check sees if it was mounted without a session. Past the role
/// checks, a check under any other session makes no remote call and leaves
/// the mount state as it was. Results that complete after the page
/// unmounted are dropped without side effects.
#[derive(Debug)]
pub struct GuardMount {
    inner: Arc<MountInner>,
}

#[derive(Debug)]
struct MountInner {
    alive: AtomicBool,
    generation: Mutex<Option<u64>>,
    state: Mutex<GuardState>,
}

impl GuardMount {
    #[must_use]
    pub fn state(&self) -> GuardState {
        self.inner.state.lock().clone()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Session generation the mount is bound to, once bound.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        *self.inner.generation.lock()
    }

    pub fn unmount(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Binds an unbound mount to `generation`. False if the mount belongs
    /// to another session.
    fn bind(&self, generation: u64) -> bool {
        *self.inner.generation.lock().get_or_insert(generation) == generation
    }

    fn set(&self, state: GuardState) -> GuardState {
        *self.inner.state.lock() = state.clone();
        state
    }
}

impl Drop for GuardMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Gate for protected child pages.
///
/// Checks role, then the live session with the session authority: duration
/// cap, suspicious activity, and a heartbeat for every allowed page view.
/// Heartbeats and reports are fire-and-forget; [`drain`](Self::drain) waits
/// for them.
pub struct ChildSessionGuard<S, A, C, K> {
    controller: SessionController<A, C, K>,
    authority: Arc<S>,
    options: GuardOptions,
    tasks: TaskTracker,
}

impl<S, A, C, K> ChildSessionGuard<S, A, C, K>
where
    S: SessionAuthority,
    A: AccountAuth,
    C: ChildAuth,
    K: KeyValueStorage,
{
    #[must_use]
    pub fn new(controller: SessionController<A, C, K>, authority: Arc<S>, options: GuardOptions) -> Self {
        Self {
            controller,
            authority,
            options,
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &GuardOptions {
        &self.options
    }

    /// Mount a protected page, bound to the current session if there is one.
    #[must_use]
    pub fn mount(&self) -> GuardMount {
        let generation = self.controller.current().map(|(_, generation)| generation);
        GuardMount {
            inner: Arc::new(MountInner {
                alive: AtomicBool::new(true),
                generation: Mutex::new(generation),
                state: Mutex::new(GuardState::CheckingSession),
            }),
        }
    }

    /// Decide whether the page at `path` may render.
    pub async fn check(&self, mount: &GuardMount, path: &str) -> GuardState {
        let auth = self.controller.state();
        if auth.loading() {
            return mount.set(GuardState::CheckingSession);
        }

        let Some((record, generation)) = self.controller.current() else {
            return mount.set(GuardState::Denied(DenyReason::ChildLoginRequired));
        };
        let Principal::Child(child) = record.principal() else {
            return mount.set(GuardState::Denied(DenyReason::ParentLoginRequired));
        };
        if !mount.bind(generation) {
            tracing::debug!(path, "Ignoring guard check for a replaced session");
            return mount.state();
        }

        if !self.options.require_active_session {
            return mount.set(GuardState::Allowed);
        }

        let authority = Arc::clone(&self.authority);
        let timeout = self.controller.config().request_timeout();
        let metadata = self
            .controller
            .call_with_refresh(&record, generation, |token| {
                let authority = Arc::clone(&authority);
                async move {
                    tokio::time::timeout(timeout, authority.current_session(&token))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ServiceError::Network("session check timed out".into()))
                        })
                }
            })
            .await;

        if !mount.is_mounted() || self.controller.generation() != generation {
            tracing::debug!(path, "Discarding guard result for a stale mount");
            return mount.state();
        }

        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) if e.is_terminal() => {
                tracing::info!(error = %e, path, "Child session rejected by the authority");
                self.controller
                    .expire_generation(generation, AuthError::SessionExpired);
                return mount.set(GuardState::Denied(DenyReason::SessionExpired));
            }
            Err(e) => {
                tracing::warn!(error = %e, path, "Session validation unavailable");
                return mount.set(GuardState::Denied(DenyReason::ValidationUnavailable));
            }
        };

        // The check may have rotated the pair.
        let token = self
            .controller
            .access_token()
            .unwrap_or_else(|| record.access_token.clone());
        let now = OffsetDateTime::now_utc();
        let elapsed = now - metadata.login_time;
        let limit = self.options.max_session_duration_minutes;
        if elapsed > time::Duration::minutes(i64::from(limit)) {
            tracing::info!(
                child_id = %child.id,
                elapsed_minutes = elapsed.whole_minutes(),
                limit_minutes = limit,
                "Child session exceeded its duration cap"
            );
            self.controller.expire_generation(
                generation,
                AuthError::SessionTimedOut {
                    elapsed_minutes: elapsed.whole_minutes(),
                    limit_minutes: limit,
                },
            );
            return mount.set(GuardState::Denied(DenyReason::SessionTimedOut));
        }

        if let Some(activity) = metadata.suspicious_activity.filter(|a| a.detected) {
            tracing::warn!(
                child_id = %child.id,
                risk_level = ?activity.risk_level,
                "Suspicious activity on child session"
            );
            self.controller.expire_generation(
                generation,
                AuthError::SuspiciousActivityDetected {
                    risk_level: activity.risk_level,
                },
            );
            let report = SuspiciousActivityReport {
                child_id: child.id.clone(),
                activity_details: activity,
                timestamp: now,
                location: path.to_owned(),
            };
            self.spawn_report(token, report);
            return mount.set(GuardState::Denied(DenyReason::SuspiciousActivity));
        }

        self.controller.touch(generation, now);
        self.spawn_heartbeat(
            token,
            ActivityHeartbeat {
                timestamp: now,
                page: path.to_owned(),
                action: ActivityAction::PageView,
            },
        );
        mount.set(GuardState::Allowed)
    }

    /// Wait for outstanding heartbeats and reports.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn spawn_heartbeat(&self, token: SecretToken, heartbeat: ActivityHeartbeat) {
        let authority = Arc::clone(&self.authority);
        let timeout = self.controller.config().request_timeout();
        self.tasks.spawn(async move {
            match tokio::time::timeout(timeout, authority.record_activity(&token, &heartbeat)).await {
                Ok(Ok(())) => tracing::trace!(page = %heartbeat.page, "Heartbeat recorded"),
                Ok(Err(e)) => tracing::warn!(error = %e, page = %heartbeat.page, "Heartbeat failed"),
                Err(_) => tracing::warn!(page = %heartbeat.page, "Heartbeat timed out"),
            }
        });
    }

    fn spawn_report(&self, token: SecretToken, report: SuspiciousActivityReport) {
        let authority = Arc::clone(&self.authority);
        let timeout = self.controller.config().request_timeout();
        self.tasks.spawn(async move {
            let sent =
                tokio::time::timeout(timeout, authority.report_suspicious_activity(&token, &report))
                    .await;
            match sent {
                Ok(Ok(())) => tracing::info!(child_id = %report.child_id, "Suspicious activity reported"),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, child_id = %report.child_id, "Suspicious activity report failed");
                }
                Err(_) => tracing::warn!(child_id = %report.child_id, "Suspicious activity report timed out"),
            }
        });
    }
}
