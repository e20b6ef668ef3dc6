use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;

use super::config::SessionConfig;
use super::error::AuthError;
use super::state::{AuthState, ControllerState, Phase};
use super::traits::{AccountAuth, ChildAuth};
use crate::error::ServiceError;
use crate::loop_detector::LoopDetector;
use crate::refresh::RefreshCoordinator;
use crate::store::{KeyValueStorage, Restored, SessionStore};
use crate::types::{AuthResult, NewParentAccount, Role, SecretToken, SessionRecord};

/// What the caller should do after an unresolved authentication failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    /// Navigate to the login page.
    Redirect { to: String },
    /// A redirect loop was detected and broken; the session is cleared and
    /// automatic redirects stop.
    LoopBroken { path: String },
    /// Redirects are already halted for this session.
    Suppressed,
}

impl RedirectDecision {
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Redirect { to } => Some(to),
            Self::LoopBroken { .. } | Self::Suppressed => None,
        }
    }
}

/// Owner of the current session.
///
/// Drives boot, login, child login, logout and refresh; it is the only
/// writer of the persisted session store. Cloning is cheap and every clone
/// observes the same session.
pub struct SessionController<A, C, K> {
    inner: Arc<Inner<A, C, K>>,
}

// Cloning shares the inner Arc; no `A: Clone` style bounds.
impl<A, C, K> Clone for SessionController<A, C, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A, C, K> {
    account: Arc<A>,
    child: Arc<C>,
    store: SessionStore<K>,
    refresher: RefreshCoordinator<A>,
    loop_detector: Mutex<LoopDetector>,
    state: Mutex<ControllerState>,
    changes: watch::Sender<AuthState>,
    config: SessionConfig,
}

/// How a successful refresh is applied.
#[derive(Debug, Clone, Copy)]
enum Commit {
    /// Restoring a persisted session during boot.
    Boot,
    /// Rotating tokens of the live session with this generation.
    Live(u64),
}

impl<A, C, K> SessionController<A, C, K>
where
    A: AccountAuth,
    C: ChildAuth,
    K: KeyValueStorage,
{
    #[must_use]
    pub fn new(account: Arc<A>, child: Arc<C>, storage: K, config: SessionConfig) -> Self {
        let state = ControllerState::new();
        let (changes, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(Inner {
                refresher: RefreshCoordinator::new(Arc::clone(&account), config.request_timeout),
                loop_detector: Mutex::new(LoopDetector::new(
                    config.loop_threshold,
                    config.loop_window,
                )),
                store: SessionStore::new(storage),
                state: Mutex::new(state),
                account,
                child,
                changes,
                config,
            }),
        }
    }

    /// Current auth state snapshot.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.inner.state.lock().snapshot()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.changes.subscribe()
    }

    /// Session generation; changes whenever a session starts or ends.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation()
    }

    /// Access token of the current session, for attaching as a bearer
    /// credential.
    #[must_use]
    pub fn access_token(&self) -> Option<SecretToken> {
        self.inner
            .state
            .lock()
            .record()
            .map(|r| r.access_token.clone())
    }

    /// Read access to the persisted store. Writes go through the controller.
    #[must_use]
    pub fn store(&self) -> &SessionStore<K> {
        &self.inner.store
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn current(&self) -> Option<(SessionRecord, u64)> {
        let state = self.inner.state.lock();
        state.record().map(|r| (r.clone(), state.generation()))
    }

    // ── Boot ───────────────────────────────────────────────────────────

    /// Restore a persisted session. Runs once; later calls return the
    /// current state untouched.
    pub async fn bootstrap(&self) -> AuthState {
        let started = self.inner.update(|s| {
            if s.phase() == Phase::Uninitialized {
                s.begin_loading();
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!("Session controller already booted");
            return self.state();
        }

        match self.inner.store.restore() {
            Restored::Empty => {
                self.inner.settle_boot(None);
                tracing::debug!("No persisted session");
            }
            Restored::Corrupted(errors) => {
                self.inner.settle_boot(Some(AuthError::SessionCorrupted(errors)));
            }
            Restored::Valid(record) | Restored::Repaired(record) => self.resume(record).await,
        }
        self.state()
    }

    async fn resume(&self, record: SessionRecord) {
        let inner = Arc::clone(&self.inner);
        let base = record.clone();
        let outcome = self
            .inner
            .refresher
            .refresh(&record.refresh_token, move |refreshed| {
                inner.commit_refresh(Commit::Boot, &base, refreshed);
            })
            .await;

        match outcome {
            Ok(_) => {}
            Err(e) if e.is_terminal() => {
                tracing::info!(error = %e, "Persisted session could not be resumed");
                self.inner.settle_boot(Some(e.into()));
            }
            Err(e) => {
                // Offline is not a logout: keep the stored session and let the
                // next authorized request retry the refresh.
                tracing::warn!(error = %e, "Session resumed without refresh");
                self.inner.update(|s| {
                    if s.phase() == Phase::Loading {
                        s.authenticate(record);
                        s.set_error(Some(e.into()));
                    }
                });
            }
        }
    }

    // ── Login ──────────────────────────────────────────────────────────

    /// Parent login. On failure the state is unchanged and the error is
    /// returned for display.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Service`] when the account service rejects the
    /// credentials, cannot be reached, or returns an invalid payload.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthState, AuthError> {
        let result = self
            .with_timeout("login", self.inner.account.login(email, password))
            .await?;
        self.install_parent(result, "Parent login successful")
    }

    /// Create a parent account and sign it in.
    ///
    /// # Errors
    ///
    /// Same as [`login`](Self::login).
    pub async fn register(&self, account: &NewParentAccount) -> Result<AuthState, AuthError> {
        let result = self
            .with_timeout("register", self.inner.account.register(account))
            .await?;
        self.install_parent(result, "Parent registration successful")
    }

    /// Child login with username and PIN.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for a malformed username or
    /// PIN (no network call is made), or [`AuthError::Service`] when the
    /// child service fails.
    pub async fn child_login(&self, username: &str, pin: &str) -> Result<AuthState, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidCredentials("Please enter your username.".into()));
        }
        if !(4..=6).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::InvalidCredentials(
                "Your PIN is 4 to 6 numbers.".into(),
            ));
        }

        let result = self
            .with_timeout("child login", self.inner.child.child_login(username, pin))
            .await?;
        let result = AuthResult::from(result).validate()?;
        let record = SessionRecord::new(result, OffsetDateTime::now_utc());
        tracing::info!(
            child_id = %record.principal().id(),
            session_id = ?record.session_id,
            "Child login successful"
        );
        Ok(self.inner.install(record))
    }

    fn install_parent(&self, result: AuthResult, message: &'static str) -> Result<AuthState, AuthError> {
        let result = result.validate()?;
        if result.principal.role() != Role::Parent {
            return Err(ServiceError::InvalidResponse(
                "account login returned a child principal".into(),
            )
            .into());
        }
        let record = SessionRecord::new(result, OffsetDateTime::now_utc());
        tracing::info!(parent_id = %record.principal().id(), "{message}");
        Ok(self.inner.install(record))
    }

    // ── Logout ─────────────────────────────────────────────────────────

    /// End the session. The remote logout is best-effort; local cleanup
    /// always happens.
    pub async fn logout(&self) -> AuthState {
        if let Some(token) = self.access_token() {
            if let Err(e) = self
                .with_timeout("logout", self.inner.account.logout(&token))
                .await
            {
                tracing::warn!(error = %e, "Remote logout failed, clearing local session anyway");
            }
        }
        self.inner.update(|s| {
            self.inner.store.clear();
            s.unauthenticate(None);
        });
        tracing::info!("Logged out");
        self.state()
    }

    // ── Refresh ────────────────────────────────────────────────────────

    /// Access token that is good for at least the configured skew,
    /// refreshing first when needed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionExpired`] without a session,
    /// [`AuthError::TokenRefreshFailed`] when the refresh token was rejected
    /// (the session is cleared), [`AuthError::TransientNetworkFailure`] when
    /// the exchange could not complete (the session is kept).
    pub async fn refresh_if_needed(&self) -> Result<SecretToken, AuthError> {
        let (record, generation) = self.current().ok_or(AuthError::SessionExpired)?;
        if !record.access_expires_within(self.inner.config.refresh_skew, OffsetDateTime::now_utc())
        {
            return Ok(record.access_token);
        }
        self.refresh_live(&record, generation).await
    }

    /// Exchange the refresh token regardless of access token expiry.
    ///
    /// # Errors
    ///
    /// Same as [`refresh_if_needed`](Self::refresh_if_needed).
    pub async fn force_refresh(&self) -> Result<SecretToken, AuthError> {
        let (record, generation) = self.current().ok_or(AuthError::SessionExpired)?;
        self.refresh_live(&record, generation).await
    }

    async fn refresh_live(&self, record: &SessionRecord, generation: u64) -> Result<SecretToken, AuthError> {
        let outcome = self.exchange(record, generation).await;
        if let Err(e) = &outcome {
            if e.is_terminal() {
                self.inner.expire(generation, e.clone());
            }
        }
        outcome
    }

    /// Single-flight exchange bound to `generation`. Does not clear the
    /// session on failure.
    async fn exchange(&self, record: &SessionRecord, generation: u64) -> Result<SecretToken, AuthError> {
        let inner = Arc::clone(&self.inner);
        let base = record.clone();
        let outcome = self
            .inner
            .refresher
            .refresh(&record.refresh_token, move |refreshed| {
                inner.commit_refresh(Commit::Live(generation), &base, refreshed);
            })
            .await;

        match outcome {
            Ok(_) => {
                let state = self.inner.state.lock();
                match state.record() {
                    Some(r) if state.generation() == generation => Ok(r.access_token.clone()),
                    _ => Err(AuthError::SessionExpired),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Authorized requests ────────────────────────────────────────────

    /// Run a request with the session's bearer token.
    ///
    /// A 401 triggers one refresh (skipped when another request already
    /// rotated the token) and one retry with the new token. A 401 that
    /// refresh cannot resolve goes to [`on_auth_failure`](Self::on_auth_failure).
    ///
    /// # Errors
    ///
    /// Returns the request's own [`ServiceError`] as [`AuthError::Service`],
    /// or a session error when the 401 could not be resolved.
    pub async fn send_authorized<T, F, Fut>(&self, current_path: &str, call: F) -> Result<T, AuthError>
    where
        F: FnMut(SecretToken) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let (record, generation) = self.current().ok_or(AuthError::SessionExpired)?;
        match self.call_with_refresh(&record, generation, call).await {
            // A newer session is not this request's to clear.
            Err(e) if e.is_terminal() && self.generation() == generation => {
                Err(self.fail(current_path, e))
            }
            other => other,
        }
    }

    /// 401 → refresh → retry once, for the session `record` at `generation`.
    ///
    /// Never clears the session. A terminal error means the 401 could not be
    /// resolved; what that implies is up to the caller.
    pub(crate) async fn call_with_refresh<T, F, Fut>(
        &self,
        record: &SessionRecord,
        generation: u64,
        mut call: F,
    ) -> Result<T, AuthError>
    where
        F: FnMut(SecretToken) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let sent = record.access_token.clone();
        match call(sent.clone()).await {
            Err(e) if e.is_unauthorized() => {}
            other => return other.map_err(AuthError::from),
        }
        tracing::debug!(generation, "Request unauthorized, refreshing session");

        let rotated = {
            let state = self.inner.state.lock();
            match state.record() {
                Some(r) if state.generation() == generation && r.access_token != sent => {
                    Some(r.access_token.clone())
                }
                _ => None,
            }
        };
        let fresh = match rotated {
            Some(token) => token,
            None => self.exchange(record, generation).await?,
        };

        match call(fresh).await {
            Err(e) if e.is_unauthorized() => Err(AuthError::SessionExpired),
            other => other.map_err(AuthError::from),
        }
    }

    fn fail(&self, current_path: &str, err: AuthError) -> AuthError {
        match self.on_auth_failure(current_path) {
            RedirectDecision::Redirect { .. } => err,
            RedirectDecision::LoopBroken { path } => AuthError::RedirectLoopDetected { path },
            RedirectDecision::Suppressed => AuthError::RedirectLoopDetected {
                path: current_path.to_owned(),
            },
        }
    }

    // ── Auth failure ───────────────────────────────────────────────────

    /// Handle a 401 that refresh could not resolve while on `current_path`.
    ///
    /// Clears the session and issues a forced redirect, which the loop
    /// detector records. Once the redirects already issued form a loop the
    /// loop is broken instead: no redirect is issued, and none will be until
    /// a new session starts.
    pub fn on_auth_failure(&self, current_path: &str) -> RedirectDecision {
        let inner = &self.inner;
        inner.update(|s| {
            let role = s
                .record()
                .map(SessionRecord::role)
                .or_else(|| inner.store.cached_role());
            inner.store.clear();

            if s.redirects_suppressed() {
                s.unauthenticate(Some(AuthError::RedirectLoopDetected {
                    path: current_path.to_owned(),
                }));
                tracing::debug!(path = current_path, "Redirect suppressed after loop");
                return RedirectDecision::Suppressed;
            }

            let mut detector = inner.loop_detector.lock();
            if detector.is_loop_detected() {
                detector.reset();
                s.suppress_redirects();
                s.unauthenticate(Some(AuthError::RedirectLoopDetected {
                    path: current_path.to_owned(),
                }));
                tracing::warn!(path = current_path, "Redirect loop detected, session cleared");
                return RedirectDecision::LoopBroken {
                    path: current_path.to_owned(),
                };
            }

            let login = match role {
                Some(Role::Child) => inner.config.child_login_path.as_str(),
                _ => inner.config.parent_login_path.as_str(),
            };
            let to = if current_path.split('?').next() == Some(login) {
                login.to_owned()
            } else {
                format!("{login}?redirect={}", urlencoding::encode(current_path))
            };
            detector.record_redirect(current_path);
            s.unauthenticate(Some(AuthError::SessionExpired));
            s.set_redirect(Some(to.clone()));
            tracing::info!(path = current_path, to = %to, "Redirecting to login");
            RedirectDecision::Redirect { to }
        })
    }

    // ── Policy expiry ──────────────────────────────────────────────────

    /// Clear the current session for a policy reason (expired, timed out,
    /// suspicious activity). No redirect is recorded.
    pub fn expire_session(&self, reason: AuthError) {
        let generation = self.generation();
        self.inner.expire(generation, reason);
    }

    /// Clear the session only if it is still the one from `generation`.
    pub(crate) fn expire_generation(&self, generation: u64, reason: AuthError) -> bool {
        self.inner.expire(generation, reason)
    }

    /// Stamp child activity on the live session.
    pub(crate) fn touch(&self, generation: u64, at: OffsetDateTime) {
        self.inner.update(|s| {
            if s.generation() != generation {
                return;
            }
            let Some(mut record) = s.record().cloned() else {
                return;
            };
            record.last_activity = Some(at);
            if let Err(e) = self.inner.store.save(&record) {
                tracing::error!(error = %e, "Failed to persist session activity");
            }
            s.replace_record(record);
        });
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        let timeout = self.inner.config.request_timeout;
        tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
            Err(ServiceError::Network(format!(
                "{operation} timed out after {}s",
                timeout.as_secs()
            )))
        })
    }
}

impl<A, C, K: KeyValueStorage> Inner<A, C, K> {
    /// Mutate state under the lock and publish the resulting snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        let mut state = self.state.lock();
        let out = f(&mut state);
        self.changes.send_replace(state.snapshot());
        out
    }

    fn install(&self, record: SessionRecord) -> AuthState {
        self.update(|s| {
            if let Err(e) = self.store.save(&record) {
                tracing::error!(error = %e, "Failed to persist session; continuing in memory");
            }
            s.authenticate(record);
        });
        self.loop_detector.lock().reset();
        self.state.lock().snapshot()
    }

    fn settle_boot(&self, error: Option<AuthError>) {
        self.update(|s| {
            if s.phase() == Phase::Loading {
                self.store.clear();
                s.unauthenticate(error);
            }
        });
    }

    fn expire(&self, generation: u64, reason: AuthError) -> bool {
        self.update(|s| {
            if s.generation() != generation || s.record().is_none() {
                return false;
            }
            tracing::info!(reason = %reason, "Session cleared");
            self.store.clear();
            s.unauthenticate(Some(reason));
            true
        })
    }

    /// Applies a refreshed token pair. Runs inside the shared refresh future,
    /// so the write lands before any waiting request is retried.
    fn commit_refresh(&self, commit: Commit, base: &SessionRecord, refreshed: &AuthResult) {
        self.update(|s| {
            let now = OffsetDateTime::now_utc();
            match commit {
                Commit::Boot if s.phase() == Phase::Loading => {
                    let record = base.refreshed(refreshed.clone(), now);
                    self.persist(&record);
                    s.authenticate(record);
                }
                Commit::Live(generation) if s.generation() == generation => {
                    let Some(current) = s.record() else {
                        return;
                    };
                    let record = current.refreshed(refreshed.clone(), now);
                    self.persist(&record);
                    s.replace_record(record);
                }
                _ => tracing::debug!("Discarding refresh result for a superseded session"),
            }
        });
    }

    fn persist(&self, record: &SessionRecord) {
        if let Err(e) = self.store.save(record) {
            tracing::error!(error = %e, "Failed to persist refreshed session");
        }
    }
}
