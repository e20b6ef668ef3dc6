#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;

use studyplan_auth::session::{
    AccountAuth, ActivityHeartbeat, ChildAuth, SessionAuthority, SessionMetadata,
    SuspiciousActivity, SuspiciousActivityReport,
};
use studyplan_auth::{
    AuthResult, ChildLoginResult, ChildPrincipal, MemoryStorage, NewParentAccount,
    ParentPrincipal, Principal, SecretToken, ServiceError, SessionConfig, SessionController,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("studyplan_auth=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn parent() -> Principal {
    Principal::Parent(ParentPrincipal {
        id: "parent-1".into(),
        name: "Jae".into(),
        email: Some("jae@example.com".into()),
    })
}

pub fn child() -> ChildPrincipal {
    ChildPrincipal {
        id: "child-1".into(),
        name: "Test Child".into(),
        parent_id: "parent-1".into(),
        age: Some(9),
        grade: Some("4".into()),
    }
}

// ── Account service ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAccounts {
    pub logins: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub logouts: AtomicUsize,
    pub refresh_delay: Mutex<Duration>,
    pub refresh_failure: Mutex<Option<ServiceError>>,
    pub logout_failure: Mutex<Option<ServiceError>>,
    pub login_principal: Mutex<Option<Principal>>,
}

impl FakeAccounts {
    pub fn fail_refresh(&self, e: ServiceError) {
        *self.refresh_failure.lock() = Some(e);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl AccountAuth for FakeAccounts {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResult, ServiceError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if password != "correct-horse" {
            return Err(ServiceError::Unauthorized(format!("bad password for {email}")));
        }
        let principal = self.login_principal.lock().clone().unwrap_or_else(parent);
        Ok(
            AuthResult::new(principal, SecretToken::new("parent-access"), SecretToken::new("parent-refresh"))
                .with_expires_in(900),
        )
    }

    async fn register(&self, account: &NewParentAccount) -> Result<AuthResult, ServiceError> {
        Ok(AuthResult::new(
            Principal::Parent(ParentPrincipal {
                id: "parent-new".into(),
                name: account.name.clone(),
                email: Some(account.email.clone()),
            }),
            SecretToken::new("new-access"),
            SecretToken::new("new-refresh"),
        ))
    }

    async fn refresh(&self, refresh_token: &SecretToken) -> Result<AuthResult, ServiceError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock();
        tokio::time::sleep(delay).await;
        if let Some(e) = self.refresh_failure.lock().clone() {
            return Err(e);
        }
        let principal = if refresh_token.expose().starts_with("child") {
            Principal::Child(child())
        } else {
            self.login_principal.lock().clone().unwrap_or_else(parent)
        };
        Ok(
            AuthResult::new(
                principal,
                SecretToken::new(format!("access-{n}")),
                SecretToken::new(format!("{}-{n}", refresh_token.expose())),
            )
            .with_expires_in(900),
        )
    }

    async fn logout(&self, _: &SecretToken) -> Result<(), ServiceError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        match self.logout_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Child service ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeChildren {
    pub logins: AtomicUsize,
}

impl ChildAuth for FakeChildren {
    async fn child_login(&self, username: &str, pin: &str) -> Result<ChildLoginResult, ServiceError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if username != "testchild" || pin != "1234" {
            return Err(ServiceError::Unauthorized("wrong PIN".into()));
        }
        Ok(ChildLoginResult::new(
            child(),
            SecretToken::new("child-access"),
            SecretToken::new("child-refresh"),
        )
        .with_session_id("sess-1"))
    }
}

// ── Session authority ──────────────────────────────────────────────────

pub struct FakeAuthority {
    pub response: Mutex<Result<SessionMetadata, ServiceError>>,
    /// Access tokens answered with 401 regardless of `response`.
    pub rejected_tokens: Mutex<Vec<String>>,
    pub delay: Mutex<Duration>,
    pub checks: AtomicUsize,
    pub heartbeats: Mutex<Vec<ActivityHeartbeat>>,
    pub reports: Mutex<Vec<SuspiciousActivityReport>>,
}

impl Default for FakeAuthority {
    fn default() -> Self {
        Self {
            response: Mutex::new(Ok(metadata(OffsetDateTime::now_utc() - time::Duration::minutes(5)))),
            rejected_tokens: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            checks: AtomicUsize::new(0),
            heartbeats: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        }
    }
}

impl FakeAuthority {
    pub fn respond(&self, response: Result<SessionMetadata, ServiceError>) {
        *self.response.lock() = response;
    }

    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().push(token.to_owned());
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

pub fn metadata(login_time: OffsetDateTime) -> SessionMetadata {
    SessionMetadata {
        session_id: "sess-1".into(),
        login_time,
        last_activity: login_time,
        suspicious_activity: None,
    }
}

pub fn flagged(activity: SuspiciousActivity) -> SessionMetadata {
    SessionMetadata {
        suspicious_activity: Some(activity),
        ..metadata(OffsetDateTime::now_utc() - time::Duration::minutes(5))
    }
}

impl SessionAuthority for FakeAuthority {
    async fn current_session(&self, token: &SecretToken) -> Result<SessionMetadata, ServiceError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;
        if self.rejected_tokens.lock().iter().any(|t| t == token.expose()) {
            return Err(ServiceError::Unauthorized("access token expired".into()));
        }
        self.response.lock().clone()
    }

    async fn record_activity(
        &self,
        _: &SecretToken,
        heartbeat: &ActivityHeartbeat,
    ) -> Result<(), ServiceError> {
        self.heartbeats.lock().push(heartbeat.clone());
        Ok(())
    }

    async fn report_suspicious_activity(
        &self,
        _: &SecretToken,
        report: &SuspiciousActivityReport,
    ) -> Result<(), ServiceError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────────

pub type Controller = SessionController<FakeAccounts, FakeChildren, Arc<MemoryStorage>>;

pub struct Harness {
    pub accounts: Arc<FakeAccounts>,
    pub children: Arc<FakeChildren>,
    pub storage: Arc<MemoryStorage>,
    pub controller: Controller,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    /// A fresh controller over existing storage, as after an app restart.
    pub fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        init_tracing();
        let accounts = Arc::new(FakeAccounts::default());
        let children = Arc::new(FakeChildren::default());
        let controller = SessionController::new(
            Arc::clone(&accounts),
            Arc::clone(&children),
            Arc::clone(&storage),
            SessionConfig::default().with_request_timeout(Duration::from_secs(2)),
        );
        Self {
            accounts,
            children,
            storage,
            controller,
        }
    }

    pub async fn booted() -> Self {
        let harness = Self::new();
        harness.controller.bootstrap().await;
        harness
    }
}
