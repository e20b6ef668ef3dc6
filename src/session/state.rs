use super::error::AuthError;
use crate::types::{Principal, Role, SessionRecord};

/// Lifecycle phase of the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `bootstrap()` has not run yet.
    Uninitialized,
    Loading,
    AuthenticatedParent,
    AuthenticatedChild,
    Unauthenticated,
}

impl Phase {
    /// Whether the phase is one of the three settled outcomes.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            Self::AuthenticatedParent | Self::AuthenticatedChild | Self::Unauthenticated
        )
    }
}

/// Externally observable auth state.
///
/// Only produced by the controller, so `is_authenticated` always equals
/// `principal().is_some()` and `is_child` always equals "principal present
/// and a child".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    phase: Phase,
    principal: Option<Principal>,
    error: Option<String>,
    redirect_to: Option<String>,
}

impl AuthState {
    /// True until the first boot attempt has settled.
    #[must_use]
    pub const fn loading(&self) -> bool {
        matches!(self.phase, Phase::Uninitialized | Phase::Loading)
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    #[must_use]
    pub fn is_child(&self) -> bool {
        self.principal.as_ref().is_some_and(Principal::is_child)
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.principal.as_ref().map(Principal::role)
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Display reason of the most recent failed attempt, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Forced redirect requested by the last unresolved auth failure.
    #[must_use]
    pub fn redirect_to(&self) -> Option<&str> {
        self.redirect_to.as_deref()
    }
}

/// The controller's private state. The record is present exactly when the
/// phase is authenticated.
#[derive(Debug)]
pub(crate) struct ControllerState {
    phase: Phase,
    record: Option<SessionRecord>,
    error: Option<AuthError>,
    generation: u64,
    redirects_suppressed: bool,
    redirect_to: Option<String>,
}

impl ControllerState {
    pub(crate) const fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            record: None,
            error: None,
            generation: 0,
            redirects_suppressed: false,
            redirect_to: None,
        }
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn record(&self) -> Option<&SessionRecord> {
        self.record.as_ref()
    }

    pub(crate) const fn redirects_suppressed(&self) -> bool {
        self.redirects_suppressed
    }

    pub(crate) fn suppress_redirects(&mut self) {
        self.redirects_suppressed = true;
    }

    pub(crate) fn begin_loading(&mut self) {
        self.phase = Phase::Loading;
        self.error = None;
        self.redirect_to = None;
    }

    pub(crate) fn set_error(&mut self, error: Option<AuthError>) {
        self.error = error;
    }

    pub(crate) fn set_redirect(&mut self, to: Option<String>) {
        self.redirect_to = to;
    }

    /// Installs a new session. Starts a new generation and lifts redirect
    /// suppression, since the loop it guarded against belongs to the old
    /// session.
    pub(crate) fn authenticate(&mut self, record: SessionRecord) {
        self.phase = match record.role() {
            Role::Parent => Phase::AuthenticatedParent,
            Role::Child => Phase::AuthenticatedChild,
        };
        self.record = Some(record);
        self.error = None;
        self.redirect_to = None;
        self.generation += 1;
        self.redirects_suppressed = false;
    }

    /// Replaces the record of the current session (token refresh) without
    /// starting a new generation.
    pub(crate) fn replace_record(&mut self, record: SessionRecord) {
        self.phase = match record.role() {
            Role::Parent => Phase::AuthenticatedParent,
            Role::Child => Phase::AuthenticatedChild,
        };
        self.record = Some(record);
        self.error = None;
    }

    /// Drops the session. Any pending redirect is cleared; callers that
    /// force one set it afterwards.
    pub(crate) fn unauthenticate(&mut self, error: Option<AuthError>) {
        self.phase = Phase::Unauthenticated;
        if self.record.take().is_some() {
            self.generation += 1;
        }
        self.error = error;
        self.redirect_to = None;
    }

    pub(crate) fn snapshot(&self) -> AuthState {
        AuthState {
            phase: self.phase,
            principal: self.record.as_ref().map(|r| r.principal().clone()),
            error: self.error.as_ref().map(AuthError::reason),
            redirect_to: self.redirect_to.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::types::{AuthResult, ChildPrincipal, ParentPrincipal, SecretToken};

    fn record(principal: Principal) -> SessionRecord {
        SessionRecord::new(
            AuthResult::new(principal, SecretToken::new("a"), SecretToken::new("r")),
            datetime!(2026-03-01 09:00 UTC),
        )
    }

    fn assert_invariants(state: &AuthState) {
        assert_eq!(state.is_authenticated(), state.principal().is_some());
        assert_eq!(
            state.is_child(),
            state.principal().is_some_and(|p| p.role() == Role::Child)
        );
        if !state.loading() {
            assert!(state.phase().is_settled());
        }
    }

    #[test]
    fn invariants_hold_across_transitions() {
        let mut s = ControllerState::new();
        assert!(s.snapshot().loading());
        assert_invariants(&s.snapshot());

        s.begin_loading();
        assert_invariants(&s.snapshot());

        s.authenticate(record(Principal::Child(ChildPrincipal {
            id: "c".into(),
            name: "Mina".into(),
            parent_id: "p".into(),
            age: None,
            grade: None,
        })));
        let child = s.snapshot();
        assert_invariants(&child);
        assert!(child.is_child());
        assert_eq!(child.phase(), Phase::AuthenticatedChild);

        s.unauthenticate(Some(AuthError::SessionExpired));
        let out = s.snapshot();
        assert_invariants(&out);
        assert!(!out.is_authenticated());
        assert!(out.error().is_some());

        s.authenticate(record(Principal::Parent(ParentPrincipal {
            id: "p".into(),
            name: "Jae".into(),
            email: None,
        })));
        let parent = s.snapshot();
        assert_invariants(&parent);
        assert!(!parent.is_child());
        assert!(parent.error().is_none());
    }

    #[test]
    fn generation_moves_only_when_the_session_changes() {
        let mut s = ControllerState::new();
        let parent = record(Principal::Parent(ParentPrincipal {
            id: "p".into(),
            name: "Jae".into(),
            email: None,
        }));

        s.unauthenticate(None);
        assert_eq!(s.generation(), 0);

        s.authenticate(parent.clone());
        assert_eq!(s.generation(), 1);
        s.replace_record(parent);
        assert_eq!(s.generation(), 1);
        s.unauthenticate(None);
        assert_eq!(s.generation(), 2);
    }

    #[test]
    fn new_session_lifts_redirect_suppression() {
        let mut s = ControllerState::new();
        s.suppress_redirects();
        assert!(s.redirects_suppressed());
        s.authenticate(record(Principal::Parent(ParentPrincipal {
            id: "p".into(),
            name: "Jae".into(),
            email: None,
        })));
        assert!(!s.redirects_suppressed());
    }
}
