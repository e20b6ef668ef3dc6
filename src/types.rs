use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::error::ServiceError;

/// Server-assigned account identifier (parent or child).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

/// Server-issued session correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl From<&str> for PrincipalId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Role tag of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display("parent")]
    Parent,
    #[display("child")]
    Child,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }

    /// Parses the lowercase wire form; anything else is `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parent" => Some(Self::Parent),
            "child" => Some(Self::Child),
            _ => None,
        }
    }
}

/// A parent (account holder) principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentPrincipal {
    pub id: PrincipalId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A PIN-authenticated child principal.
///
/// `parent_id` is a back-reference only; the parent account is never loaded
/// through it here. `age` and `grade` are carried for downstream features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildPrincipal {
    pub id: PrincipalId,
    pub name: String,
    pub parent_id: PrincipalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
}

/// The authenticated identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Principal {
    Parent(ParentPrincipal),
    Child(ChildPrincipal),
}

impl Principal {
    #[must_use]
    pub fn id(&self) -> &PrincipalId {
        match self {
            Self::Parent(p) => &p.id,
            Self::Child(c) => &c.id,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Parent(p) => &p.name,
            Self::Child(c) => &c.name,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Parent(_) => Role::Parent,
            Self::Child(_) => Role::Child,
        }
    }

    #[must_use]
    pub const fn is_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }

    /// Structural checks beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns a description of the first empty required field.
    pub fn check(&self) -> Result<(), String> {
        if self.id().0.trim().is_empty() {
            return Err("principal id is empty".into());
        }
        if self.name().trim().is_empty() {
            return Err("principal name is empty".into());
        }
        if let Self::Child(child) = self {
            if child.parent_id.0.trim().is_empty() {
                return Err("child principal has no parent id".into());
            }
        }
        Ok(())
    }
}

/// Opaque bearer or refresh token.
///
/// Formatting never reveals the value; use [`fingerprint`](Self::fingerprint)
/// when a token has to be correlated in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token, for attaching to a request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First 8 hex digits of the SHA-256 of the token.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretToken({})", self.fingerprint())
    }
}

impl std::fmt::Display for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token:{}", self.fingerprint())
    }
}

/// Token pair and identity returned by a successful login, registration or
/// refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct AuthResult {
    pub principal: Principal,
    pub access_token: SecretToken,
    pub refresh_token: SecretToken,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Access token lifetime in seconds, when the service reports it.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl AuthResult {
    #[must_use]
    pub fn new(principal: Principal, access_token: SecretToken, refresh_token: SecretToken) -> Self {
        Self {
            principal,
            access_token,
            refresh_token,
            session_id: None,
            expires_in: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_expires_in(mut self, seconds: u64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    /// Boundary validation: a result that fails here never reaches a
    /// session record.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidResponse`] for empty tokens or a
    /// malformed principal.
    pub fn validate(self) -> Result<Self, ServiceError> {
        if self.access_token.is_empty() {
            return Err(ServiceError::InvalidResponse("empty access token".into()));
        }
        if self.refresh_token.is_empty() {
            return Err(ServiceError::InvalidResponse("empty refresh token".into()));
        }
        self.principal.check().map_err(ServiceError::InvalidResponse)?;
        Ok(self)
    }
}

/// Result of a child PIN login. The principal is a child by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChildLoginResult {
    pub principal: ChildPrincipal,
    pub access_token: SecretToken,
    pub refresh_token: SecretToken,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl ChildLoginResult {
    #[must_use]
    pub fn new(
        principal: ChildPrincipal,
        access_token: SecretToken,
        refresh_token: SecretToken,
    ) -> Self {
        Self {
            principal,
            access_token,
            refresh_token,
            session_id: None,
            expires_in: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl From<ChildLoginResult> for AuthResult {
    fn from(r: ChildLoginResult) -> Self {
        Self {
            principal: Principal::Child(r.principal),
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            session_id: r.session_id,
            expires_in: r.expires_in,
        }
    }
}

/// Registration payload for a new parent account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewParentAccount {
    pub email: String,
    pub name: String,
    pub password: String,
}

/// An active login, as held by the controller and persisted by the store.
///
/// Holding a `SessionRecord` proves it is complete: `role` always equals
/// `principal.role()`. Partial records only exist as
/// [`StoredSession`](crate::store::StoredSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    principal: Principal,
    role: Role,
    pub access_token: SecretToken,
    pub refresh_token: SecretToken,
    pub login_time: OffsetDateTime,
    pub session_id: Option<SessionId>,
    pub last_activity: Option<OffsetDateTime>,
    pub access_expires_at: Option<OffsetDateTime>,
}

impl SessionRecord {
    /// Builds a fresh record from a validated auth result.
    #[must_use]
    pub fn new(result: AuthResult, now: OffsetDateTime) -> Self {
        let access_expires_at = result.expires_in.map(|s| now + Duration::seconds(s as i64));
        let last_activity = result.principal.is_child().then_some(now);
        Self {
            role: result.principal.role(),
            principal: result.principal,
            access_token: result.access_token,
            refresh_token: result.refresh_token,
            login_time: now,
            session_id: result.session_id,
            last_activity,
            access_expires_at,
        }
    }

    /// Assembles a record from already-validated parts.
    pub(crate) fn from_parts(
        principal: Principal,
        access_token: SecretToken,
        refresh_token: SecretToken,
        login_time: OffsetDateTime,
    ) -> Self {
        Self {
            role: principal.role(),
            principal,
            access_token,
            refresh_token,
            login_time,
            session_id: None,
            last_activity: None,
            access_expires_at: None,
        }
    }

    /// Applies a refreshed token pair, keeping the original login time.
    ///
    /// The principal is replaced by the refreshed one; a server-issued
    /// session id replaces the old one only when present.
    #[must_use]
    pub fn refreshed(&self, result: AuthResult, now: OffsetDateTime) -> Self {
        let mut next = Self::new(result, now);
        next.login_time = self.login_time;
        if next.session_id.is_none() {
            next.session_id.clone_from(&self.session_id);
        }
        if next.role == Role::Child {
            next.last_activity = self.last_activity.or(Some(now));
        }
        next
    }

    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn is_child(&self) -> bool {
        matches!(self.role, Role::Child)
    }

    /// True when the access token is known to expire within `skew` of `now`.
    /// An unknown expiry counts as expiring.
    #[must_use]
    pub fn access_expires_within(&self, skew: std::time::Duration, now: OffsetDateTime) -> bool {
        match self.access_expires_at {
            Some(at) => at - now <= skew,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn child() -> ChildPrincipal {
        ChildPrincipal {
            id: "child-1".into(),
            name: "Mina".into(),
            parent_id: "parent-1".into(),
            age: Some(9),
            grade: Some("4".into()),
        }
    }

    #[test]
    fn principal_serializes_with_role_tag() {
        let json = serde_json::to_value(Principal::Child(child())).unwrap();
        assert_eq!(json["role"], "child");
        assert_eq!(json["parentId"], "parent-1");

        let parent: Principal = serde_json::from_value(serde_json::json!({
            "role": "parent",
            "id": "p-9",
            "name": "Jae",
        }))
        .unwrap();
        assert_eq!(parent.role(), Role::Parent);
        assert_eq!(parent.id(), &PrincipalId::from("p-9"));
    }

    #[test]
    fn principal_check_rejects_blank_fields() {
        let mut c = child();
        c.parent_id = " ".into();
        assert!(Principal::Child(c).check().is_err());
        assert!(Principal::Child(child()).check().is_ok());
    }

    #[test]
    fn secret_token_never_formats_its_value() {
        let token = SecretToken::new("super-secret-refresh");
        assert!(!format!("{token:?}").contains("super-secret"));
        assert!(!token.to_string().contains("super-secret"));
        assert_eq!(token.fingerprint().len(), 8);
        assert_eq!(token.fingerprint(), SecretToken::new("super-secret-refresh").fingerprint());
    }

    #[test]
    fn auth_result_validation_rejects_empty_tokens() {
        let result = AuthResult::new(
            Principal::Child(child()),
            SecretToken::new(""),
            SecretToken::new("r"),
        );
        assert!(matches!(result.validate(), Err(ServiceError::InvalidResponse(_))));
    }

    #[test]
    fn record_role_follows_principal() {
        let now = datetime!(2026-03-01 10:00 UTC);
        let record = SessionRecord::new(
            ChildLoginResult::new(child(), SecretToken::new("a"), SecretToken::new("r")).into(),
            now,
        );
        assert_eq!(record.role(), Role::Child);
        assert!(record.is_child());
        assert_eq!(record.last_activity, Some(now));
    }

    #[test]
    fn refreshed_record_keeps_login_time_and_session_id() {
        let login = datetime!(2026-03-01 10:00 UTC);
        let later = datetime!(2026-03-01 10:30 UTC);
        let first = SessionRecord::new(
            AuthResult::new(
                Principal::Child(child()),
                SecretToken::new("a1"),
                SecretToken::new("r1"),
            )
            .with_session_id("s-1"),
            login,
        );
        let next = first.refreshed(
            AuthResult::new(
                Principal::Child(child()),
                SecretToken::new("a2"),
                SecretToken::new("r2"),
            ),
            later,
        );
        assert_eq!(next.login_time, login);
        assert_eq!(next.session_id, Some(SessionId::from("s-1")));
        assert_eq!(next.access_token.expose(), "a2");
    }

    #[test]
    fn expiry_window() {
        let now = datetime!(2026-03-01 10:00 UTC);
        let record = SessionRecord::new(
            AuthResult::new(
                Principal::Child(child()),
                SecretToken::new("a"),
                SecretToken::new("r"),
            )
            .with_expires_in(600),
            now,
        );
        let skew = std::time::Duration::from_secs(60);
        assert!(!record.access_expires_within(skew, now));
        assert!(record.access_expires_within(skew, now + Duration::minutes(9) + Duration::seconds(30)));
    }
}
