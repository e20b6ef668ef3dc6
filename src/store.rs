//! Persisted session state: durable key/value backends and the session
//! store that validates and repairs what it reads back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::StorageError;
use crate::types::{Principal, Role, SecretToken, SessionId, SessionRecord};

/// Storage key holding the serialized session record.
pub const SESSION_KEY: &str = "session";
/// Storage key holding the denormalized role flag.
pub const ROLE_KEY: &str = "session_role";

/// Durable client-side key/value storage.
///
/// Mirrors browser local storage: synchronous, string values, and allowed to
/// fail (quota, I/O).
pub trait KeyValueStorage: Send + Sync + 'static {
    /// Reads a value.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process storage. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

impl<T: KeyValueStorage> KeyValueStorage for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// Storage backed by a single JSON object file.
///
/// Every write rewrites the whole map through a sibling temp file followed by
/// a rename, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(map)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_owned(), value.to_owned());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Persisted wire form of a session record.
///
/// Every field is optional: this is what actually sits in storage, including
/// partially written or hand-edited records. Only [`SessionStore::validate`]
/// turns it into a [`SessionRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<String>,
}

impl StoredSession {
    /// Wire form of a complete record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the principal or a timestamp cannot be
    /// serialized.
    pub fn from_record(record: &SessionRecord) -> Result<Self, StorageError> {
        let format = |t: OffsetDateTime| {
            t.format(&Rfc3339)
                .map_err(|e| StorageError::Backend(format!("timestamp: {e}")))
        };
        Ok(Self {
            principal: Some(serde_json::to_value(record.principal())?),
            role: Some(record.role().as_str().to_owned()),
            access_token: Some(record.access_token.expose().to_owned()),
            refresh_token: Some(record.refresh_token.expose().to_owned()),
            login_time: Some(format(record.login_time)?),
            session_id: record.session_id.as_ref().map(|s| s.0.clone()),
            last_activity: record.last_activity.map(format).transpose()?,
            access_expires_at: record.access_expires_at.map(format).transpose()?,
        })
    }

    fn parsed_principal(&self) -> Option<Result<Principal, String>> {
        self.principal.as_ref().map(|value| {
            let principal: Principal =
                serde_json::from_value(value.clone()).map_err(|e| format!("malformed principal: {e}"))?;
            principal.check().map(|()| principal).map_err(|e| format!("malformed principal: {e}"))
        })
    }
}

/// Outcome of [`SessionStore::validate`].
///
/// `data` is only ever present together with `is_valid == true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub data: Option<SessionRecord>,
}

/// Single-writer persistence for the current session.
pub struct SessionStore<K> {
    storage: K,
}

impl<K: KeyValueStorage> SessionStore<K> {
    #[must_use]
    pub fn new(storage: K) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &K {
        &self.storage
    }

    /// Reads the persisted record. Missing, unreadable and undecodable state
    /// all read as `None`.
    #[must_use]
    pub fn load(&self) -> Option<StoredSession> {
        let raw = match self.storage.get(SESSION_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "Session storage read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::warn!(error = %e, "Persisted session is not decodable");
                None
            }
        }
    }

    /// Overwrites the persisted record and the role flag.
    ///
    /// If the role flag cannot be written the previous record is put back,
    /// so the two keys never disagree and a good session is never lost.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if serialization or either write fails.
    pub fn save(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&StoredSession::from_record(record)?)?;
        let previous = self.storage.get(SESSION_KEY).ok().flatten();
        self.storage.set(SESSION_KEY, &raw)?;
        if let Err(e) = self.storage.set(ROLE_KEY, record.role().as_str()) {
            tracing::error!(error = %e, "Role flag write failed, rolling back session write");
            let restored = match &previous {
                Some(prior) => self.storage.set(SESSION_KEY, prior),
                None => self.storage.remove(SESSION_KEY),
            };
            if let Err(rollback) = restored {
                tracing::error!(error = %rollback, "Session rollback failed, clearing");
                self.clear();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Removes every session key. Safe to call repeatedly.
    pub fn clear(&self) {
        for key in [SESSION_KEY, ROLE_KEY] {
            if let Err(e) = self.storage.remove(key) {
                tracing::error!(key, error = %e, "Session storage remove failed");
            }
        }
    }

    /// Fast-path role flag, read without decoding the record.
    ///
    /// A cache only: it is never trusted over a validated record.
    #[must_use]
    pub fn cached_role(&self) -> Option<Role> {
        self.storage
            .get(ROLE_KEY)
            .ok()
            .flatten()
            .and_then(|r| Role::parse(&r))
    }

    /// Structural validation of a persisted record. Does not mutate.
    #[must_use]
    pub fn validate(&self, stored: &StoredSession) -> ValidationResult {
        validate_stored(stored)
    }

    /// Repairs recoverable corruption in place.
    ///
    /// The only recoverable case is a missing role next to a well-formed
    /// principal; the role is re-derived from the principal. Tokens and
    /// principal fields are never invented. Returns whether the record is
    /// valid afterwards.
    pub fn repair(&self, stored: &mut StoredSession) -> bool {
        if stored.role.is_none() {
            if let Some(Ok(principal)) = stored.parsed_principal() {
                stored.role = Some(principal.role().as_str().to_owned());
            }
        }
        validate_stored(stored).is_valid
    }

    /// Load, validate, repair if needed, and clear what cannot be repaired.
    ///
    /// A repaired record is written back so the next load is clean.
    #[must_use]
    pub fn restore(&self) -> Restored {
        let Some(mut stored) = self.load() else {
            return Restored::Empty;
        };
        let first = validate_stored(&stored);
        if let Some(record) = first.data {
            return Restored::Valid(record);
        }

        tracing::warn!(errors = ?first.errors, "Persisted session is corrupted, attempting repair");
        let repaired = if self.repair(&mut stored) {
            validate_stored(&stored).data
        } else {
            None
        };
        let Some(record) = repaired else {
            tracing::warn!("Persisted session could not be repaired, clearing");
            self.clear();
            return Restored::Corrupted(first.errors);
        };

        if let Err(e) = self.save(&record) {
            tracing::error!(error = %e, "Failed to persist repaired session");
        }
        tracing::info!(role = %record.role(), "Persisted session repaired");
        Restored::Repaired(record)
    }
}

/// Outcome of [`SessionStore::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    /// Nothing usable was stored.
    Empty,
    Valid(SessionRecord),
    /// The record was corrupted but recoverable; it has been rewritten.
    Repaired(SessionRecord),
    /// The record was corrupted beyond repair and has been cleared. Carries
    /// the validation errors.
    Corrupted(Vec<String>),
}

impl Restored {
    /// The usable record, if any.
    #[must_use]
    pub fn into_record(self) -> Option<SessionRecord> {
        match self {
            Self::Valid(record) | Self::Repaired(record) => Some(record),
            Self::Empty | Self::Corrupted(_) => None,
        }
    }
}

fn validate_stored(stored: &StoredSession) -> ValidationResult {
    let mut errors = Vec::new();

    let principal = match stored.parsed_principal() {
        None => {
            errors.push("missing principal".to_owned());
            None
        }
        Some(Err(e)) => {
            errors.push(e);
            None
        }
        Some(Ok(p)) => Some(p),
    };

    match stored.role.as_deref() {
        None => errors.push("missing role".to_owned()),
        Some(raw) => match (Role::parse(raw), &principal) {
            (None, _) => errors.push(format!("unknown role '{raw}'")),
            (Some(role), Some(p)) if role != p.role() => errors.push(format!(
                "role '{role}' does not match principal role '{}'",
                p.role()
            )),
            _ => {}
        },
    }

    let access_token = non_empty(stored.access_token.as_deref());
    if access_token.is_none() {
        errors.push("missing access token".to_owned());
    }
    let refresh_token = non_empty(stored.refresh_token.as_deref());
    if refresh_token.is_none() {
        errors.push("missing refresh token".to_owned());
    }

    let login_time = match stored.login_time.as_deref() {
        None => {
            errors.push("missing login time".to_owned());
            None
        }
        Some(raw) => parse_time("login time", raw, &mut errors),
    };
    let last_activity = stored
        .last_activity
        .as_deref()
        .and_then(|raw| parse_time("last activity", raw, &mut errors));
    let access_expires_at = stored
        .access_expires_at
        .as_deref()
        .and_then(|raw| parse_time("access expiry", raw, &mut errors));

    if !errors.is_empty() {
        return ValidationResult {
            is_valid: false,
            errors,
            data: None,
        };
    }

    let data = match (principal, access_token, refresh_token, login_time) {
        (Some(principal), Some(access), Some(refresh), Some(login_time)) => {
            let mut record = SessionRecord::from_parts(
                principal,
                SecretToken::new(access),
                SecretToken::new(refresh),
                login_time,
            );
            record.session_id = non_empty(stored.session_id.as_deref()).map(SessionId::from);
            record.last_activity = last_activity;
            record.access_expires_at = access_expires_at;
            Some(record)
        }
        _ => None,
    };

    ValidationResult {
        is_valid: data.is_some(),
        errors,
        data,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_time(field: &str, raw: &str, errors: &mut Vec<String>) -> Option<OffsetDateTime> {
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(t) => Some(t),
        Err(e) => {
            errors.push(format!("malformed {field}: {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthResult, ChildPrincipal, ParentPrincipal};
    use time::macros::datetime;

    fn parent_record() -> SessionRecord {
        SessionRecord::new(
            AuthResult::new(
                Principal::Parent(ParentPrincipal {
                    id: "p-1".into(),
                    name: "Jae".into(),
                    email: Some("jae@example.com".into()),
                }),
                SecretToken::new("access-1"),
                SecretToken::new("refresh-1"),
            ),
            datetime!(2026-03-01 09:00 UTC),
        )
    }

    fn child_record() -> SessionRecord {
        SessionRecord::new(
            AuthResult::new(
                Principal::Child(ChildPrincipal {
                    id: "c-1".into(),
                    name: "Mina".into(),
                    parent_id: "p-1".into(),
                    age: Some(8),
                    grade: None,
                }),
                SecretToken::new("access-c"),
                SecretToken::new("refresh-c"),
            )
            .with_session_id("sess-7"),
            datetime!(2026-03-01 09:00 UTC),
        )
    }

    /// Storage whose writes to one key always fail.
    struct FailingKey(MemoryStorage, &'static str);

    impl KeyValueStorage for FailingKey {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.1 {
                return Err(StorageError::Backend("quota exceeded".into()));
            }
            self.0.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.0.remove(key)
        }
    }

    #[test]
    fn save_then_restore() {
        let store = SessionStore::new(MemoryStorage::new());
        let record = child_record();
        store.save(&record).unwrap();

        assert_eq!(store.cached_role(), Some(Role::Child));
        assert_eq!(store.restore(), Restored::Valid(record));
    }

    #[test]
    fn clear_is_idempotent() {
        let store = SessionStore::new(MemoryStorage::new());
        store.clear();
        store.clear();
        assert!(store.load().is_none());

        store.save(&parent_record()).unwrap();
        store.clear();
        store.clear();
        assert!(store.storage().is_empty());
    }

    #[test]
    fn undecodable_state_reads_as_absent() {
        let store = SessionStore::new(MemoryStorage::new());
        store.storage().set(SESSION_KEY, "{not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn validate_reports_errors_in_order() {
        let store = SessionStore::new(MemoryStorage::new());
        let result = store.validate(&StoredSession::default());
        assert!(!result.is_valid);
        assert!(result.data.is_none());
        assert_eq!(
            result.errors,
            vec![
                "missing principal",
                "missing role",
                "missing access token",
                "missing refresh token",
                "missing login time",
            ]
        );
    }

    #[test]
    fn validate_detects_role_mismatch() {
        let store = SessionStore::new(MemoryStorage::new());
        let mut stored = StoredSession::from_record(&child_record()).unwrap();
        stored.role = Some("parent".into());
        let result = store.validate(&stored);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("does not match"));
    }

    #[test]
    fn validate_detects_malformed_timestamp() {
        let store = SessionStore::new(MemoryStorage::new());
        let mut stored = StoredSession::from_record(&parent_record()).unwrap();
        stored.login_time = Some("yesterday".into());
        let result = store.validate(&stored);
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("malformed login time"));
    }

    #[test]
    fn repair_rederives_missing_role() {
        let store = SessionStore::new(MemoryStorage::new());
        for record in [parent_record(), child_record()] {
            let mut stored = StoredSession::from_record(&record).unwrap();
            stored.role = None;
            assert!(store.repair(&mut stored));
            assert_eq!(stored.role.as_deref(), Some(record.role().as_str()));
            assert_eq!(store.validate(&stored).data, Some(record));
        }
    }

    #[test]
    fn repair_never_invents_tokens_or_principal() {
        let store = SessionStore::new(MemoryStorage::new());

        let mut no_principal = StoredSession::from_record(&child_record()).unwrap();
        no_principal.principal = None;
        no_principal.role = None;
        assert!(!store.repair(&mut no_principal));
        assert!(no_principal.role.is_none());

        let mut no_refresh = StoredSession::from_record(&child_record()).unwrap();
        no_refresh.role = None;
        no_refresh.refresh_token = None;
        assert!(!store.repair(&mut no_refresh));
        assert!(no_refresh.refresh_token.is_none());

        let mut no_access = StoredSession::from_record(&parent_record()).unwrap();
        no_access.access_token = Some(String::new());
        assert!(!store.repair(&mut no_access));
    }

    #[test]
    fn restore_repairs_and_writes_back() {
        let store = SessionStore::new(MemoryStorage::new());
        let record = parent_record();
        let mut stored = StoredSession::from_record(&record).unwrap();
        stored.role = None;
        store
            .storage()
            .set(SESSION_KEY, &serde_json::to_string(&stored).unwrap())
            .unwrap();

        assert_eq!(store.restore(), Restored::Repaired(record));
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.role.as_deref(), Some("parent"));
        assert_eq!(store.cached_role(), Some(Role::Parent));
    }

    #[test]
    fn restore_clears_unrepairable_state() {
        let store = SessionStore::new(MemoryStorage::new());
        let mut stored = StoredSession::from_record(&child_record()).unwrap();
        stored.access_token = None;
        store
            .storage()
            .set(SESSION_KEY, &serde_json::to_string(&stored).unwrap())
            .unwrap();
        store.storage().set(ROLE_KEY, "child").unwrap();

        match store.restore() {
            Restored::Corrupted(errors) => assert_eq!(errors, vec!["missing access token"]),
            other => panic!("expected corrupted, got {other:?}"),
        }
        assert!(store.storage().is_empty());
    }

    #[test]
    fn failed_role_write_rolls_back_record() {
        let store = SessionStore::new(FailingKey(MemoryStorage::new(), ROLE_KEY));
        assert!(store.save(&parent_record()).is_err());
        assert!(store.load().is_none());
    }

    #[test]
    fn failed_role_write_keeps_the_previous_session() {
        let seed = SessionStore::new(MemoryStorage::new());
        seed.save(&parent_record()).unwrap();
        let storage = MemoryStorage::new();
        for key in [SESSION_KEY, ROLE_KEY] {
            storage
                .set(key, &seed.storage().get(key).unwrap().unwrap())
                .unwrap();
        }

        let store = SessionStore::new(FailingKey(storage, ROLE_KEY));
        assert!(store.save(&child_record()).is_err());
        assert_eq!(store.cached_role(), Some(Role::Parent));
        assert_eq!(store.restore(), Restored::Valid(parent_record()));
    }

    #[test]
    fn failed_record_write_reads_as_nothing_stored() {
        let store = SessionStore::new(FailingKey(MemoryStorage::new(), SESSION_KEY));
        assert!(store.save(&parent_record()).is_err());
        assert_eq!(store.restore(), Restored::Empty);
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = SessionStore::new(FileStorage::new(&path));
        store.save(&child_record()).unwrap();

        let reopened = SessionStore::new(FileStorage::new(&path));
        assert_eq!(reopened.restore().into_record(), Some(child_record()));

        reopened.clear();
        reopened.clear();
        assert!(SessionStore::new(FileStorage::new(&path)).load().is_none());
    }
}
