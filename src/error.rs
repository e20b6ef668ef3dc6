/// Failure reported by an external auth collaborator (account, child or
/// session-authority service).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The service rejected the credential (HTTP 401).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The service answered with a non-success status other than 401.
    #[error("{operation} failed with status {status}: {detail}")]
    Status {
        operation: &'static str,
        status: u16,
        detail: String,
    },

    /// The request never produced a response (connect, reset, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The service answered, but the payload failed boundary validation.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether retrying the same call later could succeed.
    ///
    /// Network failures and server-side (5xx) or throttling (429) statuses
    /// are transient; credential and payload problems are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Unauthorized(_) | Self::InvalidResponse(_) => false,
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Durable client storage failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ServiceError::Network("reset".into()).is_transient());
        assert!(
            ServiceError::Status {
                operation: "refresh",
                status: 503,
                detail: String::new(),
            }
            .is_transient()
        );
        assert!(
            !ServiceError::Status {
                operation: "refresh",
                status: 400,
                detail: String::new(),
            }
            .is_transient()
        );
        assert!(!ServiceError::Unauthorized("expired".into()).is_transient());
        assert!(!ServiceError::InvalidResponse("empty token".into()).is_transient());
    }

    #[test]
    fn unauthorized_is_detected() {
        assert!(ServiceError::Unauthorized("nope".into()).is_unauthorized());
        assert!(!ServiceError::Network("nope".into()).is_unauthorized());
    }
}
