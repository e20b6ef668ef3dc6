use std::str::FromStr;
use std::time::Duration;

use super::error::AuthError;
use crate::loop_detector::{DEFAULT_LOOP_THRESHOLD, DEFAULT_LOOP_WINDOW};

/// Session controller configuration.
///
/// Everything has a default; override with the `with_*` methods or read
/// overrides from the environment with [`from_env()`](SessionConfig::from_env).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub(crate) request_timeout: Duration,
    pub(crate) refresh_skew: Duration,
    pub(crate) loop_threshold: usize,
    pub(crate) loop_window: Duration,
    pub(crate) parent_login_path: String,
    pub(crate) child_login_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            refresh_skew: Duration::from_secs(60),
            loop_threshold: DEFAULT_LOOP_THRESHOLD,
            loop_window: DEFAULT_LOOP_WINDOW,
            parent_login_path: "/login".into(),
            child_login_path: "/child/login".into(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with overrides from environment variables.
    ///
    /// # Optional env vars
    /// - `STUDYPLAN_REQUEST_TIMEOUT_SECS`: timeout for every auth network call
    /// - `STUDYPLAN_REFRESH_SKEW_SECS`: refresh this long before access token expiry
    /// - `STUDYPLAN_LOOP_THRESHOLD`: redirects to one path that count as a loop
    /// - `STUDYPLAN_LOOP_WINDOW_SECS`: loop detection window
    /// - `STUDYPLAN_PARENT_LOGIN_PATH`: parent login route
    /// - `STUDYPLAN_CHILD_LOGIN_PATH`: child login route
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if a variable is set but unparsable.
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AuthError> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "STUDYPLAN_REQUEST_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(AuthError::Config(
                    "STUDYPLAN_REQUEST_TIMEOUT_SECS must be positive".into(),
                ));
            }
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STUDYPLAN_REFRESH_SKEW_SECS")? {
            config = config.with_refresh_skew(Duration::from_secs(secs));
        }
        if let Some(threshold) = parse_var::<usize>(&lookup, "STUDYPLAN_LOOP_THRESHOLD")? {
            config = config.with_loop_threshold(threshold);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STUDYPLAN_LOOP_WINDOW_SECS")? {
            config = config.with_loop_window(Duration::from_secs(secs));
        }
        if let Some(path) = lookup("STUDYPLAN_PARENT_LOGIN_PATH") {
            config = config.with_parent_login_path(login_path("STUDYPLAN_PARENT_LOGIN_PATH", path)?);
        }
        if let Some(path) = lookup("STUDYPLAN_CHILD_LOGIN_PATH") {
            config = config.with_child_login_path(login_path("STUDYPLAN_CHILD_LOGIN_PATH", path)?);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    #[must_use]
    pub fn with_loop_threshold(mut self, threshold: usize) -> Self {
        self.loop_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_loop_window(mut self, window: Duration) -> Self {
        self.loop_window = window;
        self
    }

    #[must_use]
    pub fn with_parent_login_path(mut self, path: impl Into<String>) -> Self {
        self.parent_login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_child_login_path(mut self, path: impl Into<String>) -> Self {
        self.child_login_path = path.into();
        self
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn parent_login_path(&self) -> &str {
        &self.parent_login_path
    }

    #[must_use]
    pub fn child_login_path(&self) -> &str {
        &self.child_login_path
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, AuthError>
where
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| AuthError::Config(format!("{name}: {e}")))
        })
        .transpose()
}

fn login_path(name: &str, path: String) -> Result<String, AuthError> {
    if path.starts_with('/') {
        Ok(path)
    } else {
        Err(AuthError::Config(format!("{name} must start with '/'")))
    }
}
