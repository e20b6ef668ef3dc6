use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::ServiceError;
use crate::session::{
    AccountAuth, ActivityHeartbeat, AuthError, ChildAuth, SessionAuthority, SessionMetadata,
    SuspiciousActivityReport,
};
use crate::types::{AuthResult, ChildLoginResult, NewParentAccount, SecretToken};

/// Study-plan API endpoints, all relative to one base URL.
///
/// ```rust,ignore
/// use studyplan_auth::ApiConfig;
///
/// let config = ApiConfig::new("https://api.studyplan.app/v1/".parse()?)?;
/// assert_eq!(config.login_url().as_str(), "https://api.studyplan.app/v1/auth/login");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ApiConfig {
    pub(crate) base_url: Url,
    pub(crate) login_url: Url,
    pub(crate) register_url: Url,
    pub(crate) refresh_url: Url,
    pub(crate) logout_url: Url,
    pub(crate) child_login_url: Url,
    pub(crate) session_url: Url,
    pub(crate) activity_url: Url,
    pub(crate) suspicious_activity_url: Url,
}

impl ApiConfig {
    /// Build endpoint URLs under `base_url`. A missing trailing slash is
    /// added, so `https://host/v1` and `https://host/v1/` are equivalent.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if `base_url` cannot carry a path
    /// (e.g. `mailto:`).
    pub fn new(mut base_url: Url) -> Result<Self, AuthError> {
        if base_url.cannot_be_a_base() {
            return Err(AuthError::Config(format!("{base_url} cannot be an API base URL")));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let join = |path: &str| {
            base_url
                .join(path)
                .map_err(|e| AuthError::Config(format!("{path}: {e}")))
        };

        Ok(Self {
            login_url: join("auth/login")?,
            register_url: join("auth/register")?,
            refresh_url: join("auth/refresh")?,
            logout_url: join("auth/logout")?,
            child_login_url: join("auth/child-login")?,
            session_url: join("child/session")?,
            activity_url: join("child/activity")?,
            suspicious_activity_url: join("child/suspicious-activity")?,
            base_url,
        })
    }

    /// Create config from `STUDYPLAN_API_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the variable is missing or not a
    /// valid base URL.
    pub fn from_env() -> Result<Self, AuthError> {
        let raw = std::env::var("STUDYPLAN_API_URL")
            .map_err(|_| AuthError::Config("STUDYPLAN_API_URL is required".into()))?;
        let url: Url = raw
            .parse()
            .map_err(|e| AuthError::Config(format!("STUDYPLAN_API_URL: {e}")))?;
        Self::new(url)
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    #[must_use]
    pub fn child_login_url(&self) -> &Url {
        &self.child_login_url
    }

    #[must_use]
    pub fn session_url(&self) -> &Url {
        &self.session_url
    }
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct ChildCredentials<'a> {
    username: &'a str,
    pin: &'a str,
}

/// HTTP implementation of every auth service trait.
pub struct HttpAuthClient {
    config: ApiConfig,
    http: reqwest::Client,
}

impl HttpAuthClient {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    async fn post_json<B, T>(
        &self,
        url: &Url,
        body: &B,
        bearer: Option<&SecretToken>,
        operation: &'static str,
    ) -> Result<T, ServiceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(url.clone()).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token.expose());
        }
        let response = Self::ensure_success(request.send().await?, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    async fn post_unit<B: Serialize + ?Sized>(
        &self,
        url: &Url,
        body: &B,
        token: &SecretToken,
        operation: &'static str,
    ) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(token.expose())
            .json(body)
            .send()
            .await?;
        Self::ensure_success(response, operation).await?;
        Ok(())
    }

    /// Checks HTTP response status; 401 becomes [`ServiceError::Unauthorized`],
    /// any other failure carries status and body.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            tracing::debug!(operation, "Service rejected credentials");
            return Err(ServiceError::Unauthorized(if body.is_empty() {
                format!("{operation} unauthorized")
            } else {
                body
            }));
        }
        Err(ServiceError::Status {
            operation,
            status: status.as_u16(),
            detail: body,
        })
    }
}

impl AccountAuth for HttpAuthClient {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResult, ServiceError> {
        self.post_json(
            &self.config.login_url,
            &Credentials { email, password },
            None,
            "login",
        )
        .await
    }

    async fn register(&self, account: &NewParentAccount) -> Result<AuthResult, ServiceError> {
        self.post_json(&self.config.register_url, account, None, "register")
            .await
    }

    async fn refresh(&self, refresh_token: &SecretToken) -> Result<AuthResult, ServiceError> {
        self.post_json(
            &self.config.refresh_url,
            &RefreshRequest {
                refresh_token: refresh_token.expose(),
            },
            None,
            "token refresh",
        )
        .await
    }

    async fn logout(&self, access_token: &SecretToken) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(self.config.logout_url.clone())
            .bearer_auth(access_token.expose())
            .send()
            .await?;
        Self::ensure_success(response, "logout").await?;
        Ok(())
    }
}

impl ChildAuth for HttpAuthClient {
    async fn child_login(&self, username: &str, pin: &str) -> Result<ChildLoginResult, ServiceError> {
        self.post_json(
            &self.config.child_login_url,
            &ChildCredentials { username, pin },
            None,
            "child login",
        )
        .await
    }
}

impl SessionAuthority for HttpAuthClient {
    async fn current_session(&self, access_token: &SecretToken) -> Result<SessionMetadata, ServiceError> {
        let response = self
            .http
            .get(self.config.session_url.clone())
            .bearer_auth(access_token.expose())
            .send()
            .await?;
        let response = Self::ensure_success(response, "session check").await?;
        response.json::<SessionMetadata>().await.map_err(Into::into)
    }

    async fn record_activity(
        &self,
        access_token: &SecretToken,
        heartbeat: &ActivityHeartbeat,
    ) -> Result<(), ServiceError> {
        self.post_unit(&self.config.activity_url, heartbeat, access_token, "activity heartbeat")
            .await
    }

    async fn report_suspicious_activity(
        &self,
        access_token: &SecretToken,
        report: &SuspiciousActivityReport,
    ) -> Result<(), ServiceError> {
        self.post_unit(
            &self.config.suspicious_activity_url,
            report,
            access_token,
            "suspicious activity report",
        )
        .await
    }
}
