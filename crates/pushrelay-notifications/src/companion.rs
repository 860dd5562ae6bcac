//! Subscription cleanup against the companion wiki API.
//!
//! Deleting a subscription needs a CSRF token. When the session is anonymous the API hands out
//! the sentinel token `+\`; the flow then logs in with the service account once and retries.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::dispatch::TokenInvalidator;
use crate::error::PushError;
use crate::metrics;
use crate::provider::http_client;

/// CSRF token handed out to anonymous sessions
pub const ANONYMOUS_TOKEN: &str = "+\\";

pub const DEFAULT_COMPANION_ENDPOINT: &str = "https://meta.wikimedia.org/w/api.php";

/// Companion API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Service account allowed to manage push subscriptions
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_endpoint() -> String {
    DEFAULT_COMPANION_ENDPOINT.to_string()
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            username: None,
            password: None,
        }
    }
}

impl CompanionConfig {
    pub fn validate(&self) -> Result<(), PushError> {
        if !self.enabled {
            return Ok(());
        }
        Url::parse(&self.endpoint).map_err(|e| {
            PushError::InvalidConfig(format!("invalid companion endpoint '{}': {e}", self.endpoint))
        })?;
        if self.username.is_some() != self.password.is_some() {
            return Err(PushError::InvalidConfig(
                "companion.username and companion.password must be set together".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Csrf,
    Login,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Csrf => "csrf",
            Self::Login => "login",
        }
    }

    fn field(&self) -> &'static str {
        match self {
            Self::Csrf => "csrftoken",
            Self::Login => "logintoken",
        }
    }
}

/// Cookie state for one cleanup attempt.
///
/// Cookies are scoped to the host that set them, and a new session is created for every
/// attempt so concurrent cleanups never share a login.
#[derive(Default)]
pub struct Session {
    jar: Jar,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, url: &Url, headers: &reqwest::header::HeaderMap) {
        let mut cookies = headers.get_all(SET_COOKIE).iter();
        self.jar.set_cookies(&mut cookies, url);
    }

    fn cookies(&self, url: &Url) -> Option<reqwest::header::HeaderValue> {
        self.jar.cookies(url)
    }
}

/// Successful companion API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// The `error` object of an API-level failure, if any.
    pub fn api_error(&self) -> Option<&Value> {
        self.body.get("error")
    }

    fn error_info(&self) -> Option<String> {
        self.api_error().map(|err| {
            let code = err["code"].as_str().unwrap_or("unknown");
            let info = err["info"].as_str().unwrap_or_default();
            format!("{code}: {info}")
        })
    }
}

/// Thin client for the companion action API
pub struct CompanionApi {
    http_client: Client,
    endpoint: Url,
    credentials: Option<(String, String)>,
}

impl CompanionApi {
    pub fn from_config(config: &CompanionConfig, proxy: Option<&str>) -> Result<Self, PushError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            PushError::InvalidConfig(format!("invalid companion endpoint '{}': {e}", config.endpoint))
        })?;
        let credentials = config.username.clone().zip(config.password.clone());

        Ok(Self {
            http_client: http_client(proxy)?,
            endpoint,
            credentials,
        })
    }

    /// Form-encoded POST to the API. Statuses outside 200..=399 are errors.
    pub async fn post(
        &self,
        session: &Session,
        params: &[(&str, &str)],
    ) -> Result<ApiResponse, PushError> {
        let mut form = params.to_vec();
        form.push(("format", "json"));

        let mut request = self.http_client.post(self.endpoint.clone()).form(&form);
        if let Some(cookies) = session.cookies(&self.endpoint) {
            request = request.header(COOKIE, cookies);
        }

        let response = request.send().await?;
        session.store(&self.endpoint, response.headers());

        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..=399).contains(&status) {
            return Err(PushError::CompanionHttp { status, body: text });
        }

        let body = serde_json::from_str(&text)
            .map_err(|e| PushError::UnexpectedResponse(format!("invalid JSON body: {e}")))?;
        Ok(ApiResponse { status, body })
    }

    pub async fn get_token(&self, session: &Session, kind: TokenKind) -> Result<String, PushError> {
        let response = self
            .post(
                session,
                &[("action", "query"), ("meta", "tokens"), ("type", kind.as_str())],
            )
            .await?;

        if let Some(token) = response.body["query"]["tokens"][kind.field()].as_str() {
            return Ok(token.to_string());
        }
        Err(PushError::UnexpectedResponse(match response.error_info() {
            Some(info) => format!("token request failed: {info}"),
            None => format!("response has no {}", kind.field()),
        }))
    }

    /// Log the session in with the configured service account.
    pub async fn login(&self, session: &Session) -> Result<ApiResponse, PushError> {
        let (username, password) = self.credentials.as_ref().ok_or_else(|| {
            PushError::InvalidConfig("companion API credentials are not configured".into())
        })?;

        let login_token = self.get_token(session, TokenKind::Login).await?;
        let response = self
            .post(
                session,
                &[
                    ("action", "clientlogin"),
                    ("username", username.as_str()),
                    ("password", password.as_str()),
                    ("logintoken", login_token.as_str()),
                    ("loginreturnurl", self.endpoint.as_str()),
                ],
            )
            .await?;

        if let Some(info) = response.error_info() {
            return Err(PushError::LoginFailed(info));
        }
        match response.body["clientlogin"]["status"].as_str() {
            Some("PASS") => {
                info!(username = %username, "Logged in to companion API");
                Ok(response)
            }
            status => {
                let message = response.body["clientlogin"]["message"]
                    .as_str()
                    .unwrap_or_default();
                Err(PushError::LoginFailed(format!(
                    "{}: {message}",
                    status.unwrap_or("no status")
                )))
            }
        }
    }
}

/// Deletes the subscriptions of tokens that providers rejected.
pub struct SubscriptionCleaner {
    api: Arc<CompanionApi>,
}

impl SubscriptionCleaner {
    pub fn new(api: Arc<CompanionApi>) -> Self {
        Self { api }
    }

    pub async fn delete_subscriptions(&self, tokens: &[String]) -> Result<ApiResponse, PushError> {
        metrics::record_invalidation_request();

        let result = self.try_delete(tokens).await;
        if let Err(e) = &result {
            error!(count = tokens.len(), error = %e, "mwapi subscription delete failed");
        }
        result
    }

    async fn try_delete(&self, tokens: &[String]) -> Result<ApiResponse, PushError> {
        let session = Session::new();
        let mut logged_in = false;

        let csrf_token = loop {
            let token = self.api.get_token(&session, TokenKind::Csrf).await?;
            if token != ANONYMOUS_TOKEN {
                break token;
            }
            if logged_in {
                return Err(PushError::AnonymousAfterLogin);
            }
            debug!("Companion API session is anonymous; logging in");
            self.api.login(&session).await?;
            logged_in = true;
        };

        let provider_tokens = tokens.join("|");
        let response = self
            .api
            .post(
                &session,
                &[
                    ("action", "echopushsubscriptions"),
                    ("command", "delete"),
                    ("providertoken", provider_tokens.as_str()),
                    ("token", csrf_token.as_str()),
                ],
            )
            .await?;

        // An API-level error here does not fail the cleanup.
        match response.error_info() {
            Some(info) => warn!(count = tokens.len(), error = %info, "Subscription delete rejected by API"),
            None => debug!(count = tokens.len(), "Deleted subscriptions"),
        }

        Ok(response)
    }
}

#[async_trait]
impl TokenInvalidator for SubscriptionCleaner {
    async fn invalidate(&self, tokens: &[String]) -> Result<(), PushError> {
        self.delete_subscriptions(tokens).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_token_is_plus_backslash() {
        assert_eq!(ANONYMOUS_TOKEN.len(), 2);
        assert_eq!(ANONYMOUS_TOKEN, r"+\");
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let cfg = CompanionConfig {
            enabled: true,
            username: Some("SubscriptionManager".into()),
            ..CompanionConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = CompanionConfig {
            enabled: true,
            endpoint: "not a url".into(),
            ..CompanionConfig::default()
        };
        assert!(cfg.validate().is_err());

        assert!(CompanionConfig::default().validate().is_ok());
    }

    #[test]
    fn api_error_info_is_formatted() {
        let response = ApiResponse {
            status: 200,
            body: serde_json::json!({
                "error": { "code": "badtoken", "info": "Invalid CSRF token." }
            }),
        };
        assert_eq!(
            response.error_info().as_deref(),
            Some("badtoken: Invalid CSRF token.")
        );
    }
}
