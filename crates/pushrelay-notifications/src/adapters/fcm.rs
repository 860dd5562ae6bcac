use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ProviderClient, SendReport, TokenOutcome};
use crate::error::PushError;
use crate::metrics;
use crate::provider::{FcmConfig, http_client};
use crate::types::{MultiDeviceMessage, PushProvider};

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh access tokens this long before Google says they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// FCM error codes that mean the registration token is dead
const PERMANENT_ERROR_CODES: &[&str] = &["UNREGISTERED", "INVALID_ARGUMENT"];

/// Fields of a Google service account key file that we need
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> Result<Self, PushError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PushError::InvalidConfig(format!("cannot read service account '{path}': {e}"))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| PushError::InvalidConfig(format!("invalid service account '{path}': {e}")))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct ServiceAccountAuth {
    http_client: Client,
    client_email: String,
    token_uri: String,
    key_id: Option<String>,
    key: EncodingKey,
    cached: Mutex<Option<(String, Instant)>>,
}

impl ServiceAccountAuth {
    fn new(key: &ServiceAccountKey, http_client: Client) -> Result<Self, PushError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| PushError::InvalidConfig(format!("invalid service account key: {e}")))?;
        Ok(Self {
            http_client,
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            key_id: key.private_key_id.clone(),
            key: encoding_key,
            cached: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, PushError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref()
            && Instant::now() < *expires_at
        {
            return Ok(token.clone());
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = encode(&header, &claims, &self.key)
            .map_err(|e| PushError::ProviderAuth(e.to_string()))?;

        let response = self
            .http_client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| PushError::ProviderAuth(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::ProviderAuth(format!(
                "token exchange returned {status}: {body}"
            )));
        }
        let granted: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| PushError::ProviderAuth(e.to_string()))?;

        let lifetime = Duration::from_secs(granted.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some((granted.access_token.clone(), Instant::now() + lifetime));
        debug!(expires_in = granted.expires_in, "Obtained FCM access token");
        Ok(granted.access_token)
    }
}

enum AccessTokenSource {
    Static(String),
    ServiceAccount(ServiceAccountAuth),
}

impl AccessTokenSource {
    async fn access_token(&self) -> Result<String, PushError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::ServiceAccount(auth) => auth.access_token().await,
        }
    }
}

/// Firebase Cloud Messaging over the HTTP v1 API
pub struct FcmAdapter {
    http_client: Client,
    send_url: String,
    auth: AccessTokenSource,
}

impl FcmAdapter {
    pub fn from_config(config: &FcmConfig, proxy: Option<&str>) -> Result<Self, PushError> {
        let http_client = http_client(proxy)?;

        let (project_id, auth) = match &config.access_token {
            Some(token) => {
                let project_id = config.project_id.clone().ok_or_else(|| {
                    PushError::InvalidConfig("fcm.project_id is required with access_token".into())
                })?;
                (project_id, AccessTokenSource::Static(token.clone()))
            }
            None => {
                let path = config
                    .credentials_path
                    .clone()
                    .or_else(|| std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok())
                    .ok_or_else(|| {
                        PushError::InvalidConfig(
                            "fcm needs access_token, credentials_path or GOOGLE_APPLICATION_CREDENTIALS"
                                .into(),
                        )
                    })?;
                let key = ServiceAccountKey::from_file(&path)?;
                let project_id = config
                    .project_id
                    .clone()
                    .unwrap_or_else(|| key.project_id.clone());
                let auth = ServiceAccountAuth::new(&key, http_client.clone())?;
                (project_id, AccessTokenSource::ServiceAccount(auth))
            }
        };

        Ok(Self {
            http_client,
            send_url: format!("{}/v1/projects/{}/messages:send", config.endpoint(), project_id),
            auth,
        })
    }

    fn request_body(message: &MultiDeviceMessage, token: &str) -> Value {
        json!({
            "message": {
                "token": token,
                "data": { "type": message.message_type.as_str() },
                "android": { "collapse_key": message.message_type.as_str() }
            }
        })
    }

    async fn send_one(
        &self,
        message: &MultiDeviceMessage,
        token: &str,
        access_token: &str,
    ) -> Result<TokenOutcome, reqwest::Error> {
        let response = self
            .http_client
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&Self::request_body(message, token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(TokenOutcome::delivered(token));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(classify(token, status, &body))
    }
}

/// Pull the FCM-specific error code out of an error response
fn fcm_error_code(body: &Value) -> Option<&str> {
    body["error"]["details"]
        .as_array()?
        .iter()
        .find_map(|detail| detail["errorCode"].as_str())
}

fn classify(token: &str, status: StatusCode, body: &Value) -> TokenOutcome {
    let code = fcm_error_code(body)
        .or_else(|| body["error"]["status"].as_str())
        .unwrap_or_else(|| status.as_str())
        .to_string();

    if status == StatusCode::NOT_FOUND || PERMANENT_ERROR_CODES.contains(&code.as_str()) {
        TokenOutcome::rejected(token, code)
    } else {
        TokenOutcome::deferred(token, code)
    }
}

#[async_trait]
impl ProviderClient for FcmAdapter {
    fn provider(&self) -> PushProvider {
        PushProvider::Fcm
    }

    async fn send(&self, message: &MultiDeviceMessage) -> Result<SendReport, PushError> {
        if message.dry_run {
            return Ok(SendReport::dry_run(message));
        }

        let access_token = match self.auth.access_token().await {
            Ok(token) => token,
            Err(e) => {
                metrics::record_send_failure(PushProvider::Fcm, message.len());
                return Err(e);
            }
        };

        let started = Instant::now();
        let results = join_all(
            message
                .device_tokens
                .iter()
                .map(|token| self.send_one(message, token, &access_token)),
        )
        .await;
        metrics::record_transaction(PushProvider::Fcm, started.elapsed());

        if let Some(Err(first)) = results.first()
            && results.iter().all(Result::is_err)
        {
            metrics::record_send_failure(PushProvider::Fcm, message.len());
            return Err(PushError::SendFailed(format!("FCM unreachable: {first}")));
        }

        let outcomes: Vec<_> = message
            .device_tokens
            .iter()
            .zip(results)
            .map(|(token, result)| {
                result.unwrap_or_else(|e| {
                    warn!(error = %e, "FCM request failed");
                    TokenOutcome::deferred(token, e.to_string())
                })
            })
            .collect();

        let report = SendReport {
            provider: PushProvider::Fcm,
            dry_run: false,
            outcomes,
        };
        metrics::record_send_success(PushProvider::Fcm, report.success_count());
        metrics::record_send_failure(PushProvider::Fcm, report.failure_count());
        debug!(
            sent = report.success_count(),
            failed = report.failure_count(),
            "Successfully sent FCM batch"
        );

        Ok(report)
    }
}
