use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use super::{ProviderClient, SendReport, TokenOutcome};
use crate::error::PushError;
use crate::metrics;
use crate::provider::{ApnsConfig, ApnsTokenConfig, http_client_builder, read_pem};
use crate::types::{MultiDeviceMessage, PushProvider};

/// Apple rejects provider tokens older than an hour and throttles refreshes faster than 20 min.
const TOKEN_REFRESH_AFTER: Duration = Duration::from_secs(50 * 60);

/// Reasons after which a device token will never be accepted again
const PERMANENT_REASONS: &[&str] = &["BadDeviceToken", "DeviceTokenNotForTopic", "Unregistered"];

#[derive(Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Deserialize)]
struct ApnsErrorBody {
    reason: String,
}

/// ES256 provider token, cached between sends
struct ProviderToken {
    key: EncodingKey,
    key_id: String,
    team_id: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl ProviderToken {
    fn from_config(config: &ApnsTokenConfig) -> Result<Self, PushError> {
        let pem = read_pem(&config.key)?;
        let key = EncodingKey::from_ec_pem(&pem)
            .map_err(|e| PushError::InvalidConfig(format!("invalid APNs signing key: {e}")))?;
        Ok(Self {
            key,
            key_id: config.key_id.clone(),
            team_id: config.team_id.clone(),
            cached: Mutex::new(None),
        })
    }

    fn bearer(&self) -> Result<String, PushError> {
        let mut cached = self.cached.lock();
        if let Some((token, issued_at)) = cached.as_ref()
            && issued_at.elapsed() < TOKEN_REFRESH_AFTER
        {
            return Ok(token.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let token = encode(&header, &claims, &self.key)
            .map_err(|e| PushError::ProviderAuth(e.to_string()))?;

        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// Apple Push Notification service over the HTTP/2 provider API
pub struct ApnsAdapter {
    http_client: Client,
    endpoint: Url,
    default_topic: Option<String>,
    auth: Option<ProviderToken>,
}

impl ApnsAdapter {
    pub fn from_config(config: &ApnsConfig, proxy: Option<&str>) -> Result<Self, PushError> {
        let auth = config
            .token
            .as_ref()
            .map(ProviderToken::from_config)
            .transpose()?;

        let mut builder = http_client_builder(proxy)?;
        if auth.is_none()
            && let Some(path) = &config.certificate_path
        {
            let pem = read_pem(path)?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| PushError::InvalidConfig(format!("invalid APNs certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        let http_client = builder
            .build()
            .map_err(|e| PushError::Internal(e.to_string()))?;

        let endpoint = Url::parse(config.endpoint())
            .map_err(|e| PushError::InvalidConfig(format!("invalid APNs endpoint: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(PushError::InvalidConfig(format!(
                "invalid APNs endpoint: {endpoint}"
            )));
        }

        Ok(Self {
            http_client,
            endpoint,
            default_topic: config.default_topic.clone(),
            auth,
        })
    }

    fn payload(message: &MultiDeviceMessage) -> Value {
        json!({
            "aps": {
                "content-available": 1,
                "thread-id": message.message_type.as_str(),
            },
            "data": {
                "type": message.message_type.as_str(),
            }
        })
    }

    /// The token always ends up as exactly one encoded path segment.
    fn device_url(&self, token: &str) -> Option<Url> {
        if matches!(token, "" | "." | "..") {
            return None;
        }
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["3", "device", token]);
        Some(url)
    }

    async fn send_one(
        &self,
        token: &str,
        topic: &str,
        bearer: Option<&str>,
        payload: &Value,
    ) -> Result<TokenOutcome, reqwest::Error> {
        let Some(url) = self.device_url(token) else {
            return Ok(TokenOutcome::rejected(token, "BadDeviceToken"));
        };
        let mut request = self
            .http_client
            .post(url)
            .header("apns-topic", topic)
            .header("apns-push-type", "background")
            .header("apns-priority", "5")
            .json(payload);
        if let Some(bearer) = bearer {
            request = request.header("authorization", format!("bearer {bearer}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(TokenOutcome::delivered(token));
        }

        let reason = response
            .json::<ApnsErrorBody>()
            .await
            .map(|body| body.reason)
            .unwrap_or_else(|_| status.to_string());
        Ok(classify(token, status, reason))
    }
}

fn classify(token: &str, status: StatusCode, reason: String) -> TokenOutcome {
    if status == StatusCode::GONE || PERMANENT_REASONS.contains(&reason.as_str()) {
        TokenOutcome::rejected(token, reason)
    } else {
        TokenOutcome::deferred(token, reason)
    }
}

#[async_trait]
impl ProviderClient for ApnsAdapter {
    fn provider(&self) -> PushProvider {
        PushProvider::Apns
    }

    async fn send(&self, message: &MultiDeviceMessage) -> Result<SendReport, PushError> {
        if message.dry_run {
            return Ok(SendReport::dry_run(message));
        }

        let topic = message
            .topic()
            .or(self.default_topic.as_deref())
            .ok_or_else(|| PushError::InvalidConfig("no apns-topic for message".into()))?;
        let bearer = self.auth.as_ref().map(ProviderToken::bearer).transpose()?;
        let payload = Self::payload(message);

        let started = Instant::now();
        let results = join_all(
            message
                .device_tokens
                .iter()
                .map(|token| self.send_one(token, topic, bearer.as_deref(), &payload)),
        )
        .await;
        metrics::record_transaction(PushProvider::Apns, started.elapsed());

        if let Some(Err(first)) = results.first()
            && results.iter().all(Result::is_err)
        {
            metrics::record_send_failure(PushProvider::Apns, message.len());
            return Err(PushError::SendFailed(format!("APNs unreachable: {first}")));
        }

        let outcomes: Vec<_> = message
            .device_tokens
            .iter()
            .zip(results)
            .map(|(token, result)| {
                result.unwrap_or_else(|e| {
                    warn!(error = %e, "APNs request failed");
                    TokenOutcome::deferred(token, e.to_string())
                })
            })
            .collect();

        let report = SendReport {
            provider: PushProvider::Apns,
            dry_run: false,
            outcomes,
        };
        metrics::record_send_success(PushProvider::Apns, report.success_count());
        metrics::record_send_failure(PushProvider::Apns, report.failure_count());
        debug!(
            sent = report.success_count(),
            failed = report.failure_count(),
            "APNs batch sent"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DeliveryStatus;
    use crate::types::{MessageMeta, MessageType};

    #[test]
    fn gone_and_bad_tokens_are_permanent() {
        let gone = classify("t", StatusCode::GONE, "Unregistered".into());
        assert!(matches!(gone.status, DeliveryStatus::Rejected { .. }));

        let bad = classify("t", StatusCode::BAD_REQUEST, "BadDeviceToken".into());
        assert!(matches!(bad.status, DeliveryStatus::Rejected { .. }));

        let busy = classify("t", StatusCode::TOO_MANY_REQUESTS, "TooManyRequests".into());
        assert!(matches!(busy.status, DeliveryStatus::Deferred { .. }));
    }

    #[test]
    fn provider_token_is_cached() {
        let token = ProviderToken::from_config(&ApnsTokenConfig {
            key: include_str!("../../tests/fixtures/apns_signing_key.p8").into(),
            key_id: "ABC123DEFG".into(),
            team_id: "DEF123GHIJ".into(),
        })
        .unwrap();

        let first = token.bearer().unwrap();
        let second = token.bearer().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.split('.').count(), 3);
    }

    #[test]
    fn payload_carries_message_type() {
        let message = MultiDeviceMessage::new(
            ["t"],
            PushProvider::Apns,
            MessageType::CheckEchoV1,
            MessageMeta::default(),
            false,
        );
        let payload = ApnsAdapter::payload(&message);
        assert_eq!(payload["data"]["type"], "checkEchoV1");
        assert_eq!(payload["aps"]["thread-id"], "checkEchoV1");
    }

    #[test]
    fn device_token_is_one_path_segment() {
        let config = ApnsConfig {
            enabled: true,
            endpoint: Some("https://gateway.test/".into()),
            ..ApnsConfig::default()
        };
        let adapter = ApnsAdapter::from_config(&config, None).unwrap();

        let url = adapter.device_url("abc123").unwrap();
        assert_eq!(url.as_str(), "https://gateway.test/3/device/abc123");

        for crafted in ["victim?x=1", "zz/../victim", "victim#frag"] {
            let url = adapter.device_url(crafted).unwrap();
            assert_eq!(url.query(), None);
            assert_eq!(url.fragment(), None);
            assert_eq!(url.path_segments().unwrap().count(), 3, "{url}");
            assert_ne!(url.path(), "/3/device/victim");
        }

        assert!(adapter.device_url("..").is_none());
        assert!(adapter.device_url("").is_none());
    }
}
