use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use pushrelay_notifications::{
    MessageMeta, MessageQueue, MessageType, MultiDeviceMessage, PushProvider, enqueue_messages,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::metrics::render_metrics;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<MessageQueue>,
    /// Providers with a configured client. Intake for the others is refused.
    pub providers: Arc<HashSet<PushProvider>>,
}

impl AppState {
    pub fn new(queue: Arc<MessageQueue>, providers: impl IntoIterator<Item = PushProvider>) -> Self {
        Self {
            queue,
            providers: Arc::new(providers.into_iter().collect()),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Errors returned to HTTP callers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    ProviderDisabled(PushProvider),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "{msg}"),
            Self::ProviderDisabled(provider) => write!(f, "{provider} delivery is not enabled"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, title) = match &self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", "Bad Request"),
            Self::ProviderDisabled(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "provider_disabled",
                "Service Unavailable",
            ),
        };

        let body = json!({
            "status": status.as_u16(),
            "type": kind,
            "title": title,
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Body of `POST /v1/message/{provider}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub device_tokens: Vec<String>,
    pub message_type: MessageType,
    #[serde(default)]
    pub dry_run: bool,
    /// Only honoured for APNs
    #[serde(default)]
    pub topic: Option<String>,
}

impl MessageRequest {
    fn into_message(self, provider: PushProvider) -> Result<MultiDeviceMessage, ApiError> {
        if self.device_tokens.is_empty() {
            return Err(ApiError::BadRequest("deviceTokens must not be empty".into()));
        }
        if self.device_tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(ApiError::BadRequest(
                "deviceTokens must not contain empty tokens".into(),
            ));
        }

        let meta = match (provider, self.topic) {
            (PushProvider::Apns, Some(topic)) if !topic.is_empty() => MessageMeta::with_topic(topic),
            _ => MessageMeta::default(),
        };
        Ok(MultiDeviceMessage::new(
            self.device_tokens,
            provider,
            self.message_type,
            meta,
            self.dry_run,
        ))
    }
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "pushrelay",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn robots() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow: /\n",
    )
}

pub async fn metrics() -> Response {
    match render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

pub async fn post_apns(
    State(state): State<AppState>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue(&state, PushProvider::Apns, payload)
}

pub async fn post_fcm(
    State(state): State<AppState>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue(&state, PushProvider::Fcm, payload)
}

fn enqueue(
    state: &AppState,
    provider: PushProvider,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if !state.providers.contains(&provider) {
        return Err(ApiError::ProviderDisabled(provider));
    }
    let Json(request) = payload?;
    let message = request.into_message(provider)?;
    enqueue_messages(&state.queue, &message);
    Ok((StatusCode::OK, Json(json!({}))))
}
