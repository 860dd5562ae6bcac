use thiserror::Error;

use crate::types::PushProvider;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("No client configured for provider: {0}")]
    ProviderNotConfigured(PushProvider),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("Companion API request failed: {0}")]
    CompanionTransport(#[from] reqwest::Error),

    #[error("Companion API returned HTTP {status}: {body}")]
    CompanionHttp { status: u16, body: String },

    #[error("Unexpected companion API response: {0}")]
    UnexpectedResponse(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Received anonymous token after attempting to log in; aborting")]
    AnonymousAfterLogin,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Queue configuration problems. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueConfigError {
    #[error("{field} must be a non-negative safe integer (got {value})")]
    NotSafeInteger { field: &'static str, value: i64 },

    #[error("flush_timeout_ms must be a number or 'random' (got '{0}')")]
    InvalidFlushTimeout(String),

    #[error("{0} must be defined when using random flush timeout")]
    MissingRandomBound(&'static str),

    #[error("flush_timeout_max ({max}) must be >= flush_timeout_min ({min})")]
    InvertedRandomRange { min: u64, max: u64 },

    #[error("max_recipients must be > 0")]
    ZeroMaxRecipients,
}
