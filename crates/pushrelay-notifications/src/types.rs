use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Push gateway a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushProvider {
    Apns,
    Fcm,
}

impl PushProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apns => "apns",
            Self::Fcm => "fcm",
        }
    }
}

impl fmt::Display for PushProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of notification the relay knows how to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    CheckEchoV1,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckEchoV1 => "checkEchoV1",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-facing metadata carried with a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl MessageMeta {
    pub fn with_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
        }
    }
}

/// Messages sharing a key are merged into the same multi-device request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchingKey {
    pub provider: PushProvider,
    pub message_type: MessageType,
    pub topic: String,
    pub dry_run: bool,
}

/// A notification addressed to exactly one device.
///
/// Created per incoming device token and consumed by the batching step on flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleDeviceMessage {
    pub device_token: String,
    pub provider: PushProvider,
    pub message_type: MessageType,
    pub meta: MessageMeta,
    pub dry_run: bool,

    /// Set by the queue on enqueue; only used for residency metrics
    pub enqueued_at: Option<OffsetDateTime>,
}

impl SingleDeviceMessage {
    pub fn new(
        device_token: impl Into<String>,
        provider: PushProvider,
        message_type: MessageType,
        meta: MessageMeta,
        dry_run: bool,
    ) -> Self {
        Self {
            device_token: device_token.into(),
            provider,
            message_type,
            meta,
            dry_run,
            enqueued_at: None,
        }
    }

    pub fn batching_key(&self) -> BatchingKey {
        BatchingKey {
            provider: self.provider,
            message_type: self.message_type,
            topic: self.meta.topic.clone().unwrap_or_default(),
            dry_run: self.dry_run,
        }
    }

    /// Milliseconds spent in the queue as of `now`, if the message was enqueued.
    pub fn residency_ms(&self, now: OffsetDateTime) -> Option<f64> {
        self.enqueued_at
            .map(|at| ((now - at).whole_milliseconds().max(0)) as f64)
    }
}

/// A notification addressed to a set of devices.
///
/// Token uniqueness is enforced by the set; equality ignores token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiDeviceMessage {
    pub device_tokens: IndexSet<String>,
    pub provider: PushProvider,
    pub message_type: MessageType,
    pub meta: MessageMeta,
    pub dry_run: bool,
}

impl MultiDeviceMessage {
    pub fn new<I, S>(
        device_tokens: I,
        provider: PushProvider,
        message_type: MessageType,
        meta: MessageMeta,
        dry_run: bool,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device_tokens: device_tokens.into_iter().map(Into::into).collect(),
            provider,
            message_type,
            meta,
            dry_run,
        }
    }

    /// Start a chunk from its first single-device message.
    pub(crate) fn seeded_from(message: &SingleDeviceMessage) -> Self {
        let mut device_tokens = IndexSet::new();
        device_tokens.insert(message.device_token.clone());
        Self {
            device_tokens,
            provider: message.provider,
            message_type: message.message_type,
            meta: message.meta.clone(),
            dry_run: message.dry_run,
        }
    }

    pub fn len(&self) -> usize {
        self.device_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_tokens.is_empty()
    }

    pub fn topic(&self) -> Option<&str> {
        self.meta.topic.as_deref()
    }

    pub fn to_single_device_messages(&self) -> Vec<SingleDeviceMessage> {
        self.device_tokens
            .iter()
            .map(|token| {
                SingleDeviceMessage::new(
                    token.clone(),
                    self.provider,
                    self.message_type,
                    self.meta.clone(),
                    self.dry_run,
                )
            })
            .collect()
    }
}
