pub mod apns;
pub mod fcm;
pub mod mock;

use async_trait::async_trait;

use crate::error::PushError;
use crate::types::{MultiDeviceMessage, PushProvider};

/// Per-token delivery result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The provider says this token will never work again
    Rejected { reason: String },
    /// Transient failure; the token stays subscribed
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    pub token: String,
    pub status: DeliveryStatus,
}

impl TokenOutcome {
    pub fn delivered(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            status: DeliveryStatus::Delivered,
        }
    }

    pub fn rejected(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            status: DeliveryStatus::Rejected {
                reason: reason.into(),
            },
        }
    }

    pub fn deferred(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            status: DeliveryStatus::Deferred {
                reason: reason.into(),
            },
        }
    }
}

/// Result of sending one multi-device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub provider: PushProvider,
    pub dry_run: bool,
    pub outcomes: Vec<TokenOutcome>,
}

impl SendReport {
    /// Report used for dry runs: every token counts as delivered, nothing left the process.
    pub fn dry_run(message: &MultiDeviceMessage) -> Self {
        Self {
            provider: message.provider,
            dry_run: true,
            outcomes: message
                .device_tokens
                .iter()
                .map(TokenOutcome::delivered)
                .collect(),
        }
    }

    /// Tokens the provider reported as permanently invalid.
    pub fn failed_tokens(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, DeliveryStatus::Rejected { .. }))
            .map(|o| o.token.clone())
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == DeliveryStatus::Delivered)
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// A push gateway capable of delivering a multi-device message
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> PushProvider;

    /// Deliver the message. `Err` means the request as a whole failed; per-token failures are
    /// reported in the returned [`SendReport`].
    async fn send(&self, message: &MultiDeviceMessage) -> Result<SendReport, PushError>;
}

pub use apns::ApnsAdapter;
pub use fcm::FcmAdapter;
pub use mock::MockAdapter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageMeta, MessageType};

    #[test]
    fn failed_tokens_only_include_rejections() {
        let report = SendReport {
            provider: PushProvider::Fcm,
            dry_run: false,
            outcomes: vec![
                TokenOutcome::delivered("ok"),
                TokenOutcome::rejected("gone", "UNREGISTERED"),
                TokenOutcome::deferred("later", "UNAVAILABLE"),
            ],
        };
        assert_eq!(report.failed_tokens(), vec!["gone".to_string()]);
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.failure_count(), 2);
    }

    #[test]
    fn dry_run_report_delivers_everything() {
        let message = MultiDeviceMessage::new(
            ["a", "b"],
            PushProvider::Apns,
            MessageType::CheckEchoV1,
            MessageMeta::default(),
            true,
        );
        let report = SendReport::dry_run(&message);
        assert!(report.dry_run);
        assert_eq!(report.success_count(), 2);
        assert!(report.failed_tokens().is_empty());
    }
}
