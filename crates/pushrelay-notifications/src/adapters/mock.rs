use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ProviderClient, SendReport, TokenOutcome};
use crate::error::PushError;
use crate::types::{MultiDeviceMessage, PushProvider};

/// In-process gateway that never touches the network.
///
/// Every token is delivered unless it was registered with [`MockAdapter::with_rejected`].
/// Sent messages are kept for inspection.
pub struct MockAdapter {
    provider: PushProvider,
    rejected: HashSet<String>,
    sent: Mutex<Vec<MultiDeviceMessage>>,
}

impl MockAdapter {
    pub fn new(provider: PushProvider) -> Self {
        Self {
            provider,
            rejected: HashSet::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rejected<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn sent(&self) -> Vec<MultiDeviceMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for MockAdapter {
    fn provider(&self) -> PushProvider {
        self.provider
    }

    async fn send(&self, message: &MultiDeviceMessage) -> Result<SendReport, PushError> {
        if message.dry_run {
            return Ok(SendReport::dry_run(message));
        }

        self.sent.lock().push(message.clone());

        let outcomes = message
            .device_tokens
            .iter()
            .map(|token| {
                if self.rejected.contains(token) {
                    TokenOutcome::rejected(token, "Unregistered")
                } else {
                    TokenOutcome::delivered(token)
                }
            })
            .collect();

        Ok(SendReport {
            provider: self.provider,
            dry_run: false,
            outcomes,
        })
    }
}
