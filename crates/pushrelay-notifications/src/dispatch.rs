use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::adapters::{ProviderClient, SendReport};
use crate::batch::{MAX_MULTICAST_RECIPIENTS, batch_messages};
use crate::error::PushError;
use crate::metrics;
use crate::queue::FlushHandler;
use crate::types::{MultiDeviceMessage, PushProvider, SingleDeviceMessage};

/// Receives device tokens a provider reported as permanently invalid.
#[async_trait]
pub trait TokenInvalidator: Send + Sync {
    async fn invalidate(&self, tokens: &[String]) -> Result<(), PushError>;
}

/// Flush handler that batches a flushed queue and delivers each batch to its provider.
pub struct FlushDispatcher {
    providers: HashMap<PushProvider, Arc<dyn ProviderClient>>,
    max_recipients: usize,
    invalidator: Option<Arc<dyn TokenInvalidator>>,
}

impl Default for FlushDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushDispatcher {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            max_recipients: MAX_MULTICAST_RECIPIENTS,
            invalidator: None,
        }
    }

    /// Register a client under the provider it reports.
    pub fn with_provider(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    pub fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        self.max_recipients = max_recipients;
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn TokenInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = PushProvider> + '_ {
        self.providers.keys().copied()
    }

    /// Send every batch, waiting for all of them. A failing batch never stops its siblings.
    pub async fn dispatch_batches(
        &self,
        batches: Vec<MultiDeviceMessage>,
    ) -> Vec<Result<SendReport, PushError>> {
        join_all(batches.iter().map(|batch| self.dispatch_one(batch))).await
    }

    async fn dispatch_one(&self, batch: &MultiDeviceMessage) -> Result<SendReport, PushError> {
        let result = match self.providers.get(&batch.provider) {
            Some(client) => client.send(batch).await,
            None => Err(PushError::ProviderNotConfigured(batch.provider)),
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(
                    provider = %batch.provider,
                    recipients = batch.len(),
                    error = %e,
                    "Failed to dispatch notification batch"
                );
                metrics::record_dispatch_error(batch.provider);
                return Err(e);
            }
        };

        let failed = report.failed_tokens();
        if !failed.is_empty() {
            self.invalidate(batch.provider, &failed).await;
        }

        Ok(report)
    }

    async fn invalidate(&self, provider: PushProvider, tokens: &[String]) {
        let Some(invalidator) = &self.invalidator else {
            warn!(
                provider = %provider,
                count = tokens.len(),
                "Provider rejected tokens but no subscription cleanup is configured"
            );
            return;
        };

        debug!(provider = %provider, count = tokens.len(), "Invalidating rejected tokens");
        // the invalidator reports its own failures
        if let Err(e) = invalidator.invalidate(tokens).await {
            debug!(
                provider = %provider,
                count = tokens.len(),
                error = %e,
                "Failed to delete subscriptions for rejected tokens"
            );
            metrics::record_invalidation_failure();
        }
    }
}

#[async_trait]
impl FlushHandler for FlushDispatcher {
    async fn on_flush(&self, messages: Vec<SingleDeviceMessage>) {
        metrics::set_queue_size_on_flush(messages.len());
        if messages.is_empty() {
            return;
        }

        let now = OffsetDateTime::now_utc();
        for message in &messages {
            if let Some(residency) = message.residency_ms(now) {
                metrics::record_queue_residency(residency);
            }
        }

        let batches = batch_messages(&messages, self.max_recipients);
        metrics::set_batches_on_flush(batches.len());

        let results = self.dispatch_batches(batches).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            messages = messages.len(),
            batches = results.len(),
            failed_batches = failed,
            "Dispatched flushed notifications"
        );
    }
}
