//! Buffering queue for outgoing notifications.
//!
//! Notifications are held back and sent in periodic batches so that the traffic reaching the push
//! gateways is harder to correlate with the on-wiki action that caused it. The queue flushes on a
//! timer and whenever `max_size` messages are pending. The flush interval may be randomized; the
//! draw happens once when a queue is built, so each worker gets its own interval for its lifetime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::batch::MAX_MULTICAST_RECIPIENTS;
use crate::error::QueueConfigError;
use crate::metrics;
use crate::types::{MultiDeviceMessage, SingleDeviceMessage};

pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = usize::MAX;

/// Largest integer that survives a round trip through an IEEE double.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

const RANDOM_KEYWORD: &str = "random";

/// Raw `flush_timeout_ms` value: a number of milliseconds or the keyword `"random"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlushTimeoutSetting {
    Millis(i64),
    Keyword(String),
}

/// Queue options as they appear in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub flush_timeout_ms: Option<FlushTimeoutSetting>,
    #[serde(default)]
    pub flush_timeout_min: Option<i64>,
    #[serde(default)]
    pub flush_timeout_max: Option<i64>,
    #[serde(default)]
    pub max_size: Option<i64>,
    /// Upper bound on device tokens per provider request
    #[serde(default)]
    pub max_recipients: Option<i64>,
}

/// Flush interval policy after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTimeout {
    Fixed(u64),
    /// Uniform draw from `[min, max)`; `min` when the bounds are equal
    Random { min: u64, max: u64 },
}

impl FlushTimeout {
    pub fn resolve_ms(&self) -> u64 {
        match *self {
            Self::Fixed(ms) => ms,
            Self::Random { min, max } if max > min => rand::thread_rng().gen_range(min..max),
            Self::Random { min, .. } => min,
        }
    }
}

/// Validated queue settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub flush_timeout: FlushTimeout,
    pub max_size: usize,
    pub max_recipients: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            flush_timeout: FlushTimeout::Fixed(DEFAULT_FLUSH_TIMEOUT_MS),
            max_size: DEFAULT_MAX_QUEUE_SIZE,
            max_recipients: MAX_MULTICAST_RECIPIENTS,
        }
    }
}

impl QueuePolicy {
    /// Draw the flush interval. A zero interval is bumped to 1ms since timers need a period.
    pub fn resolve_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout.resolve_ms().max(1))
    }
}

fn safe_non_negative(field: &'static str, value: i64) -> Result<u64, QueueConfigError> {
    if (0..=MAX_SAFE_INTEGER).contains(&value) {
        Ok(value as u64)
    } else {
        Err(QueueConfigError::NotSafeInteger { field, value })
    }
}

impl QueueOptions {
    pub fn validate(&self) -> Result<QueuePolicy, QueueConfigError> {
        let defaults = QueuePolicy::default();

        let flush_timeout = match &self.flush_timeout_ms {
            None => defaults.flush_timeout,
            Some(FlushTimeoutSetting::Millis(ms)) => {
                FlushTimeout::Fixed(safe_non_negative("flush_timeout_ms", *ms)?)
            }
            Some(FlushTimeoutSetting::Keyword(word)) if word == RANDOM_KEYWORD => {
                self.validate_random()?
            }
            // numbers arriving as strings, e.g. from environment overrides
            Some(FlushTimeoutSetting::Keyword(word)) => match word.trim().parse::<i64>() {
                Ok(ms) => FlushTimeout::Fixed(safe_non_negative("flush_timeout_ms", ms)?),
                Err(_) => return Err(QueueConfigError::InvalidFlushTimeout(word.clone())),
            },
        };

        let max_size = match self.max_size {
            Some(size) => {
                usize::try_from(safe_non_negative("max_size", size)?).unwrap_or(usize::MAX)
            }
            None => defaults.max_size,
        };

        let max_recipients = match self.max_recipients {
            Some(0) => return Err(QueueConfigError::ZeroMaxRecipients),
            Some(n) => {
                usize::try_from(safe_non_negative("max_recipients", n)?).unwrap_or(usize::MAX)
            }
            None => defaults.max_recipients,
        };

        Ok(QueuePolicy {
            flush_timeout,
            max_size,
            max_recipients,
        })
    }

    fn validate_random(&self) -> Result<FlushTimeout, QueueConfigError> {
        let min = self
            .flush_timeout_min
            .ok_or(QueueConfigError::MissingRandomBound("flush_timeout_min"))?;
        let max = self
            .flush_timeout_max
            .ok_or(QueueConfigError::MissingRandomBound("flush_timeout_max"))?;
        let min = safe_non_negative("flush_timeout_min", min)?;
        let max = safe_non_negative("flush_timeout_max", max)?;
        if max < min {
            return Err(QueueConfigError::InvertedRandomRange { min, max });
        }
        Ok(FlushTimeout::Random { min, max })
    }
}

/// Receives each flushed batch. May run concurrently with itself.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn on_flush(&self, messages: Vec<SingleDeviceMessage>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Timer,
    SizeLimit,
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::SizeLimit => "size_limit",
            Self::Manual => "manual",
        }
    }
}

struct QueueShared {
    pending: Mutex<Vec<SingleDeviceMessage>>,
    handler: Arc<dyn FlushHandler>,
    max_size: usize,
}

impl QueueShared {
    fn flush(&self, trigger: FlushTrigger) -> JoinHandle<()> {
        let batch = std::mem::take(&mut *self.pending.lock());
        self.hand_off(batch, trigger)
    }

    fn hand_off(&self, batch: Vec<SingleDeviceMessage>, trigger: FlushTrigger) -> JoinHandle<()> {
        debug!(trigger = trigger.as_str(), size = batch.len(), "Flushing notification queue");
        metrics::record_flush(trigger.as_str());

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.on_flush(batch).await })
    }
}

/// In-memory buffering queue. Not persisted; pending messages are lost if the process dies.
pub struct MessageQueue {
    shared: Arc<QueueShared>,
    flush_timeout: Duration,
    timer: JoinHandle<()>,
}

impl MessageQueue {
    /// Build the queue and start its flush timer on the current tokio runtime.
    pub fn new(policy: &QueuePolicy, handler: Arc<dyn FlushHandler>) -> Self {
        let flush_timeout = policy.resolve_flush_timeout();
        let shared = Arc::new(QueueShared {
            pending: Mutex::new(Vec::new()),
            handler,
            max_size: policy.max_size,
        });

        let timer = tokio::spawn(run_timer(Arc::clone(&shared), flush_timeout));

        info!(
            flush_timeout_ms = flush_timeout.as_millis() as u64,
            max_size = policy.max_size,
            "Notification queue started"
        );

        Self {
            shared,
            flush_timeout,
            timer,
        }
    }

    /// Stamp and append a message. Flushes right away once `max_size` messages are pending.
    pub fn enqueue(&self, mut message: SingleDeviceMessage) {
        message.enqueued_at = Some(OffsetDateTime::now_utc());

        let full_batch = {
            let mut pending = self.shared.pending.lock();
            pending.push(message);
            if pending.len() >= self.shared.max_size {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.shared.hand_off(batch, FlushTrigger::SizeLimit);
        }
    }

    /// Hand everything pending to the flush handler now.
    pub fn flush(&self) -> JoinHandle<()> {
        self.shared.flush(FlushTrigger::Manual)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn run_timer(shared: Arc<QueueShared>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        shared.flush(FlushTrigger::Timer);
    }
}

/// Split a multi-device message and queue one entry per device token.
pub fn enqueue_messages(queue: &MessageQueue, message: &MultiDeviceMessage) {
    let singles = message.to_single_device_messages();
    debug!(
        provider = %message.provider,
        message_type = %message.message_type,
        count = singles.len(),
        dry_run = message.dry_run,
        "Queueing notifications"
    );
    for single in singles {
        queue.enqueue(single);
    }
}
