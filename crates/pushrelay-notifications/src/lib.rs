pub mod adapters;
pub mod batch;
pub mod companion;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod types;

pub use adapters::{
    ApnsAdapter, DeliveryStatus, FcmAdapter, MockAdapter, ProviderClient, SendReport,
    TokenOutcome,
};
pub use batch::{MAX_MULTICAST_RECIPIENTS, batch_messages};
pub use companion::{CompanionApi, CompanionConfig, Session, SubscriptionCleaner};
pub use dispatch::{FlushDispatcher, TokenInvalidator};
pub use error::{PushError, QueueConfigError};
pub use provider::{ApnsConfig, ApnsTokenConfig, FcmConfig};
pub use queue::{FlushHandler, MessageQueue, QueueOptions, QueuePolicy, enqueue_messages};
pub use types::*;
