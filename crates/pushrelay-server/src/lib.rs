pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use handlers::AppState;
pub use observability::init_tracing;
pub use server::{PushRelayServer, ServerBuilder, build_app, build_dispatcher};
