use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use pushrelay_notifications::{
    ApnsAdapter, CompanionApi, FcmAdapter, FlushDispatcher, MessageQueue, MockAdapter,
    ProviderClient, PushProvider, SubscriptionCleaner,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::AppConfig,
    handlers::{self, AppState},
    middleware as app_middleware,
};

pub struct PushRelayServer {
    addr: SocketAddr,
    app: Router,
    queue: Arc<MessageQueue>,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/robots.txt", get(handlers::robots))
        .route("/metrics", get(handlers::metrics))
        // Notification intake
        .route("/v1/message/apns", post(handlers::post_apns))
        .route("/v1/message/fcm", post(handlers::post_fcm))
        .route_layer(middleware::from_fn(app_middleware::http_metrics))
        .with_state(state)
        // Middleware stack (outermost last): body limit -> request id -> cors -> trace
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Wire providers, subscription cleanup and batching limits into a flush handler.
pub fn build_dispatcher(cfg: &AppConfig) -> anyhow::Result<FlushDispatcher> {
    let policy = cfg.queue_policy().map_err(anyhow::Error::msg)?;
    let proxy = cfg.proxy.as_deref();
    let mut dispatcher = FlushDispatcher::new().with_max_recipients(policy.max_recipients);

    if cfg.apns.enabled {
        let client: Arc<dyn ProviderClient> = if cfg.apns.mock {
            Arc::new(MockAdapter::new(PushProvider::Apns))
        } else {
            Arc::new(ApnsAdapter::from_config(&cfg.apns, proxy).context("APNs client")?)
        };
        dispatcher = dispatcher.with_provider(client);
    }

    if cfg.fcm.enabled {
        let client: Arc<dyn ProviderClient> = if cfg.fcm.mock {
            Arc::new(MockAdapter::new(PushProvider::Fcm))
        } else {
            Arc::new(FcmAdapter::from_config(&cfg.fcm, proxy).context("FCM client")?)
        };
        dispatcher = dispatcher.with_provider(client);
    }

    if cfg.companion.enabled {
        let api = CompanionApi::from_config(&cfg.companion, proxy).context("companion API")?;
        dispatcher = dispatcher.with_invalidator(Arc::new(SubscriptionCleaner::new(Arc::new(api))));
    }

    let providers: Vec<_> = dispatcher.providers().map(|p| p.as_str()).collect();
    if providers.is_empty() {
        tracing::warn!("No push providers enabled; queued notifications will be dropped");
    } else {
        tracing::info!(
            providers = ?providers,
            max_recipients = policy.max_recipients,
            subscription_cleanup = cfg.companion.enabled,
            "Push providers configured"
        );
    }

    Ok(dispatcher)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Build the queue and router. Must be called from within a tokio runtime.
    pub fn build(self) -> anyhow::Result<PushRelayServer> {
        let policy = self.config.queue_policy().map_err(anyhow::Error::msg)?;
        let dispatcher = build_dispatcher(&self.config)?;
        let providers: Vec<_> = dispatcher.providers().collect();
        let queue = Arc::new(MessageQueue::new(&policy, Arc::new(dispatcher)));

        let state = AppState::new(Arc::clone(&queue), providers);
        let app = build_app(state, &self.config);

        Ok(PushRelayServer {
            addr: self.addr,
            app,
            queue,
        })
    }
}

impl PushRelayServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!(
            pending = self.queue.pending_len(),
            "Flushing notification queue before exit"
        );
        if let Err(e) = self.queue.flush().await {
            tracing::error!(error = %e, "Final queue flush failed");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
