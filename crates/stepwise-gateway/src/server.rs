use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use stepwise_core::config::GatewayConfig;
use stepwise_engine::RunManager;

use crate::routes;
use crate::state::AppState;

/// All gateway routes over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/graphs/validate", post(routes::validate_graph))
        .route("/api/runs", post(routes::start_run))
        .route("/api/runs/suspended", get(routes::suspended_runs))
        .route("/api/runs/{id}/resume", post(routes::resume_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    manager: Arc<RunManager>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, manager: Arc<RunManager>) -> Self {
        Self { config, manager }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            manager: self.manager.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
