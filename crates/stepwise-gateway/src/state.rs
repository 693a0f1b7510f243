use std::sync::Arc;

use stepwise_core::config::GatewayConfig;
use stepwise_engine::RunManager;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub manager: Arc<RunManager>,
}
