use std::sync::Arc;

use weft_core::config::GatewayConfig;
use weft_engine::WorkflowService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub service: Arc<WorkflowService>,
}
