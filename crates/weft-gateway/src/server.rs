use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use weft_core::config::GatewayConfig;
use weft_engine::WorkflowService;

use crate::routes;
use crate::state::AppState;

/// Build the axum application over a service.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws/runs/{id}", get(routes::ws_run))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/workflows", get(routes::list_workflows))
        .route("/api/workflows/{name}/dag", get(routes::workflow_dag))
        .route("/api/runs", get(routes::list_runs).post(routes::submit_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .route("/api/runs/{id}/events", get(routes::run_events))
        .route("/api/summary", get(routes::summary))
        .route("/api/circuits", get(routes::circuits))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    service: Arc<WorkflowService>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: Arc<WorkflowService>) -> Self {
        Self { config, service }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        });
        let app = build_app(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, auth = self.config.token.is_some(), "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
