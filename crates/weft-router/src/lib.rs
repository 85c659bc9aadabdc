pub mod backoff;
pub mod circuit;
pub mod echo;
pub mod http;
pub mod router;

use std::sync::Arc;

use weft_core::config::{AppConfig, BackendConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::Backend;

pub use backoff::calculate_backoff;
pub use circuit::{Admission, CircuitBreakerStore, CircuitPermit, CircuitSnapshot, CircuitStatus};
pub use echo::EchoBackend;
pub use http::HttpBackend;
pub use router::BackendRouter;

/// Create a backend based on its configured kind.
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    match config.kind.as_str() {
        "http" => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                WeftError::Config(format!("backend '{}' needs an endpoint", config.name))
            })?;
            Ok(Arc::new(HttpBackend::new(config, endpoint)))
        }
        "echo" => Ok(Arc::new(EchoBackend::new(config.name.clone()))),
        other => Err(WeftError::Config(format!(
            "backend '{}' has unknown kind '{}'",
            config.name, other
        ))),
    }
}

/// Build a router with every configured backend and tier.
pub fn build_router(config: &AppConfig, circuits: Arc<CircuitBreakerStore>) -> Result<BackendRouter> {
    let mut router = BackendRouter::new(circuits);
    for backend in &config.backends {
        router.add_backend(create_backend(backend)?, backend.capabilities.clone());
    }
    for tier in &config.tiers {
        router.add_tier(tier.clone());
    }
    Ok(router)
}
