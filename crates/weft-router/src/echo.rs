use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use weft_core::error::BackendError;
use weft_core::traits::Backend;
use weft_core::types::{InvocationRequest, InvocationResult};

/// Local backend that answers with the resolved inputs. Useful for wiring up
/// tiers before a real endpoint exists.
pub struct EchoBackend {
    name: String,
}

impl EchoBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Backend for EchoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InvocationResult, BackendError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            Ok(InvocationResult {
                output: serde_json::Value::Object(request.inputs),
                backend: self.name.clone(),
                tokens_used: 0,
            })
        })
    }
}
