use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, Result};
use crate::types::*;

/// Model backend: one concrete endpoint a tier can route to.
pub trait Backend: Send + Sync + 'static {
    /// Backend name, as referenced by tier configuration.
    fn name(&self) -> &str;

    /// Perform one call. Implementations should return promptly with
    /// `BackendError::Cancelled` once `cancel` fires.
    fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, std::result::Result<InvocationResult, BackendError>>;

    /// Per-call timeout in seconds.
    fn timeout_secs(&self) -> u64 {
        60
    }
}

/// Deterministic step handler, looked up by id in the handler registry.
pub trait StepHandler: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run with the step's resolved inputs; the returned value becomes the step output.
    fn run(
        &self,
        inputs: ValueMap,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Run recorder: persistence for runs and their event logs.
///
/// A failing `record_event` or `save_run` is fatal for the run being executed.
pub trait RunRecorder: Send + Sync + 'static {
    fn record_event(&self, event: RunEvent) -> BoxFuture<'_, Result<()>>;

    /// Insert or replace the run record.
    fn save_run(&self, run: Run) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    /// Newest first.
    fn list_runs(&self, filter: RunFilter) -> BoxFuture<'_, Result<Vec<Run>>>;

    /// Stored events of a run, ordered by `seq`.
    fn load_events(&self, run_id: RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>>;
}

/// Post-run evaluation hook. Receives the final run; failures are logged only.
pub trait EvaluationHook: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn evaluate(&self, run: Run) -> BoxFuture<'_, Result<()>>;
}
