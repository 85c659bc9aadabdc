//! Mocks and fixtures shared by the Weft test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use weft_core::error::{BackendError, Result, WeftError};
use weft_core::traits::{Backend, StepHandler};
use weft_core::types::*;
use weft_core::workflow::{InputSpec, InputType, StepDefinition, WorkflowDefinition};

/// Backend that replays scripted replies, then repeats a fallback reply.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<std::result::Result<serde_json::Value, BackendError>>>,
    fallback: std::result::Result<serde_json::Value, BackendError>,
    delay: Option<Duration>,
    timeout_secs: u64,
    tokens: u64,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn with_fallback(
        name: &str,
        fallback: std::result::Result<serde_json::Value, BackendError>,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            timeout_secs: 60,
            tokens: 10,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always succeeds with `output`.
    pub fn ok(name: &str, output: serde_json::Value) -> Self {
        Self::with_fallback(name, Ok(output))
    }

    /// Always fails with `error`.
    pub fn failing(name: &str, error: BackendError) -> Self {
        Self::with_fallback(name, Err(error))
    }

    /// Queue a failure ahead of the fallback reply.
    pub fn then_fail(self, error: BackendError) -> Self {
        self.push(Err(error))
    }

    /// Queue a success ahead of the fallback reply.
    pub fn then_ok(self, output: serde_json::Value) -> Self {
        self.push(Ok(output))
    }

    fn push(self, reply: std::result::Result<serde_json::Value, BackendError>) -> Self {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(reply);
        self
    }

    /// Sleep this long (cancellably) before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn invoke(
        &self,
        _request: InvocationRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, std::result::Result<InvocationResult, BackendError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let reply = self
                .script
                .lock()
                .expect("script lock poisoned")
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            reply.map(|output| InvocationResult {
                output,
                backend: self.name.clone(),
                tokens_used: self.tokens,
            })
        })
    }
}

/// Handler that waits on a shared barrier before echoing its inputs. Two
/// steps using the same barrier only finish if they run concurrently.
pub struct BarrierHandler {
    id: String,
    barrier: Arc<Barrier>,
}

impl BarrierHandler {
    pub fn new(id: &str, barrier: Arc<Barrier>) -> Self {
        Self {
            id: id.to_string(),
            barrier,
        }
    }
}

impl StepHandler for BarrierHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(
        &self,
        inputs: ValueMap,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(WeftError::Cancelled),
                _ = self.barrier.wait() => Ok(serde_json::Value::Object(inputs)),
            }
        })
    }
}

/// Handler that fails its first `failures` calls, then returns `"ok"`.
pub struct FlakyHandler {
    id: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(id: &str, failures: usize) -> Self {
        Self {
            id: id.to_string(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepHandler for FlakyHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(
        &self,
        _inputs: ValueMap,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(WeftError::StepExecution {
                    step: self.id.clone(),
                    message: format!("scripted failure {}", n + 1),
                })
            } else {
                Ok(serde_json::json!("ok"))
            }
        })
    }
}

/// Handler that records how many calls overlap. Each call holds for `hold`.
pub struct ConcurrencyProbe {
    id: String,
    hold: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new(id: &str, hold: Duration) -> Self {
        Self {
            id: id.to_string(),
            hold,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl StepHandler for ConcurrencyProbe {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(
        &self,
        _inputs: ValueMap,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!(now))
        })
    }
}

// --- Fixtures ---

/// `a -> {b, c} -> d`, all `passthrough`.
pub fn diamond_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("diamond")
        .with_input(InputSpec::new("topic", InputType::String).with_default("weft".into()))
        .with_step(StepDefinition::deterministic("a", "passthrough").bind("topic", "context.inputs.topic"))
        .with_step(
            StepDefinition::deterministic("b", "passthrough")
                .after(&["a"])
                .bind("from_a", "context.steps.a.topic"),
        )
        .with_step(
            StepDefinition::deterministic("c", "passthrough")
                .after(&["a"])
                .bind("from_a", "context.a.topic"),
        )
        .with_step(
            StepDefinition::deterministic("d", "passthrough")
                .after(&["b", "c"])
                .bind("joined", "context.b.from_a + '/' + context.c.from_a"),
        )
}

/// Steps `s0 -> s1 -> ... -> s{n-1}` using `handler`.
pub fn chain_workflow(name: &str, handler: &str, n: usize) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(name);
    for i in 0..n {
        let mut step = StepDefinition::deterministic(format!("s{}", i), handler);
        if i > 0 {
            step.depends_on = vec![format!("s{}", i - 1)];
        }
        def = def.with_step(step);
    }
    def
}

/// `n` independent steps using `handler`.
pub fn fan_out_workflow(name: &str, handler: &str, n: usize) -> WorkflowDefinition {
    (0..n).fold(WorkflowDefinition::new(name), |def, i| {
        def.with_step(StepDefinition::deterministic(format!("s{}", i), handler))
    })
}

/// Write definitions as TOML into a fresh temp directory.
pub fn workflows_dir(defs: &[WorkflowDefinition]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    for def in defs {
        let content = toml::to_string(def).expect("serialize workflow");
        std::fs::write(dir.path().join(format!("{}.toml", def.name)), content)
            .expect("write workflow");
    }
    dir
}

/// A finished run record with the given step statuses.
pub fn sample_run(workflow: &str, status: RunStatus, steps: &[(&str, StepStatus)]) -> Run {
    let start = chrono::Utc::now();
    Run {
        run_id: RunId::new(),
        workflow_name: workflow.to_string(),
        status,
        inputs: ValueMap::new(),
        steps: steps
            .iter()
            .map(|(name, status)| StepState {
                status: *status,
                start_time: Some(start),
                end_time: Some(start + chrono::Duration::milliseconds(5)),
                error: matches!(status, StepStatus::Failed | StepStatus::Cancelled)
                    .then(|| "scripted".to_string()),
                ..StepState::pending(*name)
            })
            .collect(),
        start_time: start,
        end_time: Some(start + chrono::Duration::milliseconds(10)),
        error: None,
    }
}

/// Drain a run's event receiver until `workflow_end` (or the channel closes).
pub async fn collect_events(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunEvent>,
) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = event.is_terminal();
        events.push(event);
        if done {
            break;
        }
    }
    events
}
