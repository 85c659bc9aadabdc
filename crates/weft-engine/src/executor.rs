use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::AppConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::RunRecorder;
use weft_core::types::*;
use weft_core::workflow::FailurePolicy;

use crate::context::RunContext;
use crate::graph::{ExecutionGraph, NodeId};
use crate::invoker::{InvokeOptions, StepInvoker, StepOutcome};

/// Limits and policies for one run.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub max_in_flight: usize,
    /// Run-level wall clock limit. The run is cancelled when it elapses.
    pub max_duration: Option<Duration>,
    /// Time in-flight steps get to observe cancellation before being aborted.
    pub cancel_grace: Duration,
    pub invoke: InvokeOptions,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_duration: None,
            cancel_grace: Duration::from_secs(2),
            invoke: InvokeOptions::default(),
        }
    }
}

impl ExecutionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_in_flight: config.engine.max_in_flight,
            max_duration: Some(Duration::from_secs(config.engine.max_duration_secs)),
            cancel_grace: Duration::from_millis(config.engine.cancel_grace_ms),
            invoke: InvokeOptions {
                default_max_attempts: config.engine.default_max_attempts,
                initial_backoff_ms: config.retry.initial_backoff_ms,
                max_backoff_ms: config.retry.max_backoff_ms,
                ..InvokeOptions::default()
            },
        }
    }
}

/// Handle to a run in progress.
pub struct RunHandle {
    run_id: RunId,
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancellationToken,
    pub(crate) done: oneshot::Receiver<Run>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// This run's events, in emission order.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<RunEvent> {
        &mut self.events
    }

    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish and return its final record.
    pub async fn wait(self) -> Result<Run> {
        self.done
            .await
            .map_err(|_| WeftError::Internal("run dispatcher stopped without a result".into()))
    }
}

/// Drives compiled graphs: one dispatcher task per run, steps executed on a
/// bounded pool of worker tasks.
pub struct DagExecutor {
    invoker: Arc<StepInvoker>,
    event_bus: Arc<EventBus>,
    recorder: Option<Arc<dyn RunRecorder>>,
}

impl DagExecutor {
    pub fn new(invoker: Arc<StepInvoker>, event_bus: Arc<EventBus>) -> Self {
        Self {
            invoker,
            event_bus,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn invoker(&self) -> &Arc<StepInvoker> {
        &self.invoker
    }

    /// Start a run. The initial run record and `workflow_start` event are
    /// recorded before this returns; a recorder failure here means the run
    /// never starts.
    pub async fn execute(
        &self,
        graph: Arc<ExecutionGraph>,
        run_id: RunId,
        inputs: ValueMap,
        options: ExecutionOptions,
    ) -> Result<RunHandle> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut dispatcher = Dispatcher::new(
            graph,
            Arc::clone(&self.invoker),
            Arc::clone(&self.event_bus),
            self.recorder.clone(),
            events_tx,
            options,
            cancel.clone(),
            run_id.clone(),
            inputs,
        );
        dispatcher.begin().await?;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let run = dispatcher.run().await;
            let _ = done_tx.send(run);
        });

        Ok(RunHandle {
            run_id,
            events: events_rx,
            cancel,
            done: done_rx,
        })
    }
}

enum Stop {
    Completed,
    Cancelled(String),
    Fatal(WeftError),
}

type Completion = (NodeId, StepOutcome);

/// Owns every piece of mutable run state. Workers only ever see snapshots.
struct Dispatcher {
    graph: Arc<ExecutionGraph>,
    invoker: Arc<StepInvoker>,
    event_bus: Arc<EventBus>,
    recorder: Option<Arc<dyn RunRecorder>>,
    events: mpsc::UnboundedSender<RunEvent>,
    options: ExecutionOptions,
    cancel: CancellationToken,
    run: Run,
    context: RunContext,
    seq: u64,
    clock: Instant,
    /// Per step, dependencies not yet terminal.
    waiting_on: Vec<usize>,
    /// Per step, whether some dependency ended without success.
    blocked: Vec<bool>,
    started_at: Vec<Option<Instant>>,
    ready: VecDeque<NodeId>,
    in_flight: usize,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    fn new(
        graph: Arc<ExecutionGraph>,
        invoker: Arc<StepInvoker>,
        event_bus: Arc<EventBus>,
        recorder: Option<Arc<dyn RunRecorder>>,
        events: mpsc::UnboundedSender<RunEvent>,
        options: ExecutionOptions,
        cancel: CancellationToken,
        run_id: RunId,
        inputs: ValueMap,
    ) -> Self {
        let run = Run {
            run_id,
            workflow_name: graph.name().to_string(),
            status: RunStatus::Running,
            inputs: inputs.clone(),
            steps: graph
                .nodes()
                .iter()
                .map(|n| StepState::pending(n.name.clone()))
                .collect(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
        };
        let ready = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|id| graph.node(*id).dependencies.is_empty())
            .collect();

        Self {
            waiting_on: graph.nodes().iter().map(|n| n.dependencies.len()).collect(),
            blocked: vec![false; graph.len()],
            started_at: vec![None; graph.len()],
            graph,
            invoker,
            event_bus,
            recorder,
            events,
            options,
            cancel,
            run,
            context: RunContext::new(inputs),
            seq: 0,
            clock: Instant::now(),
            ready,
            in_flight: 0,
        }
    }

    async fn begin(&mut self) -> Result<()> {
        self.save().await?;
        self.emit(ExecutionEvent::WorkflowStart {
            workflow_name: self.run.workflow_name.clone(),
            step_count: self.graph.len(),
        })
        .await?;
        info!(
            run_id = %self.run.run_id,
            workflow = %self.run.workflow_name,
            steps = self.graph.len(),
            "Run started"
        );
        Ok(())
    }

    async fn run(mut self) -> Run {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut workers = JoinSet::new();

        let stop = self.drive(&tx, &mut rx, &mut workers).await;
        self.finish(stop, &mut rx, &mut workers).await;
        self.run
    }

    async fn drive(
        &mut self,
        tx: &mpsc::UnboundedSender<Completion>,
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        workers: &mut JoinSet<()>,
    ) -> Stop {
        let cancel = self.cancel.clone();
        let limit = self.options.max_duration;
        let deadline = limit.map(|d| self.clock + d);
        let timeout = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);
        let max_in_flight = self.options.max_in_flight.max(1);

        loop {
            while self.in_flight < max_in_flight && !cancel.is_cancelled() {
                let Some(id) = self.ready.pop_front() else {
                    break;
                };
                if let Err(e) = self.dispatch(id, tx, workers).await {
                    return Stop::Fatal(e);
                }
            }

            if self.in_flight == 0 && self.ready.is_empty() {
                return Stop::Completed;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Stop::Cancelled("run cancelled".into());
                }
                _ = &mut timeout => {
                    let secs = limit.map(|d| d.as_secs()).unwrap_or_default();
                    return Stop::Cancelled(format!("run exceeded max duration of {}s", secs));
                }
                Some((id, outcome)) = rx.recv() => {
                    self.in_flight -= 1;
                    if let Err(e) = self.complete(id, outcome).await {
                        return Stop::Fatal(e);
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }
    }

    async fn dispatch(
        &mut self,
        id: NodeId,
        tx: &mpsc::UnboundedSender<Completion>,
        workers: &mut JoinSet<()>,
    ) -> Result<()> {
        let name = self.graph.node(id).name.clone();
        let state = &mut self.run.steps[id.0];
        state.status = StepStatus::Running;
        state.start_time = Some(Utc::now());
        self.started_at[id.0] = Some(Instant::now());

        self.emit(ExecutionEvent::StepStart { step: name.clone() }).await?;
        self.in_flight += 1;
        debug!(run_id = %self.run.run_id, step = %name, "Step dispatched");

        let graph = Arc::clone(&self.graph);
        let invoker = Arc::clone(&self.invoker);
        let snapshot = self.context.snapshot();
        let options = self.options.invoke.clone();
        let token = self.cancel.child_token();
        let run_id = self.run.run_id.clone();
        let tx = tx.clone();

        workers.spawn(async move {
            let node = graph.node(id);
            let outcome = AssertUnwindSafe(invoker.invoke(&run_id, node, snapshot, &options, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| StepOutcome::failed(1, "step handler panicked"));
            let _ = tx.send((id, outcome));
        });
        Ok(())
    }

    async fn complete(&mut self, id: NodeId, outcome: StepOutcome) -> Result<()> {
        let name = self.graph.node(id).name.clone();
        let duration_ms = self.elapsed_ms(id);

        if let (StepStatus::Success, Some(output)) = (outcome.status, &outcome.output) {
            if let Err(e) = self.context.insert(&name, output.clone()) {
                warn!(run_id = %self.run.run_id, step = %name, error = %e, "Duplicate step output ignored");
            }
        }

        let state = &mut self.run.steps[id.0];
        state.status = outcome.status;
        state.end_time = Some(Utc::now());
        state.attempt_count = outcome.attempts;
        state.output = outcome.output;
        state.error = outcome.error.clone();
        state.backend_used = outcome.backend_used.clone();
        state.tokens_used = outcome.tokens_used;

        match outcome.status {
            StepStatus::Success => info!(
                run_id = %self.run.run_id,
                step = %name,
                duration_ms,
                attempts = outcome.attempts,
                backend = ?outcome.backend_used,
                "Step succeeded"
            ),
            status => warn!(
                run_id = %self.run.run_id,
                step = %name,
                %status,
                attempts = outcome.attempts,
                error = ?outcome.error,
                "Step did not succeed"
            ),
        }

        self.emit(ExecutionEvent::StepEnd {
            step: name,
            status: outcome.status,
            duration_ms,
            backend_used: outcome.backend_used,
            tokens_used: outcome.tokens_used,
            attempts: outcome.attempts,
            error: outcome.error,
        })
        .await?;

        self.release_dependents(id).await?;
        self.save().await
    }

    /// Account for a finished step in its dependents: enqueue those that
    /// became ready, cascade skips through those that cannot run.
    async fn release_dependents(&mut self, id: NodeId) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let mut finished = vec![id];

        while let Some(done) = finished.pop() {
            let succeeded = self.run.steps[done.0].status == StepStatus::Success;
            for &dep in &graph.node(done).dependents {
                self.waiting_on[dep.0] -= 1;
                if !succeeded {
                    self.blocked[dep.0] = true;
                }
                if self.run.steps[dep.0].status.is_terminal() {
                    continue;
                }

                let node = graph.node(dep);
                if self.blocked[dep.0] && node.on_failure == FailurePolicy::PropagateSkip {
                    self.skip(dep, &graph.node(done).name).await?;
                    finished.push(dep);
                } else if self.waiting_on[dep.0] == 0 {
                    self.ready.push_back(dep);
                }
            }
        }
        Ok(())
    }

    async fn skip(&mut self, id: NodeId, because_of: &str) -> Result<()> {
        let name = self.graph.node(id).name.clone();
        let state = &mut self.run.steps[id.0];
        state.status = StepStatus::Skipped;
        state.end_time = Some(Utc::now());
        info!(run_id = %self.run.run_id, step = %name, dependency = %because_of, "Step skipped");

        self.emit(ExecutionEvent::StepEnd {
            step: name,
            status: StepStatus::Skipped,
            duration_ms: 0,
            backend_used: None,
            tokens_used: 0,
            attempts: 0,
            error: None,
        })
        .await
    }

    async fn finish(
        &mut self,
        stop: Stop,
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        workers: &mut JoinSet<()>,
    ) {
        let status = match stop {
            Stop::Completed => {
                // Nothing should be left; anything that is was unreachable.
                self.cancel_remaining("step was never scheduled").await;
                if self
                    .run
                    .steps
                    .iter()
                    .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
                {
                    RunStatus::Failed
                } else {
                    RunStatus::Success
                }
            }
            Stop::Cancelled(reason) => {
                warn!(run_id = %self.run.run_id, reason = %reason, "Cancelling run");
                self.shutdown(&reason, rx, workers).await;
                self.run.error = Some(reason);
                RunStatus::Cancelled
            }
            Stop::Fatal(e) => {
                error!(run_id = %self.run.run_id, error = %e, "Run aborted");
                let message = e.to_string();
                self.shutdown(&format!("run aborted: {}", message), rx, workers).await;
                self.emit_best_effort(ExecutionEvent::Error {
                    message: message.clone(),
                })
                .await;
                self.run.error = Some(message);
                RunStatus::Failed
            }
        };

        self.run.status = status;
        self.run.end_time = Some(Utc::now());

        if let Err(e) = self.save().await {
            error!(run_id = %self.run.run_id, error = %e, "Failed to save final run state");
            if self.run.status != RunStatus::Failed || self.run.error.is_none() {
                self.run.status = RunStatus::Failed;
                self.run.error = Some(e.to_string());
                self.emit_best_effort(ExecutionEvent::Error {
                    message: e.to_string(),
                })
                .await;
            }
        }

        let duration_ms = self.clock.elapsed().as_millis() as u64;
        self.emit_best_effort(ExecutionEvent::WorkflowEnd {
            status: self.run.status,
            duration_ms,
        })
        .await;

        info!(
            run_id = %self.run.run_id,
            status = %self.run.status,
            duration_ms,
            failed = self.run.failed_count(),
            "Run finished"
        );
    }

    /// Cancel in-flight work, give it `cancel_grace` to wind down, abort the
    /// rest, and mark every unfinished step Cancelled.
    async fn shutdown(
        &mut self,
        reason: &str,
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        workers: &mut JoinSet<()>,
    ) {
        self.cancel.cancel();
        self.ready.clear();

        if self.in_flight > 0 {
            let grace = tokio::time::sleep(self.options.cancel_grace);
            tokio::pin!(grace);
            while self.in_flight > 0 {
                tokio::select! {
                    _ = &mut grace => {
                        warn!(
                            run_id = %self.run.run_id,
                            in_flight = self.in_flight,
                            "Aborting steps that did not stop within the grace period"
                        );
                        break;
                    }
                    Some((id, outcome)) = rx.recv() => {
                        self.in_flight -= 1;
                        self.cancel_step(id, reason, Some(outcome)).await;
                    }
                }
            }
        }

        workers.abort_all();
        self.in_flight = 0;
        self.cancel_remaining(reason).await;
    }

    async fn cancel_remaining(&mut self, reason: &str) {
        for i in 0..self.run.steps.len() {
            if !self.run.steps[i].status.is_terminal() {
                self.cancel_step(NodeId(i), reason, None).await;
            }
        }
    }

    /// Mark a step Cancelled. A late outcome only contributes its accounting.
    async fn cancel_step(&mut self, id: NodeId, reason: &str, outcome: Option<StepOutcome>) {
        let duration_ms = self.elapsed_ms(id);
        let state = &mut self.run.steps[id.0];
        state.status = StepStatus::Cancelled;
        state.end_time = Some(Utc::now());
        state.error = Some(reason.to_string());
        if let Some(o) = &outcome {
            state.attempt_count = o.attempts;
            state.backend_used = o.backend_used.clone();
            state.tokens_used = o.tokens_used;
        }
        let event = ExecutionEvent::StepEnd {
            step: state.name.clone(),
            status: StepStatus::Cancelled,
            duration_ms,
            backend_used: state.backend_used.clone(),
            tokens_used: state.tokens_used,
            attempts: state.attempt_count,
            error: state.error.clone(),
        };
        self.emit_best_effort(event).await;
    }

    fn elapsed_ms(&self, id: NodeId) -> u64 {
        self.started_at[id.0]
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    async fn emit(&mut self, event: ExecutionEvent) -> Result<()> {
        let event = RunEvent {
            run_id: self.run.run_id.clone(),
            seq: self.seq,
            timestamp: Utc::now(),
            event,
        };
        self.seq += 1;

        let recorded = match &self.recorder {
            Some(recorder) => recorder
                .record_event(event.clone())
                .await
                .map_err(|e| WeftError::Recorder(e.to_string())),
            None => Ok(()),
        };

        // The handle's receiver may already be gone.
        let _ = self.events.send(event.clone());
        self.event_bus.publish(event);
        recorded
    }

    async fn emit_best_effort(&mut self, event: ExecutionEvent) {
        if let Err(e) = self.emit(event).await {
            debug!(run_id = %self.run.run_id, error = %e, "Event not recorded");
        }
    }

    async fn save(&self) -> Result<()> {
        match &self.recorder {
            Some(recorder) => recorder
                .save_run(self.run.clone())
                .await
                .map_err(|e| WeftError::Recorder(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use serde_json::json;
    use weft_core::config::CircuitConfig;
    use weft_core::workflow::{StepDefinition, WorkflowDefinition};
    use weft_router::{BackendRouter, CircuitBreakerStore};
    use weft_test_utils::{chain_workflow, collect_events, diamond_workflow, ConcurrencyProbe};

    use crate::graph::compile;
    use crate::registry::HandlerRegistry;

    fn executor(handlers: HandlerRegistry) -> DagExecutor {
        let router = BackendRouter::new(Arc::new(CircuitBreakerStore::new(CircuitConfig::default())));
        let invoker = Arc::new(StepInvoker::new(Arc::new(router), Arc::new(handlers)));
        DagExecutor::new(invoker, Arc::new(EventBus::default()))
    }

    async fn run(
        exec: &DagExecutor,
        def: &WorkflowDefinition,
        options: ExecutionOptions,
    ) -> (Run, Vec<RunEvent>) {
        let graph = Arc::new(compile(def).unwrap());
        let inputs = def.resolve_inputs(&ValueMap::new()).unwrap();
        let mut handle = exec.execute(graph, RunId::new(), inputs, options).await.unwrap();
        let events = collect_events(handle.events()).await;
        (handle.wait().await.unwrap(), events)
    }

    fn positions(events: &[RunEvent]) -> HashMap<(String, &'static str), usize> {
        let mut out = HashMap::new();
        for (i, e) in events.iter().enumerate() {
            match &e.event {
                ExecutionEvent::StepStart { step } => {
                    out.insert((step.clone(), "start"), i);
                }
                ExecutionEvent::StepEnd { step, .. } => {
                    assert!(out.insert((step.clone(), "end"), i).is_none(), "two step_end for {}", step);
                }
                _ => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn test_diamond_runs_to_success() {
        let exec = executor(HandlerRegistry::with_builtins());
        let (run, events) = run(&exec, &diamond_workflow(), ExecutionOptions::default()).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps.len(), 4);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(
            run.step("d").unwrap().output,
            Some(json!({"joined": "weft/weft"}))
        );

        // Ordered, gap-free sequence numbers bracketed by start and end.
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.seq, i as u64);
        }
        assert_eq!(events.first().unwrap().event.kind(), "workflow_start");
        assert!(events.last().unwrap().is_terminal());

        // A dependent never starts before its dependency ends.
        let pos = positions(&events);
        for (dep, step) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
            assert!(pos[&(dep.to_string(), "end")] < pos[&(step.to_string(), "start")]);
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_transitively() {
        let exec = executor(HandlerRegistry::with_builtins());
        let def = WorkflowDefinition::new("skips")
            .with_step(StepDefinition::deterministic("a", "fail").bind_literal("message", json!("boom")))
            .with_step(StepDefinition::deterministic("b", "passthrough").after(&["a"]))
            .with_step(StepDefinition::deterministic("c", "passthrough").after(&["b"]))
            .with_step(StepDefinition::deterministic("side", "passthrough"));

        let (run, events) = run(&exec, &def, ExecutionOptions::default()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step("a").unwrap().status, StepStatus::Failed);
        assert!(run.step("a").unwrap().error.as_deref().unwrap().contains("boom"));
        assert_eq!(run.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step("side").unwrap().status, StepStatus::Success);
        assert!(run.step("b").unwrap().error.is_none());

        let pos = positions(&events);
        assert!(!pos.contains_key(&("b".to_string(), "start")));
        assert!(pos.contains_key(&("b".to_string(), "end")));
    }

    #[tokio::test]
    async fn test_continue_policy_runs_after_failure() {
        let exec = executor(HandlerRegistry::with_builtins());
        let def = WorkflowDefinition::new("cont")
            .with_step(StepDefinition::deterministic("a", "fail"))
            .with_step(
                StepDefinition::deterministic("cleanup", "passthrough")
                    .after(&["a"])
                    .continue_on_failure()
                    .bind("prev", "context.steps.a ?? 'none'"),
            );

        let (run, _) = run(&exec, &def, ExecutionOptions::default()).await;
        let cleanup = run.step("cleanup").unwrap();
        assert_eq!(cleanup.status, StepStatus::Success);
        assert_eq!(cleanup.output, Some(json!({"prev": "none"})));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_in_flight_is_respected() {
        let probe = Arc::new(ConcurrencyProbe::new("probe", Duration::from_millis(100)));
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(probe.clone());
        let exec = executor(handlers);
        let def = weft_test_utils::fan_out_workflow("fan", "probe", 6);

        let options = ExecutionOptions {
            max_in_flight: 2,
            ..ExecutionOptions::default()
        };
        let (run, _) = run(&exec, &def, options).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn test_every_step_gets_one_terminal_state() {
        let exec = executor(HandlerRegistry::with_builtins());
        let def = chain_workflow("chain", "passthrough", 10);
        let (run, events) = run(&exec, &def, ExecutionOptions::default()).await;
        assert_eq!(run.steps.len(), 10);
        assert!(run.steps.iter().all(|s| s.status.is_terminal()));
        let ends = events.iter().filter(|e| e.event.kind() == "step_end").count();
        assert_eq!(ends, 10);
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds() {
        let exec = executor(HandlerRegistry::new());
        let (run, events) = run(&exec, &WorkflowDefinition::new("empty"), ExecutionOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel() {
        let exec = executor(HandlerRegistry::with_builtins());
        let def = WorkflowDefinition::new("slow")
            .with_step(StepDefinition::deterministic("wait", "sleep").bind_literal("ms", json!(60_000)))
            .with_step(StepDefinition::deterministic("after", "passthrough").after(&["wait"]));
        let graph = Arc::new(compile(&def).unwrap());

        let mut handle = exec
            .execute(graph, RunId::new(), ValueMap::new(), ExecutionOptions::default())
            .await
            .unwrap();
        // workflow_start, then step_start for `wait`.
        handle.next_event().await.unwrap();
        handle.next_event().await.unwrap();
        handle.cancel();

        let run = handle.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.step("wait").unwrap().status, StepStatus::Cancelled);
        assert_eq!(run.step("after").unwrap().status, StepStatus::Cancelled);
        assert!(run.steps.iter().all(|s| s.error.is_some()));
        assert_eq!(run.error.as_deref(), Some("run cancelled"));
    }

    /// Recorder that accepts a fixed number of events, then fails.
    struct FlakyRecorder {
        budget: AtomicUsize,
    }

    impl RunRecorder for FlakyRecorder {
        fn record_event(&self, _event: RunEvent) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                let left = self.budget.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(WeftError::Database("disk full".into()));
                }
                self.budget.store(left - 1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn save_run(&self, _run: Run) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn load_run(&self, _run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>> {
            Box::pin(async { Ok(None) })
        }

        fn list_runs(&self, _filter: RunFilter) -> BoxFuture<'_, Result<Vec<Run>>> {
            Box::pin(async { Ok(vec![]) })
        }

        fn load_events(&self, _run_id: RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
            Box::pin(async { Ok(vec![]) })
        }
    }

    #[tokio::test]
    async fn test_recorder_failure_fails_the_run() {
        let exec = executor(HandlerRegistry::with_builtins()).with_recorder(Arc::new(FlakyRecorder {
            budget: AtomicUsize::new(3),
        }));
        let def = chain_workflow("chain", "passthrough", 5);
        let (run, events) = run(&exec, &def, ExecutionOptions::default()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("disk full"));
        assert!(run.steps.iter().all(|s| s.status.is_terminal()));
        // Work finished before the failure is kept.
        assert_eq!(run.steps[0].status, StepStatus::Success);
        assert!(run.steps[1..].iter().any(|s| s.status == StepStatus::Cancelled));
        assert!(events.iter().any(|e| e.event.kind() == "error"));
    }

    #[tokio::test]
    async fn test_recorder_failure_at_start_rejects_run() {
        let exec = executor(HandlerRegistry::with_builtins()).with_recorder(Arc::new(FlakyRecorder {
            budget: AtomicUsize::new(0),
        }));
        let graph = Arc::new(compile(&chain_workflow("c", "passthrough", 1)).unwrap());
        let result = exec
            .execute(graph, RunId::new(), ValueMap::new(), ExecutionOptions::default())
            .await;
        assert!(matches!(result, Err(WeftError::Recorder(_))));
    }

    #[tokio::test]
    async fn test_events_reach_the_bus() {
        let exec = executor(HandlerRegistry::with_builtins());
        let mut rx = exec.event_bus.subscribe();
        let (run, events) = run(&exec, &chain_workflow("c", "passthrough", 2), ExecutionOptions::default()).await;

        let mut seen = 0;
        while let Ok(e) = rx.try_recv() {
            assert_eq!(e.run_id, run.run_id);
            seen += 1;
        }
        assert_eq!(seen, events.len());
    }
}
