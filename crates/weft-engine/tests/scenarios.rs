use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Barrier;

use weft_core::config::{CircuitConfig, TierConfig};
use weft_core::error::{BackendError, CompileError};
use weft_core::event::EventBus;
use weft_core::traits::Backend;
use weft_core::types::*;
use weft_core::workflow::{StepDefinition, WorkflowDefinition};
use weft_engine::{
    compile, DagExecutor, ExecutionOptions, HandlerRegistry, InvokeOptions, RuntimeMode,
    StepInvoker,
};
use weft_router::{BackendRouter, CircuitBreakerStore, CircuitStatus};
use weft_test_utils::{collect_events, BarrierHandler, FlakyHandler, ScriptedBackend};

struct Harness {
    executor: DagExecutor,
    router: Arc<BackendRouter>,
}

fn harness(handlers: HandlerRegistry, backends: Vec<Arc<ScriptedBackend>>, circuit: CircuitConfig) -> Harness {
    let circuits = Arc::new(CircuitBreakerStore::new(circuit));
    let mut router = BackendRouter::new(circuits);
    let names = backends.iter().map(|b| b.name().to_string()).collect();
    for b in backends {
        router.add_backend(b, vec![]);
    }
    router.add_tier(TierConfig {
        name: "fast".into(),
        backends: names,
        escalate_to: None,
    });
    let router = Arc::new(router);
    let invoker = Arc::new(StepInvoker::new(Arc::clone(&router), Arc::new(handlers)));
    Harness {
        executor: DagExecutor::new(invoker, Arc::new(EventBus::default())),
        router,
    }
}

fn options() -> ExecutionOptions {
    ExecutionOptions {
        invoke: InvokeOptions {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..InvokeOptions::default()
        },
        ..ExecutionOptions::default()
    }
}

async fn run(h: &Harness, def: &WorkflowDefinition, options: ExecutionOptions) -> (Run, Vec<RunEvent>) {
    let graph = Arc::new(compile(def).unwrap());
    let inputs = def.resolve_inputs(&ValueMap::new()).unwrap();
    let mut handle = h
        .executor
        .execute(graph, RunId::new(), inputs, options)
        .await
        .unwrap();
    let events = collect_events(handle.events()).await;
    (handle.wait().await.unwrap(), events)
}

fn assert_one_terminal_state_per_step(def: &WorkflowDefinition, run: &Run, events: &[RunEvent]) {
    assert_eq!(run.steps.len(), def.steps.len());
    for step in &def.steps {
        let state = run.step(&step.name).unwrap();
        assert!(state.status.is_terminal(), "{} is {}", step.name, state.status);
        if matches!(state.status, StepStatus::Failed | StepStatus::Cancelled) {
            assert!(state.error.is_some(), "{} has no error message", step.name);
        }
        let ends = events
            .iter()
            .filter(|e| matches!(&e.event, ExecutionEvent::StepEnd { step: s, .. } if s == &step.name))
            .count();
        assert_eq!(ends, 1, "{} has {} step_end events", step.name, ends);
    }
}

#[tokio::test]
async fn fan_out_branches_run_concurrently() {
    let barrier = Arc::new(Barrier::new(2));
    let mut handlers = HandlerRegistry::with_builtins();
    handlers.register(BarrierHandler::new("rendezvous", barrier));
    let h = harness(handlers, vec![], CircuitConfig::default());

    let def = WorkflowDefinition::new("fan")
        .with_step(StepDefinition::deterministic("A", "passthrough"))
        .with_step(StepDefinition::deterministic("B", "rendezvous").after(&["A"]))
        .with_step(StepDefinition::deterministic("C", "rendezvous").after(&["A"]));

    // B and C can only pass the barrier together.
    let (run, events) = tokio::time::timeout(Duration::from_secs(5), run(&h, &def, options()))
        .await
        .expect("B and C did not run concurrently");

    assert_eq!(run.status, RunStatus::Success);
    assert_one_terminal_state_per_step(&def, &run, &events);
}

#[tokio::test(start_paused = true)]
async fn failing_step_exhausts_retries_and_skips_dependent() {
    let backend = Arc::new(ScriptedBackend::failing(
        "primary",
        BackendError::Server {
            status: 503,
            message: "unavailable".into(),
        },
    ));
    let h = harness(HandlerRegistry::new(), vec![backend.clone()], CircuitConfig::default());

    let def = WorkflowDefinition::new("retry")
        .with_step(StepDefinition::model("A", "fast").with_attempts(3))
        .with_step(StepDefinition::model("B", "fast").after(&["A"]));

    let (run, events) = run(&h, &def, options()).await;

    let a = run.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.attempt_count, 3);
    assert_eq!(backend.calls(), 3);
    assert_eq!(run.step("B").unwrap().status, StepStatus::Skipped);
    assert_eq!(run.status, RunStatus::Failed);
    assert_one_terminal_state_per_step(&def, &run, &events);
}

#[test]
fn self_dependency_is_rejected_naming_the_step() {
    let def = WorkflowDefinition::new("selfish")
        .with_step(StepDefinition::deterministic("A", "passthrough").after(&["A"]));
    let err = compile(&def).unwrap_err();
    assert!(matches!(&err, CompileError::SelfDependency(name) if name == "A"));
    assert_eq!(err.steps(), vec!["A"]);
}

#[test]
fn cycle_reports_a_real_member() {
    let def = WorkflowDefinition::new("loop")
        .with_step(StepDefinition::deterministic("entry", "passthrough"))
        .with_step(StepDefinition::deterministic("x", "passthrough").after(&["entry", "z"]))
        .with_step(StepDefinition::deterministic("y", "passthrough").after(&["x"]))
        .with_step(StepDefinition::deterministic("z", "passthrough").after(&["y"]));
    match compile(&def).unwrap_err() {
        CompileError::Cycle(members) => {
            assert!(members.iter().all(|m| ["x", "y", "z"].contains(&m.as_str())));
            assert!(!members.is_empty());
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn run_timeout_cancels_slow_step() {
    let backend = Arc::new(
        ScriptedBackend::ok("slow", json!("late"))
            .with_delay(Duration::from_secs(30))
            .with_timeout_secs(120),
    );
    let h = harness(HandlerRegistry::with_builtins(), vec![backend], CircuitConfig::default());

    let def = WorkflowDefinition::new("timeout")
        .with_step(StepDefinition::model("A", "fast"))
        .with_step(StepDefinition::deterministic("B", "passthrough").after(&["A"]));
    let opts = ExecutionOptions {
        max_duration: Some(Duration::from_secs(5)),
        ..options()
    };

    let started = tokio::time::Instant::now();
    let (run, events) = run(&h, &def, opts).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step("A").unwrap().status, StepStatus::Cancelled);
    assert!(run.steps.iter().all(|s| s.status != StepStatus::Success));
    assert!(!events.iter().any(|e| matches!(
        &e.event,
        ExecutionEvent::StepEnd { status: StepStatus::Success, .. }
    )));
    assert!(run.error.as_deref().unwrap().contains("max duration"));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_one_terminal_state_per_step(&def, &run, &events);
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let backend = Arc::new(ScriptedBackend::failing(
        "flaky",
        BackendError::Server {
            status: 500,
            message: "boom".into(),
        },
    ));
    let circuit = CircuitConfig {
        failure_threshold: 3,
        ..CircuitConfig::default()
    };
    let h = harness(HandlerRegistry::new(), vec![backend.clone()], circuit);
    let def = WorkflowDefinition::new("one").with_step(StepDefinition::model("A", "fast"));

    for _ in 0..3 {
        let (run, _) = run(&h, &def, options()).await;
        assert_eq!(run.status, RunStatus::Failed);
    }
    assert_eq!(h.router.circuits().status("flaky"), CircuitStatus::Open);

    // The open circuit is skipped without calling the backend.
    let (run, _) = run(&h, &def, options()).await;
    assert_eq!(backend.calls(), 3);
    let error = run.step("A").unwrap().error.clone().unwrap();
    assert!(error.contains("exhausted"), "{error}");
}

#[tokio::test]
async fn dependents_never_start_before_dependencies_end() {
    let h = harness(HandlerRegistry::with_builtins(), vec![], CircuitConfig::default());
    let def = WorkflowDefinition::new("layers")
        .with_step(StepDefinition::deterministic("root", "passthrough"))
        .with_step(StepDefinition::deterministic("l1a", "passthrough").after(&["root"]))
        .with_step(StepDefinition::deterministic("l1b", "passthrough").after(&["root"]))
        .with_step(StepDefinition::deterministic("l1c", "passthrough").after(&["root"]))
        .with_step(StepDefinition::deterministic("l2", "passthrough").after(&["l1a", "l1b"]))
        .with_step(StepDefinition::deterministic("l3", "passthrough").after(&["l2", "l1c"]));

    let (run, events) = run(&h, &def, options()).await;
    assert_eq!(run.status, RunStatus::Success);

    let mut pos: HashMap<(String, &str), usize> = HashMap::new();
    for (i, e) in events.iter().enumerate() {
        match &e.event {
            ExecutionEvent::StepStart { step } => {
                pos.insert((step.clone(), "start"), i);
            }
            ExecutionEvent::StepEnd { step, .. } => {
                pos.insert((step.clone(), "end"), i);
            }
            _ => {}
        }
    }
    for step in &def.steps {
        for dep in &step.depends_on {
            assert!(
                pos[&(dep.clone(), "end")] < pos[&(step.name.clone(), "start")],
                "{} started before {} ended",
                step.name,
                dep
            );
        }
    }
    assert_one_terminal_state_per_step(&def, &run, &events);
}

#[tokio::test(start_paused = true)]
async fn flaky_step_recovers_within_budget() {
    let mut handlers = HandlerRegistry::new();
    let flaky = Arc::new(FlakyHandler::new("flaky", 2));
    handlers.register_arc(flaky.clone());
    let h = harness(handlers, vec![], CircuitConfig::default());

    let def = WorkflowDefinition::new("recover")
        .with_step(StepDefinition::deterministic("A", "flaky").with_attempts(3).with_backoff(5));
    let (run, _) = run(&h, &def, options()).await;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step("A").unwrap().attempt_count, 3);
    assert_eq!(run.step("A").unwrap().output, Some(json!("ok")));
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn dry_run_does_not_call_backends() {
    let backend = Arc::new(ScriptedBackend::ok("primary", json!("real")));
    let h = harness(HandlerRegistry::with_builtins(), vec![backend.clone()], CircuitConfig::default());

    let def = WorkflowDefinition::new("dry")
        .with_step(StepDefinition::model("draft", "fast").bind_literal("topic", json!("rust")))
        .with_step(
            StepDefinition::deterministic("publish", "passthrough")
                .after(&["draft"])
                .bind("text", "context.draft.topic"),
        );
    let mut opts = options();
    opts.invoke.mode = RuntimeMode::DryRun;

    let (run, _) = run(&h, &def, opts).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(backend.calls(), 0);
    assert_eq!(run.step("draft").unwrap().backend_used.as_deref(), Some("dry-run"));
    assert_eq!(run.step("publish").unwrap().output, Some(json!({"text": "rust"})));
}
