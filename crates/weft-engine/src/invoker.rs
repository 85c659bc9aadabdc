use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::{EvalError, Result, RoutingError, WeftError};
use weft_core::types::{InvocationRequest, RunId, StepStatus, ValueMap};
use weft_router::{calculate_backoff, BackendRouter};

use crate::context::ContextSnapshot;
use crate::graph::{evaluate, CompiledBinding, GraphNode, StepKind};
use crate::registry::HandlerRegistry;

/// Backend name reported for model-backed steps in dry-run mode.
pub const DRY_RUN_BACKEND: &str = "dry-run";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    #[default]
    Live,
    /// Model-backed steps return their resolved inputs instead of being routed.
    DryRun,
}

/// Per-run settings for invoking steps.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub mode: RuntimeMode,
    /// Overrides every step's own `max_attempts`.
    pub max_attempts_override: Option<u32>,
    pub default_max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Live,
            max_attempts_override: None,
            default_max_attempts: 1,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl InvokeOptions {
    pub fn max_attempts(&self, node: &GraphNode) -> u32 {
        self.max_attempts_override
            .or(node.retry.max_attempts)
            .unwrap_or(self.default_max_attempts)
            .max(1)
    }
}

/// Final result of running one step, with all its attempts.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Success, Failed, or Cancelled.
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub backend_used: Option<String>,
    pub tokens_used: u64,
}

impl StepOutcome {
    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts,
            backend_used: None,
            tokens_used: 0,
        }
    }

    pub fn cancelled(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Cancelled,
            ..Self::failed(attempts, error)
        }
    }
}

struct Attempt {
    output: Value,
    backend: Option<String>,
    tokens: u64,
}

/// Runs a single step: resolves its inputs, then calls the handler or the
/// router, retrying with backoff until success, cancellation, or the attempt
/// budget is spent.
pub struct StepInvoker {
    router: Arc<BackendRouter>,
    handlers: Arc<HandlerRegistry>,
}

impl StepInvoker {
    pub fn new(router: Arc<BackendRouter>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { router, handlers }
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub async fn invoke(
        &self,
        run_id: &RunId,
        node: &GraphNode,
        snapshot: ContextSnapshot,
        options: &InvokeOptions,
        cancel: CancellationToken,
    ) -> StepOutcome {
        let max_attempts = options.max_attempts(node);
        let base_ms = node.retry.backoff_ms.unwrap_or(options.initial_backoff_ms);
        let max_ms = node.retry.max_backoff_ms.unwrap_or(options.max_backoff_ms);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return StepOutcome::cancelled(attempts, "cancelled before the step could run");
            }
            attempts += 1;

            // Deterministic, so a failure here is not retried.
            let inputs = match resolve_bindings(node, &snapshot) {
                Ok(inputs) => inputs,
                Err((binding, e)) => {
                    return StepOutcome::failed(
                        attempts,
                        format!("binding '{}': {}", binding, e),
                    );
                }
            };

            let attempt = self.attempt(run_id, node, inputs, options.mode, &cancel);
            let result = match node.timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(r) => r,
                    Err(_) => Err(WeftError::Timeout(limit.as_secs())),
                },
                None => attempt.await,
            };

            let error = match result {
                Ok(done) => {
                    debug!(run_id = %run_id, step = %node.name, attempts, "Step succeeded");
                    return StepOutcome {
                        status: StepStatus::Success,
                        output: Some(done.output),
                        error: None,
                        attempts,
                        backend_used: done.backend,
                        tokens_used: done.tokens,
                    };
                }
                Err(WeftError::Cancelled) | Err(WeftError::Routing(RoutingError::Cancelled)) => {
                    return StepOutcome::cancelled(attempts, "step cancelled");
                }
                Err(e) => e,
            };

            if attempts >= max_attempts {
                return match error {
                    WeftError::Timeout(_) => StepOutcome::cancelled(
                        attempts,
                        format!("step timed out on final attempt: {}", error),
                    ),
                    other => StepOutcome::failed(attempts, other.to_string()),
                };
            }

            let backoff = calculate_backoff(attempts - 1, base_ms, max_ms);
            warn!(
                run_id = %run_id,
                step = %node.name,
                attempt = attempts,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying step"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return StepOutcome::cancelled(attempts, format!("cancelled while backing off after: {}", error));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn attempt(
        &self,
        run_id: &RunId,
        node: &GraphNode,
        inputs: ValueMap,
        mode: RuntimeMode,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        match &node.kind {
            StepKind::Deterministic { handler_id } => {
                let output = self.handlers.run(handler_id, inputs, cancel.child_token()).await?;
                Ok(Attempt {
                    output,
                    backend: None,
                    tokens: 0,
                })
            }
            StepKind::ModelBacked { .. } if mode == RuntimeMode::DryRun => Ok(Attempt {
                output: Value::Object(inputs),
                backend: Some(DRY_RUN_BACKEND.to_string()),
                tokens: 0,
            }),
            StepKind::ModelBacked {
                tier,
                capability,
                escalate,
            } => {
                let request = InvocationRequest {
                    run_id: run_id.clone(),
                    step: node.name.clone(),
                    tier: tier.clone(),
                    capability: capability.clone(),
                    inputs,
                };
                let result = self
                    .router
                    .route(tier, capability.as_deref(), *escalate, request, cancel)
                    .await?;
                Ok(Attempt {
                    output: result.output,
                    backend: Some(result.backend),
                    tokens: result.tokens_used,
                })
            }
        }
    }
}

/// Resolve every binding of a step. A failing expression falls back to the
/// binding's default when one is declared.
pub fn resolve_bindings(
    node: &GraphNode,
    snapshot: &ContextSnapshot,
) -> std::result::Result<ValueMap, (String, EvalError)> {
    let mut inputs = ValueMap::new();
    for (key, binding) in &node.bindings {
        let value = match binding {
            CompiledBinding::Literal(v) => v.clone(),
            CompiledBinding::Expr { expr, default } => match (evaluate(expr, snapshot), default) {
                (Ok(v), _) => v,
                (Err(_), Some(d)) => d.clone(),
                (Err(e), None) => return Err((key.clone(), e)),
            },
        };
        inputs.insert(key.clone(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use weft_core::config::{CircuitConfig, TierConfig};
    use weft_core::error::BackendError;
    use weft_core::workflow::{StepDefinition, WorkflowDefinition};
    use weft_router::CircuitBreakerStore;
    use weft_test_utils::{FlakyHandler, ScriptedBackend};

    use crate::graph::compile;

    fn node(step: StepDefinition) -> GraphNode {
        let graph = compile(&WorkflowDefinition::new("t").with_step(step)).unwrap();
        graph.nodes()[0].clone()
    }

    fn snapshot() -> ContextSnapshot {
        let mut inputs = ValueMap::new();
        inputs.insert("topic".into(), json!("rust"));
        ContextSnapshot::new(inputs, HashMap::new())
    }

    fn invoker_with(handlers: HandlerRegistry, backends: Vec<Arc<ScriptedBackend>>) -> StepInvoker {
        let circuits = Arc::new(CircuitBreakerStore::new(CircuitConfig::default()));
        let mut router = BackendRouter::new(circuits);
        let names = backends.iter().map(|b| weft_core::traits::Backend::name(b.as_ref()).to_string()).collect();
        for b in backends {
            router.add_backend(b, vec![]);
        }
        router.add_tier(TierConfig {
            name: "fast".into(),
            backends: names,
            escalate_to: None,
        });
        StepInvoker::new(Arc::new(router), Arc::new(handlers))
    }

    fn options(max_attempts: u32) -> InvokeOptions {
        InvokeOptions {
            default_max_attempts: max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            ..InvokeOptions::default()
        }
    }

    #[tokio::test]
    async fn test_deterministic_success() {
        let invoker = invoker_with(HandlerRegistry::with_builtins(), vec![]);
        let n = node(
            StepDefinition::deterministic("a", "passthrough")
                .bind("t", "context.inputs.topic")
                .bind_literal("n", json!(2)),
        );
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.output, Some(json!({"t": "rust", "n": 2})));
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.backend_used.is_none());
    }

    #[tokio::test]
    async fn test_binding_error_fails_without_retry() {
        let flaky = Arc::new(FlakyHandler::new("flaky", 0));
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(flaky.clone());
        let invoker = invoker_with(handlers, vec![]);
        let n = node(StepDefinition::deterministic("a", "flaky").bind("x", "context.inputs.missing"));

        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(3), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.unwrap().contains("context.inputs.missing"));
        assert_eq!(flaky.calls(), 0);
    }

    #[tokio::test]
    async fn test_binding_default_substitutes() {
        let invoker = invoker_with(HandlerRegistry::with_builtins(), vec![]);
        let n = node(
            StepDefinition::deterministic("a", "passthrough")
                .bind_or("x", "context.inputs.missing", json!("fallback")),
        );
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.output, Some(json!({"x": "fallback"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let flaky = Arc::new(FlakyHandler::new("flaky", 2));
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(flaky.clone());
        let invoker = invoker_with(handlers, vec![]);
        let n = node(StepDefinition::deterministic("a", "flaky").with_attempts(3));

        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let flaky = Arc::new(FlakyHandler::new("flaky", 10));
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(flaky.clone());
        let invoker = invoker_with(handlers, vec![]);
        let n = node(StepDefinition::deterministic("a", "flaky").with_attempts(5));

        // The profile override wins over the step's own policy.
        let opts = InvokeOptions {
            max_attempts_override: Some(2),
            ..options(1)
        };
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &opts, CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("scripted failure 2"));
    }

    #[tokio::test]
    async fn test_model_step_routes_to_backend() {
        let backend = Arc::new(ScriptedBackend::ok("local", json!("summary")).with_tokens(33));
        let invoker = invoker_with(HandlerRegistry::new(), vec![backend.clone()]);
        let n = node(StepDefinition::model("a", "fast"));

        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.backend_used.as_deref(), Some("local"));
        assert_eq!(outcome.tokens_used, 33);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_route_is_retried_then_fails() {
        let backend = Arc::new(ScriptedBackend::failing(
            "local",
            BackendError::Server {
                status: 500,
                message: "down".into(),
            },
        ));
        let invoker = invoker_with(HandlerRegistry::new(), vec![backend.clone()]);
        let n = node(StepDefinition::model("a", "fast").with_attempts(3));

        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn test_dry_run_skips_routing() {
        let backend = Arc::new(ScriptedBackend::ok("local", json!("real")));
        let invoker = invoker_with(HandlerRegistry::new(), vec![backend.clone()]);
        let n = node(StepDefinition::model("a", "fast").bind("t", "context.topic"));
        let opts = InvokeOptions {
            mode: RuntimeMode::DryRun,
            ..options(1)
        };

        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &opts, CancellationToken::new())
            .await;
        assert_eq!(outcome.output, Some(json!({"t": "rust"})));
        assert_eq!(outcome.backend_used.as_deref(), Some(DRY_RUN_BACKEND));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_timeout_is_cancelled() {
        let invoker = invoker_with(HandlerRegistry::with_builtins(), vec![]);
        let n = node(
            StepDefinition::deterministic("a", "sleep")
                .bind_literal("ms", json!(60_000))
                .with_timeout(1)
                .with_attempts(2),
        );
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, StepStatus::Cancelled);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let invoker = invoker_with(HandlerRegistry::with_builtins(), vec![]);
        let n = node(StepDefinition::deterministic("a", "passthrough"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), cancel)
            .await;
        assert_eq!(outcome.status, StepStatus::Cancelled);
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let flaky = Arc::new(FlakyHandler::new("flaky", 10));
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(flaky.clone());
        let invoker = invoker_with(handlers, vec![]);
        let mut step = StepDefinition::deterministic("a", "flaky")
            .with_attempts(5)
            .with_backoff(60_000);
        step.retry.max_backoff_ms = Some(120_000);
        let n = node(step);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();
        let outcome = invoker
            .invoke(&RunId::new(), &n, snapshot(), &options(1), cancel)
            .await;
        assert_eq!(outcome.status, StepStatus::Cancelled);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(flaky.calls(), 1);
        // The 48s+ backoff was cut short by the cancel at 1s.
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
