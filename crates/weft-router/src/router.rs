use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::TierConfig;
use weft_core::error::{BackendError, RoutingError};
use weft_core::traits::Backend;
use weft_core::types::{InvocationRequest, InvocationResult};

use crate::circuit::CircuitBreakerStore;

struct BackendEntry {
    backend: Arc<dyn Backend>,
    /// Empty means any capability.
    capabilities: Vec<String>,
}

impl BackendEntry {
    fn supports(&self, capability: Option<&str>) -> bool {
        match capability {
            Some(cap) if !self.capabilities.is_empty() => {
                self.capabilities.iter().any(|c| c == cap)
            }
            _ => true,
        }
    }
}

/// Routes model-backed calls to the backends of a tier, cheapest first,
/// skipping open circuits and falling through on failure.
pub struct BackendRouter {
    tiers: HashMap<String, TierConfig>,
    backends: HashMap<String, BackendEntry>,
    circuits: Arc<CircuitBreakerStore>,
}

impl BackendRouter {
    pub fn new(circuits: Arc<CircuitBreakerStore>) -> Self {
        Self {
            tiers: HashMap::new(),
            backends: HashMap::new(),
            circuits,
        }
    }

    pub fn add_backend(&mut self, backend: Arc<dyn Backend>, capabilities: Vec<String>) {
        let name = backend.name().to_string();
        self.backends.insert(
            name,
            BackendEntry {
                backend,
                capabilities,
            },
        );
    }

    pub fn add_tier(&mut self, tier: TierConfig) {
        self.tiers.insert(tier.name.clone(), tier);
    }

    pub fn has_tier(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tiers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerStore> {
        &self.circuits
    }

    /// Place one call on the first healthy backend of `tier` that supports
    /// `capability`. With `escalate`, an exhausted tier hands over to its
    /// `escalate_to` tier; each tier is visited at most once.
    pub async fn route(
        &self,
        tier: &str,
        capability: Option<&str>,
        escalate: bool,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, RoutingError> {
        if !self.tiers.contains_key(tier) {
            return Err(RoutingError::UnknownTier(tier.to_string()));
        }

        let mut visited = HashSet::new();
        let mut attempted = Vec::new();
        let mut current = Some(tier.to_string());

        while let Some(tier_name) = current.take() {
            if !visited.insert(tier_name.clone()) {
                warn!(tier = %tier_name, "Escalation loop detected, stopping");
                break;
            }
            let Some(tier_config) = self.tiers.get(&tier_name) else {
                warn!(tier = %tier_name, "Escalation target is not a configured tier");
                break;
            };

            for name in &tier_config.backends {
                if cancel.is_cancelled() {
                    return Err(RoutingError::Cancelled);
                }

                let Some(entry) = self.backends.get(name) else {
                    warn!(backend = %name, tier = %tier_name, "Tier references unknown backend");
                    continue;
                };
                if !entry.supports(capability) {
                    debug!(backend = %name, capability = ?capability, "Backend lacks capability, skipping");
                    continue;
                }
                let Some(permit) = self.circuits.try_admit(name) else {
                    debug!(backend = %name, "Circuit open, skipping backend");
                    continue;
                };

                attempted.push(name.clone());
                let mut call = request.clone();
                call.tier = tier_name.clone();

                match self.call(entry, call, cancel).await {
                    Ok(result) => {
                        permit.success();
                        debug!(backend = %name, tier = %tier_name, tokens = result.tokens_used, "Backend call succeeded");
                        return Ok(result);
                    }
                    // Dropping the permit hands back a half-open trial.
                    Err(BackendError::Cancelled) => return Err(RoutingError::Cancelled),
                    Err(e) => {
                        permit.failure();
                        warn!(backend = %name, tier = %tier_name, error = %e, "Backend call failed, trying next candidate");
                    }
                }
            }

            if escalate {
                if let Some(next) = &tier_config.escalate_to {
                    info!(from = %tier_name, to = %next, "Tier exhausted, escalating");
                    current = Some(next.clone());
                }
            }
        }

        Err(RoutingError::Exhausted {
            tier: tier.to_string(),
            attempted,
        })
    }

    async fn call(
        &self,
        entry: &BackendEntry,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, BackendError> {
        let timeout = Duration::from_secs(entry.backend.timeout_secs());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            result = tokio::time::timeout(timeout, entry.backend.invoke(request, cancel.child_token())) => {
                result.unwrap_or(Err(BackendError::Timeout(timeout.as_millis() as u64)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::config::CircuitConfig;
    use weft_core::types::{RunId, ValueMap};
    use weft_test_utils::ScriptedBackend;

    fn request() -> InvocationRequest {
        InvocationRequest {
            run_id: RunId::new(),
            step: "s".into(),
            tier: String::new(),
            capability: None,
            inputs: ValueMap::new(),
        }
    }

    fn tier(name: &str, backends: &[&str], escalate_to: Option<&str>) -> TierConfig {
        TierConfig {
            name: name.into(),
            backends: backends.iter().map(|b| b.to_string()).collect(),
            escalate_to: escalate_to.map(String::from),
        }
    }

    fn store(threshold: u32) -> Arc<CircuitBreakerStore> {
        Arc::new(CircuitBreakerStore::new(CircuitConfig {
            failure_threshold: threshold,
            failure_rate_threshold: 0.0,
            cooldown_ms: 60_000,
            ..CircuitConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_falls_back_to_next_candidate() {
        let cheap = Arc::new(ScriptedBackend::failing(
            "cheap",
            BackendError::RateLimited("slow down".into()),
        ));
        let premium = Arc::new(ScriptedBackend::ok("premium", json!("done")));

        let mut router = BackendRouter::new(store(5));
        router.add_backend(cheap.clone(), vec![]);
        router.add_backend(premium.clone(), vec![]);
        router.add_tier(tier("fast", &["cheap", "premium"], None));

        let result = router
            .route("fast", None, false, request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.backend, "premium");
        assert_eq!(result.output, json!("done"));
        assert_eq!(cheap.calls(), 1);
        assert_eq!(router.circuits().snapshot("cheap").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped_then_exhausted() {
        let flaky = Arc::new(ScriptedBackend::failing(
            "flaky",
            BackendError::Server {
                status: 503,
                message: "unavailable".into(),
            },
        ));
        let mut router = BackendRouter::new(store(2));
        router.add_backend(flaky.clone(), vec![]);
        router.add_tier(tier("fast", &["flaky"], None));

        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let err = router.route("fast", None, false, request(), &cancel).await.unwrap_err();
            assert!(matches!(err, RoutingError::Exhausted { .. }));
        }
        assert_eq!(flaky.calls(), 2);

        let err = router.route("fast", None, false, request(), &cancel).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::Exhausted {
                tier: "fast".into(),
                attempted: vec![],
            }
        );
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let general = Arc::new(ScriptedBackend::ok("general", json!("g")));
        let coder = Arc::new(ScriptedBackend::ok("coder", json!("c")));
        let mut router = BackendRouter::new(store(5));
        router.add_backend(general.clone(), vec!["summarize".into()]);
        router.add_backend(coder.clone(), vec!["code".into()]);
        router.add_tier(tier("fast", &["general", "coder"], None));

        let result = router
            .route("fast", Some("code"), false, request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.backend, "coder");
        assert_eq!(general.calls(), 0);
    }

    #[tokio::test]
    async fn test_escalation_follows_tier_chain() {
        let cheap = Arc::new(ScriptedBackend::failing(
            "cheap",
            BackendError::Request("connection refused".into()),
        ));
        let premium = Arc::new(ScriptedBackend::ok("premium", json!("p")));
        let mut router = BackendRouter::new(store(5));
        router.add_backend(cheap.clone(), vec![]);
        router.add_backend(premium.clone(), vec![]);
        router.add_tier(tier("fast", &["cheap"], Some("strong")));
        router.add_tier(tier("strong", &["premium"], Some("fast")));

        let cancel = CancellationToken::new();
        let err = router.route("fast", None, false, request(), &cancel).await.unwrap_err();
        assert!(matches!(err, RoutingError::Exhausted { .. }));

        let result = router.route("fast", None, true, request(), &cancel).await.unwrap();
        assert_eq!(result.backend, "premium");
    }

    #[tokio::test]
    async fn test_escalation_loop_terminates() {
        let a = Arc::new(ScriptedBackend::failing("a", BackendError::Auth("bad key".into())));
        let b = Arc::new(ScriptedBackend::failing("b", BackendError::Auth("bad key".into())));
        let mut router = BackendRouter::new(store(10));
        router.add_backend(a.clone(), vec![]);
        router.add_backend(b.clone(), vec![]);
        router.add_tier(tier("one", &["a"], Some("two")));
        router.add_tier(tier("two", &["b"], Some("one")));

        let err = router
            .route("one", None, true, request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::Exhausted {
                tier: "one".into(),
                attempted: vec!["a".into(), "b".into()],
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_tier() {
        let router = BackendRouter::new(store(5));
        let err = router
            .route("missing", None, false, request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::UnknownTier("missing".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_a_backend_failure() {
        let slow = Arc::new(
            ScriptedBackend::ok("slow", json!("late")).with_delay(Duration::from_secs(30)),
        );
        let mut router = BackendRouter::new(store(1));
        router.add_backend(slow.clone(), vec![]);
        router.add_tier(tier("fast", &["slow"], None));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = router.route("fast", None, false, request(), &cancel).await.unwrap_err();
        assert_eq!(err, RoutingError::Cancelled);
        assert_eq!(
            router.circuits().status("slow"),
            crate::circuit::CircuitStatus::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout_counts_as_failure() {
        let slow = Arc::new(
            ScriptedBackend::ok("slow", json!("late"))
                .with_delay(Duration::from_secs(30))
                .with_timeout_secs(2),
        );
        let mut router = BackendRouter::new(store(1));
        router.add_backend(slow.clone(), vec![]);
        router.add_tier(tier("fast", &["slow"], None));

        let err = router
            .route("fast", None, false, request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Exhausted { .. }));
        assert_eq!(
            router.circuits().status("slow"),
            crate::circuit::CircuitStatus::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_dropped_by_caller_timeout_is_retried() {
        let slow = Arc::new(
            ScriptedBackend::ok("slow", json!("recovered")).with_delay(Duration::from_secs(30)),
        );
        let mut router = BackendRouter::new(store(1));
        router.add_backend(slow.clone(), vec![]);
        router.add_tier(tier("fast", &["slow"], None));

        router.circuits().record_failure("slow");
        tokio::time::advance(Duration::from_secs(61)).await;

        let cancel = CancellationToken::new();
        let dropped = tokio::time::timeout(
            Duration::from_secs(1),
            router.route("fast", None, false, request(), &cancel),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(slow.calls(), 1);
        assert_eq!(
            router.circuits().status("slow"),
            crate::circuit::CircuitStatus::HalfOpen
        );

        let result = router.route("fast", None, false, request(), &cancel).await.unwrap();
        assert_eq!(result.output, json!("recovered"));
        assert_eq!(slow.calls(), 2);
        assert_eq!(
            router.circuits().status("slow"),
            crate::circuit::CircuitStatus::Closed
        );
    }
}
