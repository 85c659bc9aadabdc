use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_core::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker whether a backend may be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial call of a half-open circuit.
    Trial,
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Point-in-time view of one backend's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub backend: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
    pub window_failures: usize,
    pub window_calls: usize,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    cooldown: Duration,
    /// Recent outcomes, `true` for success. Bounded by `window_size`.
    window: VecDeque<bool>,
    trial_in_flight: bool,
}

impl CircuitState {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            cooldown_until: None,
            cooldown: base_cooldown,
            window: VecDeque::new(),
            trial_in_flight: false,
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }
}

/// Per-backend circuit breakers shared by every run in the process.
///
/// State is kept behind a plain mutex; no method holds the lock across an await.
pub struct CircuitBreakerStore {
    config: CircuitConfig,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreakerStore {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    fn with_state<R>(&self, backend: &str, f: impl FnOnce(&mut CircuitState) -> R) -> R {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let base = self.base_cooldown();
        let state = states
            .entry(backend.to_string())
            .or_insert_with(|| CircuitState::new(base));
        f(state)
    }

    /// Decide whether `backend` may be called now. An Open circuit whose
    /// cooldown has elapsed moves to HalfOpen and admits exactly one trial.
    pub fn admit(&self, backend: &str) -> Admission {
        let now = Instant::now();
        self.with_state(backend, |state| match state.status {
            CircuitStatus::Closed => Admission::Allowed,
            CircuitStatus::Open => {
                if state.cooldown_until.is_some_and(|until| now >= until) {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    info!(backend, "Circuit half-open, admitting trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    Admission::Rejected
                } else {
                    state.trial_in_flight = true;
                    Admission::Trial
                }
            }
        })
    }

    /// Admit a call and tie its outcome to the returned permit. A permit
    /// dropped without an outcome hands a half-open trial back.
    pub fn try_admit(&self, backend: &str) -> Option<CircuitPermit<'_>> {
        let admission = self.admit(backend);
        admission.is_admitted().then(|| CircuitPermit {
            store: self,
            backend: backend.to_string(),
            admission,
            settled: false,
        })
    }

    pub fn record_success(&self, backend: &str) {
        let base = self.base_cooldown();
        let window_size = self.config.window_size;
        self.with_state(backend, |state| {
            // Late result of a call admitted before the circuit opened;
            // only a trial may close an open circuit.
            if state.status == CircuitStatus::Open {
                push_outcome(&mut state.window, window_size, true);
                return;
            }
            if state.status == CircuitStatus::HalfOpen {
                info!(backend, "Circuit closed after successful trial");
                state.window.clear();
            }
            state.status = CircuitStatus::Closed;
            state.consecutive_failures = 0;
            state.cooldown_until = None;
            state.cooldown = base;
            state.trial_in_flight = false;
            push_outcome(&mut state.window, window_size, true);
        });
    }

    pub fn record_failure(&self, backend: &str) {
        let now = Instant::now();
        let config = &self.config;
        let max_cooldown = Duration::from_millis(config.max_cooldown_ms);
        self.with_state(backend, |state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            push_outcome(&mut state.window, config.window_size, false);

            match state.status {
                CircuitStatus::HalfOpen => {
                    state.cooldown = (state.cooldown * 2).min(max_cooldown);
                    state.status = CircuitStatus::Open;
                    state.cooldown_until = Some(now + state.cooldown);
                    state.trial_in_flight = false;
                    warn!(
                        backend,
                        cooldown_ms = state.cooldown.as_millis() as u64,
                        "Trial call failed, circuit re-opened"
                    );
                }
                CircuitStatus::Closed => {
                    let by_count = config.failure_threshold > 0
                        && state.consecutive_failures >= config.failure_threshold;
                    let calls = state.window.len();
                    let by_rate = config.failure_rate_threshold > 0.0
                        && calls > 0
                        && calls >= config.min_calls
                        && state.window_failures() as f64 / calls as f64
                            >= config.failure_rate_threshold;
                    if by_count || by_rate {
                        state.status = CircuitStatus::Open;
                        state.cooldown_until = Some(now + state.cooldown);
                        warn!(
                            backend,
                            consecutive_failures = state.consecutive_failures,
                            window_failures = state.window_failures(),
                            cooldown_ms = state.cooldown.as_millis() as u64,
                            "Circuit opened"
                        );
                    }
                }
                // Late result of a call admitted before the circuit opened.
                CircuitStatus::Open => {}
            }
        });
    }

    /// Give back an admitted call that ended without an outcome (cancelled).
    /// A half-open circuit becomes eligible for a new trial.
    pub fn release(&self, backend: &str) {
        self.with_state(backend, |state| {
            state.trial_in_flight = false;
        });
    }

    pub fn status(&self, backend: &str) -> CircuitStatus {
        self.with_state(backend, |state| state.status)
    }

    pub fn snapshot(&self, backend: &str) -> CircuitSnapshot {
        let now = Instant::now();
        self.with_state(backend, |state| snapshot_of(backend, state, now))
    }

    /// Snapshots of every backend seen so far, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = states
            .iter()
            .map(|(name, state)| snapshot_of(name, state, now))
            .collect();
        out.sort_by(|a, b| a.backend.cmp(&b.backend));
        out
    }
}

/// One admitted backend call.
pub struct CircuitPermit<'a> {
    store: &'a CircuitBreakerStore,
    backend: String,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.store.record_success(&self.backend);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.store.record_failure(&self.backend);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            debug!(backend = %self.backend, "Trial call ended without an outcome, releasing");
            self.store.release(&self.backend);
        }
    }
}

fn push_outcome(window: &mut VecDeque<bool>, window_size: usize, ok: bool) {
    if window_size == 0 {
        return;
    }
    window.push_back(ok);
    while window.len() > window_size {
        window.pop_front();
    }
}

fn snapshot_of(backend: &str, state: &CircuitState, now: Instant) -> CircuitSnapshot {
    CircuitSnapshot {
        backend: backend.to_string(),
        status: state.status,
        consecutive_failures: state.consecutive_failures,
        cooldown_remaining_ms: state
            .cooldown_until
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0),
        window_failures: state.window_failures(),
        window_calls: state.window.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            failure_rate_threshold: 0.0,
            window_size: 10,
            min_calls: 5,
            cooldown_ms: 1000,
            max_cooldown_ms: 3000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..2 {
            assert_eq!(store.admit("a"), Admission::Allowed);
            store.record_failure("a");
        }
        assert_eq!(store.status("a"), CircuitStatus::Closed);
        store.record_failure("a");
        assert_eq!(store.status("a"), CircuitStatus::Open);
        assert_eq!(store.admit("a"), Admission::Rejected);
        assert_eq!(store.snapshot("a").cooldown_remaining_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let store = CircuitBreakerStore::new(config());
        store.record_failure("a");
        store.record_failure("a");
        store.record_success("a");
        store.record_failure("a");
        assert_eq!(store.status("a"), CircuitStatus::Closed);
        assert_eq!(store.snapshot("a").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }
        tokio::time::advance(Duration::from_millis(1001)).await;

        assert_eq!(store.admit("a"), Admission::Trial);
        assert_eq!(store.status("a"), CircuitStatus::HalfOpen);
        assert_eq!(store.admit("a"), Admission::Rejected);

        store.record_success("a");
        assert_eq!(store.status("a"), CircuitStatus::Closed);
        assert_eq!(store.admit("a"), Admission::Allowed);
        assert_eq!(store.snapshot("a").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_doubles_cooldown_up_to_cap() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(store.admit("a"), Admission::Trial);
        store.record_failure("a");
        assert_eq!(store.status("a"), CircuitStatus::Open);
        assert_eq!(store.snapshot("a").cooldown_remaining_ms, 2000);

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(store.admit("a"), Admission::Trial);
        store.record_failure("a");
        assert_eq!(store.snapshot("a").cooldown_remaining_ms, 3000);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.admit("a"), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_can_be_retried() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(store.admit("a"), Admission::Trial);
        store.release("a");
        assert_eq!(store.status("a"), CircuitStatus::HalfOpen);
        assert_eq!(store.admit("a"), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_is_released() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }
        tokio::time::advance(Duration::from_millis(1000)).await;

        let permit = store.try_admit("a").unwrap();
        assert_eq!(permit.admission(), Admission::Trial);
        assert!(store.try_admit("a").is_none());
        drop(permit);

        assert_eq!(store.status("a"), CircuitStatus::HalfOpen);
        let permit = store.try_admit("a").unwrap();
        assert_eq!(permit.admission(), Admission::Trial);
        permit.success();
        assert_eq!(store.status("a"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_permit_is_not_released() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }
        tokio::time::advance(Duration::from_millis(1000)).await;

        store.try_admit("a").unwrap().failure();
        assert_eq!(store.status("a"), CircuitStatus::Open);
        assert!(store.try_admit("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_circuit() {
        let store = CircuitBreakerStore::new(config());
        // Admitted while closed, finishes after others opened the circuit.
        let slow = store.try_admit("a").unwrap();
        assert_eq!(slow.admission(), Admission::Allowed);
        for _ in 0..3 {
            store.record_failure("a");
        }
        slow.success();

        assert_eq!(store.status("a"), CircuitStatus::Open);
        assert_eq!(store.snapshot("a").cooldown_remaining_ms, 1000);
        assert_eq!(store.admit("a"), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_failure_rate() {
        let store = CircuitBreakerStore::new(CircuitConfig {
            failure_threshold: 0,
            failure_rate_threshold: 0.5,
            window_size: 4,
            min_calls: 4,
            ..config()
        });
        store.record_success("a");
        store.record_failure("a");
        store.record_success("a");
        assert_eq!(store.status("a"), CircuitStatus::Closed);
        store.record_failure("a");
        assert_eq!(store.status("a"), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backends_are_isolated() {
        let store = CircuitBreakerStore::new(config());
        for _ in 0..3 {
            store.record_failure("a");
        }
        assert_eq!(store.admit("a"), Admission::Rejected);
        assert_eq!(store.admit("b"), Admission::Allowed);
        let names: Vec<_> = store.snapshots().into_iter().map(|s| s.backend).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
