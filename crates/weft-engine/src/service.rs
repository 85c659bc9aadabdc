//! Submission, query, and introspection facade over the executor.
//!
//! `WorkflowService` owns the compiled workflow catalog, the registered
//! evaluation hooks, and the set of active runs. The CLI and the gateway both
//! talk to the engine only through it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::config::AppConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{EvaluationHook, RunRecorder};
use weft_core::types::*;
use weft_core::workflow::WorkflowDefinition;
use weft_router::{build_router, BackendRouter, CircuitBreakerStore};

use crate::executor::{DagExecutor, ExecutionOptions, RunHandle};
use crate::graph::{compile, DagDescription, ExecutionGraph};
use crate::invoker::{RuntimeMode, StepInvoker};
use crate::registry::HandlerRegistry;
use crate::store::SqliteRunStore;

/// Per-run overrides of the configured execution limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionProfile {
    #[serde(default)]
    pub mode: RuntimeMode,
    /// Overrides every step's retry budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow: String,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub profile: ExecutionProfile,
    /// Name of a registered evaluation hook to call with the final run.
    #[serde(default)]
    pub evaluation_hook: Option<String>,
}

impl RunRequest {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            inputs: ValueMap::new(),
            profile: ExecutionProfile::default(),
            evaluation_hook: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSubmission {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub success_rate: f64,
    pub failed_count: usize,
    pub duration_ms: Option<u64>,
    pub total_tokens: u64,
}

impl From<Run> for RunDetail {
    fn from(run: Run) -> Self {
        Self {
            success_rate: run.success_rate(),
            failed_count: run.failed_count(),
            duration_ms: run.duration_ms(),
            total_tokens: run.total_tokens(),
            run,
        }
    }
}

/// Aggregate figures over stored runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub workflow: Option<String>,
    pub total: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Successful runs over finished runs.
    pub success_rate: f64,
    /// Mean duration of finished runs.
    pub mean_duration_ms: Option<f64>,
}

impl RunSummary {
    pub fn from_runs(workflow: Option<&str>, runs: &[Run]) -> Self {
        let mut summary = Self {
            workflow: workflow.map(str::to_string),
            total: runs.len(),
            ..Default::default()
        };
        let mut durations = Vec::new();
        for run in runs {
            match run.status {
                RunStatus::Pending | RunStatus::Running => summary.running += 1,
                RunStatus::Success => summary.success += 1,
                RunStatus::Failed => summary.failed += 1,
                RunStatus::Cancelled => summary.cancelled += 1,
            }
            if run.status.is_terminal() {
                if let Some(ms) = run.duration_ms() {
                    durations.push(ms as f64);
                }
            }
        }

        let finished = summary.success + summary.failed + summary.cancelled;
        if finished > 0 {
            summary.success_rate = summary.success as f64 / finished as f64;
        }
        if !durations.is_empty() {
            summary.mean_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub description: String,
    pub step_count: usize,
}

/// Outcome of loading a directory of definitions.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<(PathBuf, String)>,
}

pub struct WorkflowService {
    config: AppConfig,
    executor: DagExecutor,
    recorder: Arc<dyn RunRecorder>,
    event_bus: Arc<EventBus>,
    catalog: RwLock<HashMap<String, Arc<ExecutionGraph>>>,
    hooks: RwLock<HashMap<String, Arc<dyn EvaluationHook>>>,
    active: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl WorkflowService {
    pub fn new(
        config: AppConfig,
        router: Arc<BackendRouter>,
        handlers: Arc<HandlerRegistry>,
        recorder: Arc<dyn RunRecorder>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let invoker = Arc::new(StepInvoker::new(router, handlers));
        let executor =
            DagExecutor::new(invoker, Arc::clone(&event_bus)).with_recorder(Arc::clone(&recorder));
        Self {
            config,
            executor,
            recorder,
            event_bus,
            catalog: RwLock::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a service from configuration: router and circuits from the
    /// `[[tiers]]`/`[[backends]]` tables, built-in handlers, the SQLite store
    /// at `[store].path`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let circuits = Arc::new(CircuitBreakerStore::new(config.circuit.clone()));
        let router = Arc::new(build_router(&config, circuits)?);
        let store = Arc::new(SqliteRunStore::open(&config.store_path())?);
        Ok(Self::new(
            config,
            router,
            Arc::new(HandlerRegistry::with_builtins()),
            store,
            Arc::new(EventBus::default()),
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        self.executor.invoker().router()
    }

    // --- Catalog ---

    /// Compile and add a definition, replacing any workflow of the same name.
    pub async fn register(&self, def: WorkflowDefinition) -> Result<Arc<ExecutionGraph>> {
        let graph = Arc::new(compile(&def)?);
        let replaced = self
            .catalog
            .write()
            .await
            .insert(def.name.clone(), Arc::clone(&graph))
            .is_some();
        info!(workflow = %def.name, steps = graph.len(), replaced, "Workflow registered");
        Ok(graph)
    }

    /// Load every `.toml` and `.json` definition in `dir`. Files that fail to
    /// parse or compile are rejected and reported; the rest are registered.
    pub async fn load_dir(&self, dir: &Path) -> Result<LoadReport> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("toml") | Some("json")
                    )
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            let result = WorkflowDefinition::load(&path).and_then(|def| {
                if report.loaded.contains(&def.name) {
                    return Err(WeftError::Config(format!(
                        "workflow '{}' is defined more than once",
                        def.name
                    )));
                }
                Ok(def)
            });
            let def = match result {
                Ok(def) => def,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejected workflow definition");
                    report.rejected.push((path, e.to_string()));
                    continue;
                }
            };
            let name = def.name.clone();
            match self.register(def).await {
                Ok(_) => report.loaded.push(name),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejected workflow definition");
                    report.rejected.push((path, e.to_string()));
                }
            }
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            "Workflow directory loaded"
        );
        Ok(report)
    }

    pub async fn workflows(&self) -> Vec<WorkflowInfo> {
        let catalog = self.catalog.read().await;
        let mut list: Vec<WorkflowInfo> = catalog
            .values()
            .map(|g| WorkflowInfo {
                name: g.name().to_string(),
                description: g.definition().description.clone(),
                step_count: g.len(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn graph(&self, workflow: &str) -> Result<Arc<ExecutionGraph>> {
        self.catalog
            .read()
            .await
            .get(workflow)
            .cloned()
            .ok_or_else(|| WeftError::WorkflowNotFound(workflow.to_string()))
    }

    pub async fn describe(&self, workflow: &str) -> Result<DagDescription> {
        Ok(self.graph(workflow).await?.describe())
    }

    // --- Hooks ---

    pub async fn register_hook(&self, hook: Arc<dyn EvaluationHook>) {
        let name = hook.name().to_string();
        self.hooks.write().await.insert(name, hook);
    }

    // --- Runs ---

    fn options_for(&self, profile: &ExecutionProfile) -> ExecutionOptions {
        let mut options = ExecutionOptions::from_config(&self.config);
        options.invoke.mode = profile.mode;
        options.invoke.max_attempts_override = profile.max_attempts;
        if let Some(secs) = profile.max_duration_secs {
            options.max_duration = Some(Duration::from_secs(secs));
        }
        options
    }

    /// Start a run and keep its handle. Inputs are validated before anything
    /// is recorded.
    pub async fn start(&self, request: RunRequest) -> Result<RunHandle> {
        let graph = self.graph(&request.workflow).await?;
        let inputs = graph.definition().resolve_inputs(&request.inputs)?;
        let hook = match &request.evaluation_hook {
            Some(name) => Some(self.hooks.read().await.get(name).cloned().ok_or_else(|| {
                WeftError::InvalidInput(format!("unknown evaluation hook '{}'", name))
            })?),
            None => None,
        };
        let options = self.options_for(&request.profile);

        let run_id = RunId::new();
        let mut handle = self
            .executor
            .execute(graph, run_id.clone(), inputs, options)
            .await?;
        self.active
            .lock()
            .await
            .insert(run_id.clone(), handle.cancel_token());

        // Interpose on completion: drop the run from the active set and call
        // the hook before the handle's owner sees the final record.
        let (tx, rx) = oneshot::channel();
        let done = std::mem::replace(&mut handle.done, rx);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let run = done.await;
            active.lock().await.remove(&run_id);
            let Ok(run) = run else {
                return;
            };
            if let Some(hook) = hook {
                if let Err(e) = hook.evaluate(run.clone()).await {
                    warn!(run_id = %run.run_id, hook = %hook.name(), error = %e, "Evaluation hook failed");
                }
            }
            let _ = tx.send(run);
        });

        Ok(handle)
    }

    /// Start a run and return immediately. Progress is observable through the
    /// event bus and the run store.
    pub async fn submit(&self, request: RunRequest) -> Result<RunSubmission> {
        let workflow = request.workflow.clone();
        let handle = self.start(request).await?;
        let run_id = handle.run_id().clone();
        info!(run_id = %run_id, workflow = %workflow, "Run submitted");
        Ok(RunSubmission {
            run_id,
            status: RunStatus::Running,
        })
    }

    /// Request cancellation. `Ok(false)` means the run exists but has already
    /// finished.
    pub async fn cancel(&self, run_id: &RunId) -> Result<bool> {
        if let Some(token) = self.active.lock().await.get(run_id) {
            token.cancel();
            info!(run_id = %run_id, "Run cancellation requested");
            return Ok(true);
        }
        match self.recorder.load_run(run_id.clone()).await? {
            Some(_) => Ok(false),
            None => Err(WeftError::RunNotFound(run_id.to_string())),
        }
    }

    pub async fn is_active(&self, run_id: &RunId) -> bool {
        self.active.lock().await.contains_key(run_id)
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        self.recorder.list_runs(filter).await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<RunDetail> {
        self.recorder
            .load_run(run_id.clone())
            .await?
            .map(RunDetail::from)
            .ok_or_else(|| WeftError::RunNotFound(run_id.to_string()))
    }

    pub async fn summary(&self, workflow: Option<&str>) -> Result<RunSummary> {
        let runs = self
            .recorder
            .list_runs(RunFilter {
                workflow: workflow.map(str::to_string),
                ..Default::default()
            })
            .await?;
        Ok(RunSummary::from_runs(workflow, &runs))
    }

    /// Stored events of a run, in `seq` order.
    pub async fn run_events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        if self.recorder.load_run(run_id.clone()).await?.is_none() {
            return Err(WeftError::RunNotFound(run_id.to_string()));
        }
        self.recorder.load_events(run_id.clone()).await
    }
}
