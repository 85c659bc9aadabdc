use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object used for step inputs and run inputs.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step execution record. One exists for every declared step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Written once, on Success.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Present iff the step is Failed or Cancelled.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub backend_used: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl StepState {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            attempt_count: 0,
            start_time: None,
            end_time: None,
            output: None,
            error: None,
            backend_used: None,
            tokens_used: 0,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// A single execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub inputs: ValueMap,
    /// One entry per declared step, in declaration order.
    pub steps: Vec<StepState>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Run-level failure or cancellation reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl Run {
    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn failed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }

    /// Fraction of declared steps that ended Success (0.0 for an empty workflow).
    pub fn success_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let ok = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count();
        ok as f64 / self.steps.len() as f64
    }

    pub fn total_tokens(&self) -> u64 {
        self.steps.iter().map(|s| s.tokens_used).sum()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }
}

/// Execution event emitted by the DAG executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStart {
        workflow_name: String,
        step_count: usize,
    },
    StepStart {
        step: String,
    },
    StepEnd {
        step: String,
        status: StepStatus,
        duration_ms: u64,
        #[serde(default)]
        backend_used: Option<String>,
        #[serde(default)]
        tokens_used: u64,
        #[serde(default)]
        attempts: u32,
        #[serde(default)]
        error: Option<String>,
    },
    WorkflowEnd {
        status: RunStatus,
        duration_ms: u64,
    },
    Error {
        message: String,
    },
    Keepalive,
}

impl ExecutionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStart { .. } => "workflow_start",
            Self::StepStart { .. } => "step_start",
            Self::StepEnd { .. } => "step_end",
            Self::WorkflowEnd { .. } => "workflow_end",
            Self::Error { .. } => "error",
            Self::Keepalive => "keepalive",
        }
    }
}

/// Ordered envelope around an [`ExecutionEvent`].
///
/// `seq` increases by one per event within a run, so a stored or streamed log
/// can be replayed in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.event, ExecutionEvent::WorkflowEnd { .. })
    }
}

/// Payload handed to a model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub run_id: RunId,
    pub step: String,
    pub tier: String,
    #[serde(default)]
    pub capability: Option<String>,
    pub inputs: ValueMap,
}

/// Result of a successful backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub output: serde_json::Value,
    pub backend: String,
    #[serde(default)]
    pub tokens_used: u64,
}

/// Query filter for listing runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}
