use thiserror::Error;

/// Rejection of a workflow definition at load time. A definition that fails
/// any of these checks is never partially compiled.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Step '{step}' binding '{binding}' is not a valid expression: {reason}")]
    InvalidExpression {
        step: String,
        binding: String,
        reason: String,
    },

    #[error("Step '{step}' reads the output of '{reference}' without depending on it")]
    UndeclaredReference { step: String, reference: String },

    #[error("Cycle detected involving steps: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

impl CompileError {
    /// Step names this error is about, for reporting.
    pub fn steps(&self) -> Vec<&str> {
        match self {
            Self::DuplicateStep(s) | Self::SelfDependency(s) => vec![s.as_str()],
            Self::UnknownDependency { step, .. }
            | Self::InvalidExpression { step, .. }
            | Self::UndeclaredReference { step, .. } => vec![step.as_str()],
            Self::Cycle(names) => names.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// Failure to resolve an input expression against a run context.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

/// Failure of a single backend call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("Backend timed out after {0}ms")]
    Timeout(u64),

    #[error("Backend rate limited: {0}")]
    RateLimited(String),

    #[error("Backend server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Backend authentication failed: {0}")]
    Auth(String),

    #[error("Backend request failed: {0}")]
    Request(String),

    #[error("Backend call cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether this failure counts against the backend's circuit.
    pub fn counts_against_circuit(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Failure to place a model-backed call on any backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    #[error("All backends exhausted for tier '{tier}' (attempted: {})", .attempted.join(", "))]
    Exhausted { tier: String, attempted: Vec<String> },

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Routing cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum WeftError {
    // Definition errors
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Execution errors
    #[error("Expression error: {0}")]
    Eval(#[from] EvalError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Output for step '{0}' already written")]
    OutputAlreadyWritten(String),

    // Recorder errors (fatal for the run)
    #[error("Run recorder unavailable: {0}")]
    Recorder(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;
