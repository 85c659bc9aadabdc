pub mod builtin;
pub mod context;
pub mod executor;
pub mod graph;
pub mod invoker;
pub mod registry;
pub mod run_log;
pub mod service;
pub mod store;

pub use context::{ContextSnapshot, RunContext};
pub use executor::{DagExecutor, ExecutionOptions, RunHandle};
pub use graph::{compile, evaluate, DagDescription, ExecutionGraph, Expression};
pub use invoker::{InvokeOptions, RuntimeMode, StepInvoker, StepOutcome};
pub use registry::HandlerRegistry;
pub use run_log::RunLogger;
pub use service::{
    ExecutionProfile, LoadReport, RunDetail, RunRequest, RunSubmission, RunSummary,
    WorkflowInfo, WorkflowService,
};
pub use store::SqliteRunStore;
