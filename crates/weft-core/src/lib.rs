pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{BackendError, CompileError, EvalError, Result, RoutingError, WeftError};
pub use event::EventBus;
pub use types::*;
pub use workflow::{
    Binding, FailurePolicy, HandlerRef, InputSpec, InputType, RetryPolicy, StepDefinition,
    WorkflowDefinition,
};
