use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::ValueMap;

/// Declarative workflow: named inputs plus a list of steps with dependencies.
///
/// Immutable once loaded; a new version of a workflow is a new definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl InputType {
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A named workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: InputType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub allowed: Option<Vec<serde_json::Value>>,
}

/// Which piece of work a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerRef {
    /// Routed to a backend of the given tier.
    Model {
        tier: String,
        #[serde(default)]
        capability: Option<String>,
        /// Try the tier's `escalate_to` tier when every backend is exhausted.
        #[serde(default)]
        escalate: bool,
    },
    /// Handled in-process by a registered handler.
    Deterministic { id: String },
}

/// An input binding: an expression, an expression with a fallback, or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    Expr(String),
    WithDefault {
        expr: String,
        default: serde_json::Value,
    },
    Literal(serde_json::Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Engine default when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

/// What a step does when one of its dependencies did not succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The step is skipped (and so are its own dependents).
    #[default]
    PropagateSkip,
    /// The step runs anyway once all dependencies are terminal.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub handler: HandlerRef,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub input_bindings: BTreeMap<String, Binding>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, handler: HandlerRef) -> Self {
        Self {
            name: name.into(),
            handler,
            depends_on: vec![],
            input_bindings: BTreeMap::new(),
            retry: RetryPolicy::default(),
            on_failure: FailurePolicy::default(),
            timeout_secs: None,
        }
    }

    pub fn model(name: impl Into<String>, tier: impl Into<String>) -> Self {
        Self::new(
            name,
            HandlerRef::Model {
                tier: tier.into(),
                capability: None,
                escalate: false,
            },
        )
    }

    pub fn deterministic(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(name, HandlerRef::Deterministic { id: id.into() })
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn bind(mut self, key: impl Into<String>, expr: impl Into<String>) -> Self {
        self.input_bindings
            .insert(key.into(), Binding::Expr(expr.into()));
        self
    }

    pub fn bind_or(
        mut self,
        key: impl Into<String>,
        expr: impl Into<String>,
        default: serde_json::Value,
    ) -> Self {
        self.input_bindings.insert(
            key.into(),
            Binding::WithDefault {
                expr: expr.into(),
                default,
            },
        );
        self
    }

    pub fn bind_literal(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input_bindings.insert(key.into(), Binding::Literal(value));
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff_ms: u64) -> Self {
        self.retry.backoff_ms = Some(backoff_ms);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = FailurePolicy::Continue;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: vec![],
            steps: vec![],
        }
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| WeftError::Config(format!("{}: {}", path.display(), e)))
        } else {
            Self::from_toml_str(&content)
                .map_err(|e| WeftError::Config(format!("{}: {}", path.display(), e)))
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::Config(e.to_string()))
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate submitted input values against the declared input schema.
    ///
    /// Applies defaults, enforces `required`, type, and `enum` constraints, and
    /// rejects values for inputs that are not declared.
    pub fn resolve_inputs(&self, provided: &ValueMap) -> Result<ValueMap> {
        if let Some(unknown) = provided
            .keys()
            .find(|k| !self.inputs.iter().any(|i| &i.name == *k))
        {
            return Err(WeftError::InvalidInput(format!(
                "workflow '{}' has no input named '{}'",
                self.name, unknown
            )));
        }

        let mut resolved = ValueMap::new();
        for spec in &self.inputs {
            let value = match provided.get(&spec.name).or(spec.default.as_ref()) {
                Some(v) => v.clone(),
                None if spec.required => {
                    return Err(WeftError::InvalidInput(format!(
                        "missing required input '{}'",
                        spec.name
                    )));
                }
                None => continue,
            };

            if !spec.kind.accepts(&value) {
                return Err(WeftError::InvalidInput(format!(
                    "input '{}' expects {:?}, got {}",
                    spec.name, spec.kind, value
                )));
            }

            if let Some(allowed) = &spec.allowed {
                if !allowed.contains(&value) {
                    return Err(WeftError::InvalidInput(format!(
                        "input '{}' must be one of {}",
                        spec.name,
                        serde_json::Value::Array(allowed.clone())
                    )));
                }
            }

            resolved.insert(spec.name.clone(), value);
        }
        Ok(resolved)
    }
}

impl InputSpec {
    pub fn new(name: impl Into<String>, kind: InputType) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            default: None,
            required: false,
            allowed: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn one_of(mut self, values: Vec<serde_json::Value>) -> Self {
        self.allowed = Some(values);
        self
    }
}
