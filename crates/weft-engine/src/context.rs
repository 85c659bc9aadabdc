use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::types::ValueMap;

/// Mutable run context owned by the dispatcher: run inputs plus the output of
/// every step that has succeeded so far.
///
/// Each step output is written exactly once. Readers never see this type;
/// they receive a [`ContextSnapshot`].
#[derive(Debug, Default)]
pub struct RunContext {
    inputs: Arc<ValueMap>,
    outputs: Arc<HashMap<String, Value>>,
}

impl RunContext {
    pub fn new(inputs: ValueMap) -> Self {
        Self {
            inputs: Arc::new(inputs),
            outputs: Arc::new(HashMap::new()),
        }
    }

    /// Record a step's output. Fails if the step already has one.
    pub fn insert(&mut self, step: &str, output: Value) -> Result<()> {
        if self.outputs.contains_key(step) {
            return Err(WeftError::OutputAlreadyWritten(step.to_string()));
        }
        // Clones the map only while snapshots still share it.
        Arc::make_mut(&mut self.outputs).insert(step.to_string(), output);
        Ok(())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            inputs: Arc::clone(&self.inputs),
            outputs: Arc::clone(&self.outputs),
        }
    }
}

/// Immutable, cheaply cloneable view of a run context at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    inputs: Arc<ValueMap>,
    outputs: Arc<HashMap<String, Value>>,
}

impl ContextSnapshot {
    pub fn new(inputs: ValueMap, outputs: HashMap<String, Value>) -> Self {
        Self {
            inputs: Arc::new(inputs),
            outputs: Arc::new(outputs),
        }
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    pub fn inputs(&self) -> &ValueMap {
        &self.inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_writer_per_step() {
        let mut ctx = RunContext::default();
        ctx.insert("a", json!(1)).unwrap();
        let err = ctx.insert("a", json!(2)).unwrap_err();
        assert!(matches!(err, WeftError::OutputAlreadyWritten(s) if s == "a"));
        assert_eq!(ctx.snapshot().output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let mut inputs = ValueMap::new();
        inputs.insert("topic".into(), json!("rust"));
        let mut ctx = RunContext::new(inputs);

        let before = ctx.snapshot();
        ctx.insert("a", json!("out")).unwrap();
        let after = ctx.snapshot();

        assert!(before.output("a").is_none());
        assert_eq!(after.output("a"), Some(&json!("out")));
        assert_eq!(before.input("topic"), Some(&json!("rust")));
    }
}
