use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use weft_core::error::{Result, WeftError};
use weft_core::traits::StepHandler;
use weft_core::types::ValueMap;

/// Registry of deterministic step handlers, keyed by handler id.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any handler with the same id.
    pub fn register(&mut self, handler: impl StepHandler) {
        let id = handler.id().to_string();
        self.handlers.insert(id, Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.id().to_string(), handler);
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.handlers.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Run a handler by id.
    pub async fn run(
        &self,
        id: &str,
        inputs: ValueMap,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let handler = self
            .get(id)
            .ok_or_else(|| WeftError::HandlerNotFound(id.to_string()))?;
        handler.run(inputs, cancel).await
    }

    /// Create a registry with the built-in handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::Passthrough);
        registry.register(crate::builtin::Select);
        registry.register(crate::builtin::Fail);
        registry.register(crate::builtin::Sleep);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
