//! Handler registry: the explicit mapping from task-type name to executor.
//!
//! The registry is populated by an initialization routine before the
//! processor loop starts; handlers cannot appear or disappear while the
//! loop is running. Registration order is irrelevant because type names are
//! unique keys.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error surfaced by a task handler. Its text becomes the failed task's
/// recorded error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Executes one category of background task.
///
/// Handlers must be safe to invoke concurrently with other handlers: the
/// processor runs a whole batch of tasks at once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task. The returned value is persisted as the task's result;
    /// an error (or the processor's timeout) fails the task terminally.
    async fn run(&self, params: Value) -> Result<Value, HandlerError>;
}

/// Maps task-type names to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for `task_type`.
    ///
    /// Keys are unique; registering the same name twice replaces the
    /// earlier handler and logs a warning, since that almost always means
    /// two initialization paths disagree.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            tracing::warn!(task_type, "replaced an already-registered task handler");
        }
    }

    /// Looks up the handler for `task_type`.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered type names, sorted for stable log output.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
