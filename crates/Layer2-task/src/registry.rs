//! Handler Registry - task type to handler mapping
//!
//! Built once at startup through [`RegistryBuilder`], then frozen into an
//! immutable [`HandlerRegistry`] shared by `Arc`. Lookups take no locks.

use crate::log::TaskLogger;
use crate::task::{TaskId, TaskKind};
use async_trait::async_trait;
use harbor_foundation::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-run context handed to a handler
#[derive(Clone)]
pub struct HandlerContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub log: TaskLogger,
}

/// A unit of work for one task kind
///
/// Receives the stored params, returns a JSON result or a descriptive error.
/// Handlers own their deadlines; the engine never preempts them.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: HandlerContext, params: Value) -> Result<Value>;
}

/// Adapter so plain async closures can be registered
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: HandlerContext, params: Value) -> Result<Value> {
        (self.f)(ctx, params).await
    }
}

/// Mutable builder, consumed by [`RegistryBuilder::build`]
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a kind
    pub fn register(mut self, kind: TaskKind, handler: impl TaskHandler + 'static) -> Self {
        if self.handlers.insert(kind, Arc::new(handler)).is_some() {
            warn!(task_type = kind.as_str(), "Replacing previously registered handler");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        info!(handlers = self.handlers.len(), "Handler registry built");
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable lookup table
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve a wire task type (`UnregisteredTaskType` on miss)
    pub fn resolve(&self, task_type: &str) -> Result<(TaskKind, Arc<dyn TaskHandler>)> {
        let kind: TaskKind = task_type.parse()?;
        self.handlers
            .get(&kind)
            .map(|h| (kind, Arc::clone(h)))
            .ok_or_else(|| Error::UnregisteredTaskType(task_type.to_string()))
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Kinds with no handler
    pub fn missing(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .iter()
            .copied()
            .filter(|k| !self.contains(*k))
            .collect()
    }

    /// Startup check: every known kind has a handler
    pub fn ensure_complete(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
        Err(Error::Config(format!(
            "No handler registered for: {}",
            names.join(", ")
        )))
    }
}
