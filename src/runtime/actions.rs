//! Action side-effect handlers
//!
//! The registry maps an action name to a handler that runs after the
//! caller has been authorized and before the instance is advanced. A
//! handler error aborts the action; an unregistered action is a no-op.

use crate::instance::types::WorkflowInstance;
use crate::workflow::types::{Stage, StageAction};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};

/// Everything a handler may look at; the instance is the pre-action view
pub struct ActionContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub stage: &'a Stage,
    pub action: &'a StageAction,
    pub performed_by: &'a str,
    pub comment: Option<&'a str>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the side effect; the returned value lands in the history entry's metadata
    async fn handle(&self, ctx: &ActionContext<'_>) -> Result<Value>;
}

/// Reports the action taken without side effects
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl ActionHandler for EchoHandler {
    async fn handle(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        Ok(json!({
            "action": ctx.action.name,
            "stage": ctx.stage.name,
            "performedBy": ctx.performed_by,
        }))
    }
}

#[derive(Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ActionRegistry {
    /// A registry with no handlers at all
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Pre-seeded with echo handlers for approve, reject, delegate and comment
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for name in ["approve", "reject", "delegate", "comment"] {
            registry.register(name, Arc::new(EchoHandler));
        }
        registry
    }

    /// Add or replace the handler for `name`
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        tracing::debug!("Registered action handler: {}", name);
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler registered under exactly `name`, if any
    pub async fn invoke(&self, name: &str, ctx: &ActionContext<'_>) -> Result<Option<Value>> {
        match self.handlers.get(name) {
            Some(handler) => handler.handle(ctx).await.map(Some),
            None => {
                tracing::debug!("No handler registered for action '{}'", name);
                Ok(None)
            }
        }
    }
}
