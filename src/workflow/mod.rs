//! Workflow definition layer
//!
//! - Type definitions (WorkflowDefinition, Stage, Transition, Condition)
//! - SQLite persistence with sqlx
//! - Structural validation with petgraph reachability checks
//! - Lock-free hot-reload definition store using ArcSwap
//! - Bundled templates seeded at startup

pub mod types;

pub mod storage;

pub mod validate;

pub mod registry;

pub mod seed;

pub use registry::DefinitionStore;
pub use types::{
    ActionType, AssigneeSpec, AssigneeType, Condition, ConditionOp, Stage, StageAction,
    StageType, TimeoutAction, Transition, WorkflowDefinition, WorkflowSettings,
};
