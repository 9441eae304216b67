//! Workflow instance layer
//!
//! The instance aggregate (history, pending tasks, variables) and its
//! version-guarded SQLite persistence.

pub mod types;

pub mod storage;

pub use storage::{InstanceStorage, StatisticsQuery, TaskQuery, TaskSummary, WorkflowStatistics};
pub use types::{
    DocumentRef, HistoryEntry, InstanceStatus, PendingTask, Priority, TaskStatus,
    WorkflowInstance, SYSTEM_PRINCIPAL,
};
