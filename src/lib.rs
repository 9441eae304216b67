/// docflow: document approval workflow engine
///
/// Staged review and approval of business documents with role-based
/// assignment, delegation, timeout escalation and an audit trail.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// SQLite connection and schema
pub mod store;

// Workflow definitions: types, validation, storage and the hot-reload store
pub mod workflow;

// Workflow instances and their version-guarded persistence
pub mod instance;

// Engine, assignee resolution, action handlers, notifications and the sweeper
pub mod runtime;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

pub use error::{WorkflowError, WorkflowResult};
pub use instance::{InstanceStatus, WorkflowInstance};
pub use runtime::WorkflowEngine;
pub use server::start_server;
pub use workflow::{DefinitionStore, WorkflowDefinition};
