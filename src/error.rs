//! Error taxonomy for the workflow engine
//!
//! Validation and authorization failures are returned synchronously to the
//! caller of the operation that triggered them; none are retried internally
//! except `Conflict`, which the engine retries before surfacing.

use crate::instance::types::InstanceStatus;
use thiserror::Error;

/// Result alias used across the engine, stores and registry
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow definition '{0}' has no start stage")]
    NoStartStage(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("workflow instance {instance_id} is {status}, expected {expected}")]
    InvalidState {
        instance_id: String,
        status: InstanceStatus,
        expected: InstanceStatus,
    },

    #[error("user '{user_id}' holds no pending task on instance {instance_id}")]
    NotAssigned { instance_id: String, user_id: String },

    #[error("action '{action}' is not allowed on stage '{stage}'")]
    ActionNotAllowed { stage: String, action: String },

    #[error("a comment is required to reject on stage '{0}'")]
    CommentRequired(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("action handler '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    /// Optimistic-concurrency guard rejected the write; the row moved on
    #[error("concurrent modification of workflow instance {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DefinitionNotFound(_) => "definition_not_found",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::NoStartStage(_) => "no_start_stage",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotAssigned { .. } => "not_assigned",
            Self::ActionNotAllowed { .. } => "action_not_allowed",
            Self::CommentRequired(_) => "comment_required",
            Self::MissingFields(_) => "missing_fields",
            Self::ActionFailed { .. } => "action_failed",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }
}
