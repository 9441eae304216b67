/// HTTP API Layer
///
/// Thin JSON surface over the workflow engine:
/// - Definition administration under /api/definitions
/// - Instance lifecycle, task inbox and statistics under /api/workflows, /api/tasks
/// - Manual timeout sweep at /api/timeouts/process

pub mod definitions;
pub mod instances;

use crate::{
    error::WorkflowError,
    runtime::{engine::WorkflowEngine, sweeper::TimeoutSweeper},
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde_json::json;
use std::sync::Arc;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub sweeper: Arc<TimeoutSweeper>,
}

/// All API routes, ready for `.with_state`
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(definitions::create_definition_routes())
        .merge(instances::create_instance_routes())
}

impl WorkflowError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAssigned { .. } | Self::ActionNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::DefinitionNotFound(_) | Self::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. } | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidDefinition(_)
            | Self::NoStartStage(_)
            | Self::CommentRequired(_)
            | Self::MissingFields(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ActionFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
