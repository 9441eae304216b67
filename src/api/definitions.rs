/// Workflow definition REST API endpoints
///
/// Creating or updating a definition publishes it to the in-memory store
/// immediately; instances already running keep resolving by definition id.

use super::AppState;
use crate::{
    error::WorkflowError,
    workflow::{storage::DefinitionMetadata, types::WorkflowDefinition},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};

pub fn create_definition_routes() -> Router<AppState> {
    Router::new()
        .route("/api/definitions", get(list_definitions).post(create_definition))
        .route("/api/definitions/{id}", get(get_definition).put(update_definition))
        .route("/api/definitions/{id}/activate", post(activate_definition))
        .route("/api/definitions/{id}/deactivate", post(deactivate_definition))
}

/// GET /api/definitions
async fn list_definitions(
    State(state): State<AppState>,
) -> Result<Json<Vec<DefinitionMetadata>>, WorkflowError> {
    Ok(Json(state.engine.definitions().list().await?))
}

/// POST /api/definitions
/// Body: a workflow definition; `id` is assigned when omitted
async fn create_definition(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), WorkflowError> {
    let created = state.engine.definitions().create(definition).await?;
    Ok((StatusCode::CREATED, Json(created.as_ref().clone())))
}

/// GET /api/definitions/{id}
async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, WorkflowError> {
    let definition = state.engine.definitions().get(&id)?;
    Ok(Json(definition.as_ref().clone()))
}

/// PUT /api/definitions/{id}
async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowDefinition>, WorkflowError> {
    let updated = state.engine.definitions().update(&id, definition).await?;
    Ok(Json(updated.as_ref().clone()))
}

async fn activate_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, WorkflowError> {
    let definition = state.engine.definitions().set_active(&id, true).await?;
    Ok(Json(definition.as_ref().clone()))
}

/// Deactivated definitions stop accepting new instances
async fn deactivate_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, WorkflowError> {
    let definition = state.engine.definitions().set_active(&id, false).await?;
    Ok(Json(definition.as_ref().clone()))
}
