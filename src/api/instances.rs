/// Workflow instance REST API endpoints
///
/// Each handler is a direct call into the engine; error kinds map to HTTP
/// statuses through `WorkflowError`'s `IntoResponse`.

use super::AppState;
use crate::{
    error::WorkflowError,
    instance::{
        storage::{StatisticsQuery, TaskQuery, TaskSummary, WorkflowStatistics},
        types::WorkflowInstance,
    },
    runtime::{
        engine::{ActionOptions, CancelOptions, DelegateOptions, StartOptions},
        sweeper::SweepReport,
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub definition_name: String,
    pub document_id: String,
    #[serde(flatten)]
    pub options: StartOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    pub to_user_id: String,
    #[serde(flatten)]
    pub options: DelegateOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRequest {
    pub user_id: String,
}

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(start_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/actions/{action}", post(perform_action))
        .route("/api/workflows/{id}/delegate", post(delegate_task))
        .route("/api/workflows/{id}/cancel", post(cancel_workflow))
        .route("/api/workflows/{id}/pause", post(pause_workflow))
        .route("/api/workflows/{id}/resume", post(resume_workflow))
        .route("/api/documents/{document_id}/workflows", get(document_workflows))
        .route("/api/tasks/{user_id}", get(pending_tasks))
        .route("/api/statistics", get(statistics))
        .route("/api/timeouts/process", post(process_timeouts))
}

/// POST /api/workflows
/// Body: { "definitionName": "...", "documentId": "...", "userId": "...", ... }
async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<WorkflowInstance>), WorkflowError> {
    let instance = state
        .engine
        .start(&request.definition_name, &request.document_id, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(state.engine.get_instance(&id).await?))
}

/// POST /api/workflows/{id}/actions/{action}
/// Body: { "userId": "...", "comment": "...", "variables": { ... } }
async fn perform_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    Json(options): Json<ActionOptions>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(state.engine.perform_action(&id, &action, options).await?))
}

async fn delegate_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(
        state
            .engine
            .delegate_task(&id, &request.to_user_id, request.options)
            .await?,
    ))
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<CancelOptions>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(state.engine.cancel_workflow(&id, options).await?))
}

async fn pause_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(state.engine.pause_workflow(&id, &request.user_id).await?))
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<WorkflowInstance>, WorkflowError> {
    Ok(Json(state.engine.resume_workflow(&id, &request.user_id).await?))
}

/// GET /api/documents/{document_id}/workflows, newest first
async fn document_workflows(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<Vec<WorkflowInstance>>, WorkflowError> {
    Ok(Json(state.engine.get_document_workflows(&document_id).await?))
}

/// GET /api/tasks/{user_id}?definitionName=...&limit=...
async fn pending_tasks(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<TaskSummary>>, WorkflowError> {
    Ok(Json(state.engine.get_pending_tasks(&user_id, &query).await?))
}

async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<WorkflowStatistics>, WorkflowError> {
    Ok(Json(state.engine.get_statistics(&query).await?))
}

/// POST /api/timeouts/process: run one sweep now
async fn process_timeouts(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, (StatusCode, Json<Value>)> {
    state.sweeper.process_timeouts().await.map(Json).map_err(|e| {
        tracing::error!("❌ Manual timeout sweep failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "sweep_failed", "message": e.to_string() })),
        )
    })
}
