//! JSON task API and health endpoint.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use super::AppState;
use crate::dispatcher::DispatchRequest;
use crate::error::Error;
use crate::event::StartGeneration;
use crate::model::{ProjectId, Task, TaskId};

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(what) => ApiError::NotFound(what),
            Error::InvalidProjectId(id) => ApiError::NotFound(format!("project {id}")),
            Error::InvalidParameters(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "message": format!("{what} not found") })),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "bad_request", "message": message })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!("request failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal" })),
                )
                    .into_response()
            }
        }
    }
}

/// Parse and check a project id from the path.
pub(crate) async fn known_project(state: &AppState, raw: String) -> Result<ProjectId, ApiError> {
    let project_id = ProjectId::new(raw)?;
    if !state.projects().exists(&project_id).await? {
        return Err(ApiError::NotFound(format!("project {project_id}")));
    }
    Ok(project_id)
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("task {raw}")))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub connections: usize,
    pub subscriptions: usize,
    pub active_tasks: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: if state.relay().is_degraded() {
            "degraded"
        } else {
            "ok"
        },
        connections: state.registry().connection_count(),
        subscriptions: state.relay().subscription_count(),
        active_tasks: state.dispatcher().active_count(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: TaskId,
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StartGeneration>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let project_id = known_project(&state, project_id).await?;
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let task_id = state
        .dispatcher()
        .dispatch(DispatchRequest {
            project_id,
            node_id: body.node_id,
            quality_tier: body.quality_tier,
            parameters: body.parameters,
            correlation_id,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let project_id = known_project(&state, project_id).await?;
    Ok(Json(state.dispatcher().list(&project_id)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.dispatcher().get_status(&task_id)?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let cancelled = state.dispatcher().cancel(&task_id).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}
