use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::error;

use crate::dispatch::Dispatcher;
use crate::errors::DispatchError;
use crate::gateway::BroadcastGroups;
use crate::logs::store::LogStore;
use crate::registry::slug::validate_slug;
use crate::registry::{NewProject, Registry, SlugTaken};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Registry,
    pub dispatcher: Dispatcher,
    pub log_store: Arc<dyn LogStore>,
    pub groups: Arc<BroadcastGroups>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: Option<String>,
    #[serde(alias = "gitURL", alias = "gitUrl")]
    pub source_locator: Option<String>,
    pub slug: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub project_id: Option<String>,
    pub source_locator: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Launch { deployment_id: String, message: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({"error": msg})),
            ApiError::Launch {
                deployment_id,
                message,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": message, "deploymentId": deployment_id}),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => ApiError::BadRequest(msg),
            DispatchError::ProjectNotFound { id } => {
                ApiError::NotFound(format!("Project {} not found", id))
            }
            DispatchError::Launch {
                deployment_id,
                message,
            } => ApiError::Launch {
                deployment_id,
                message,
            },
            DispatchError::Store(e) => internal(e),
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = %format!("{:#}", e), "Request failed");
    ApiError::Internal(e.to_string())
}

fn required(field: &str, value: Option<String>) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required", field)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/project", post(create_project))
        .route("/deploy", post(deploy))
        .route("/projects", get(list_projects))
        .route("/projects/{id}", get(get_project))
        .route("/projects/{id}/deployments", get(list_deployments))
        .route("/deployments/{id}", get(get_deployment))
        .route("/logs/{id}", get(get_logs))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<SharedState>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let name = required("name", req.name)?;
    let source_locator = required("gitURL", req.source_locator)?;
    let slug = match req.slug.map(|s| s.trim().to_ascii_lowercase()) {
        Some(slug) => {
            validate_slug(&slug).map_err(ApiError::BadRequest)?;
            Some(slug)
        }
        None => None,
    };

    let project = state
        .registry
        .create_project(NewProject {
            name,
            source_locator,
            slug,
        })
        .await
        .map_err(|e| match e.downcast_ref::<SlugTaken>() {
            Some(taken) => ApiError::Conflict(taken.to_string()),
            None => internal(e),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "success", "data": {"project": project}})),
    ))
}

async fn deploy(
    State(state): State<SharedState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let project_id = required("projectId", req.project_id)?;
    let deployment = state
        .dispatcher
        .dispatch(&project_id, req.source_locator.as_deref())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued", "data": {"deploymentId": deployment.id}})),
    ))
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.registry.list_projects().await.map_err(internal)?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.get_project(&id).await.map_err(internal)? {
        Some(project) => Ok(Json(project)),
        None => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn list_deployments(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.registry.get_project(&id).await.map_err(internal)?.is_none() {
        return Err(ApiError::NotFound(format!("Project {} not found", id)));
    }
    let deployments = state.registry.list_deployments(&id).await.map_err(internal)?;
    Ok(Json(deployments))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.get_deployment(&id).await.map_err(internal)? {
        Some(deployment) => Ok(Json(deployment)),
        None => Err(ApiError::NotFound(format!("Deployment {} not found", id))),
    }
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.registry.get_deployment(&id).await.map_err(internal)?.is_none() {
        return Err(ApiError::NotFound(format!("Deployment {} not found", id)));
    }
    let logs = state
        .log_store
        .events_for_deployment(&id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({"deploymentId": id, "logs": logs})))
}
