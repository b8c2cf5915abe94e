//! HTTP and WebSocket surface

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use wd_core::paths::{scan_project_dirs, ProjectEntry};
use wd_core::protocol::TunnelStatus;
use wd_core::store::InstanceRecord;
use wd_core::{InstanceId, MachineId, StoreError, TerminalError, TunnelError, WdError};

use crate::control::{ControlPlane, CreateInstance};
use crate::gateway::serve_socket;
use crate::status::{ConflictReport, HookOutcome, HookSignal};

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<WdError> for ApiError {
    fn from(err: WdError) -> Self {
        let message = err.to_string();
        match err {
            WdError::Terminal(TerminalError::NotFound(_))
            | WdError::Tunnel(TunnelError::NotFound(_))
            | WdError::Store(StoreError::NotFound(_)) => ApiError::NotFound(message),
            WdError::Terminal(TerminalError::AlreadyExists(_)) => ApiError::Conflict(message),
            WdError::Terminal(TerminalError::SpawnFailed { .. })
            | WdError::Terminal(TerminalError::ConnectionFailure(_))
            | WdError::Tunnel(_) => ApiError::Upstream(message),
            WdError::Protocol(_) | WdError::Config(_) => ApiError::BadRequest(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        WdError::from(err).into()
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        WdError::from(err).into()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router for a started control plane
pub fn router(plane: ControlPlane) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/:id", delete(close_instance))
        .route("/instances/:id/conflicts", get(instance_conflicts))
        .route("/hooks/:id", post(hook))
        .route("/tunnels", get(list_tunnels))
        .route("/tunnels/:machine_id", get(tunnel_status))
        .route("/tunnels/:machine_id/reconnect", post(reconnect_tunnel))
        .route("/projects", get(list_projects))
        .with_state(plane)
}

async fn ws_handler(ws: WebSocketUpgrade, State(plane): State<ControlPlane>) -> impl IntoResponse {
    let gateway = plane.gateway().clone();
    ws.on_upgrade(move |socket| serve_socket(gateway, socket))
}

async fn health(State(plane): State<ControlPlane>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": plane.terminals().len(),
        "connections": plane.gateway().connection_count(),
        "tunnels": plane.tunnels().get_all_statuses().len(),
    }))
}

async fn list_instances(State(plane): State<ControlPlane>) -> ApiResult<Json<Vec<InstanceRecord>>> {
    Ok(Json(plane.store().list().await?))
}

async fn create_instance(
    State(plane): State<ControlPlane>,
    Json(request): Json<CreateInstance>,
) -> ApiResult<(StatusCode, Json<InstanceRecord>)> {
    let record = plane.create_instance(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn close_instance(
    State(plane): State<ControlPlane>,
    Path(id): Path<InstanceId>,
) -> ApiResult<StatusCode> {
    plane.close_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn instance_conflicts(
    State(plane): State<ControlPlane>,
    Path(id): Path<InstanceId>,
) -> Json<ConflictReport> {
    Json(plane.status().conflicts(&id))
}

/// Hook payload; agents send `hook_event_name`, scripts may send `status`
#[derive(Debug, Deserialize)]
struct HookRequest {
    #[serde(alias = "hook_event_name", alias = "status")]
    event: String,
}

async fn hook(
    State(plane): State<ControlPlane>,
    Path(id): Path<InstanceId>,
    Json(request): Json<HookRequest>,
) -> ApiResult<Json<HookOutcome>> {
    let signal: HookSignal = request.event.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(plane.handle_hook(&id, signal).await?))
}

async fn list_tunnels(State(plane): State<ControlPlane>) -> Json<Vec<TunnelStatus>> {
    Json(plane.tunnels().get_all_statuses())
}

async fn tunnel_status(
    State(plane): State<ControlPlane>,
    Path(machine_id): Path<MachineId>,
) -> ApiResult<Json<TunnelStatus>> {
    plane
        .tunnels()
        .get_status(&machine_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No tunnel for {}", machine_id)))
}

async fn reconnect_tunnel(
    State(plane): State<ControlPlane>,
    Path(machine_id): Path<MachineId>,
) -> ApiResult<StatusCode> {
    plane.tunnels().force_reconnect(&machine_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_projects(State(plane): State<ControlPlane>) -> ApiResult<Json<Vec<ProjectEntry>>> {
    let Some(root) = plane.config().projects_dir.clone() else {
        return Ok(Json(Vec::new()));
    };
    let entries = tokio::task::spawn_blocking(move || scan_project_dirs(&root))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("Failed to scan projects: {}", e)))?;
    Ok(Json(entries))
}
