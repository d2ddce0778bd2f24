//! Workload lifecycle and host endpoints.

use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
};
use keel_protocol::{BackendKind, HostStats, WorkloadStats};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::info;
use uuid::Uuid;

use crate::workload::{WorkloadMeta, WorkloadSpec};

use super::error::{ApiError, ApiResult};
use super::extract::{ApiJson, ApiPath};
use super::state::AppState;

/// Parse an optional JSON body. An empty body yields the default value.
pub(crate) fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

// ============================================================================
// Health and host
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub isolation: BackendKind,
    pub uptime_secs: u64,
    pub version: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        isolation: state.controller.backend_kind(),
        uptime_secs: state.started.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn host_stats(State(state): State<AppState>) -> Json<HostStats> {
    Json(state.host.read().await.clone())
}

// ============================================================================
// Workloads
// ============================================================================

/// Workload metadata with the latest stats sample.
#[derive(Debug, Serialize)]
pub struct WorkloadResponse {
    #[serde(flatten)]
    pub meta: WorkloadMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<WorkloadStats>,
}

pub async fn list_workloads(State(state): State<AppState>) -> Json<Vec<WorkloadMeta>> {
    Json(state.controller.list().await)
}

pub async fn create_workload(
    State(state): State<AppState>,
    ApiJson(spec): ApiJson<WorkloadSpec>,
) -> ApiResult<(StatusCode, Json<WorkloadMeta>)> {
    state.create_limiter.check()?;
    let meta = state.controller.create(spec).await?;
    info!(workload_id = %meta.id, backend = %meta.backend, "Created workload");
    Ok((StatusCode::CREATED, Json(meta)))
}

pub async fn get_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<WorkloadResponse>> {
    let meta = state.controller.status(id).await?;
    let stats = state.controller.stats(id);
    Ok(Json(WorkloadResponse { meta, stats }))
}

pub async fn delete_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<StatusCode> {
    state.controller.delete(id).await?;
    info!(workload_id = %id, "Deleted workload");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Power
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    /// Seconds to wait before escalating to a kill.
    pub timeout: Option<u64>,
}

pub async fn start_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    body: Bytes,
) -> ApiResult<Json<WorkloadMeta>> {
    let req: StartRequest = optional_json(&body)?;
    Ok(Json(state.controller.start(id, req.command, req.args).await?))
}

pub async fn stop_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    body: Bytes,
) -> ApiResult<Json<WorkloadMeta>> {
    let req: StopRequest = optional_json(&body)?;
    let timeout = req
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.stop_timeout);
    Ok(Json(state.controller.stop(id, Some(timeout)).await?))
}

pub async fn kill_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<WorkloadMeta>> {
    Ok(Json(state.controller.kill(id).await?))
}

pub async fn restart_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<WorkloadMeta>> {
    Ok(Json(state.controller.restart(id).await?))
}

pub async fn install_workload(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<WorkloadMeta>> {
    Ok(Json(state.controller.install(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

pub async fn send_input(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<InputRequest>,
) -> ApiResult<StatusCode> {
    state.controller.send_input(id, &req.data).await?;
    Ok(StatusCode::NO_CONTENT)
}
