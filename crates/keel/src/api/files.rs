//! File manager and backup endpoints for a workload's data directory.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use keel_files::{ArchiveInfo, FileEntry};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::handlers::optional_json;
use super::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct CompressRequest {
    pub paths: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackupRequest {
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub bytes: u64,
}

pub async fn list_files(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<PathQuery>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    let fs = state.controller.filesystem(id).await?;
    Ok(Json(fs.list_dir(&query.path).await?))
}

pub async fn read_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let fs = state.controller.filesystem(id).await?;
    let data = fs.read_file(&query.path).await?;
    let mime = mime_guess::from_path(&query.path).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], data))
}

pub async fn write_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<PathQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.write_file(&query.path, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_dir(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<PathRequest>,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.create_dir(&req.path).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete_path(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<PathRequest>,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.delete(&req.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rename_path(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<MoveRequest>,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.rename(&req.from, &req.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn copy_path(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<MoveRequest>,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.copy(&req.from, &req.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn compress(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CompressRequest>,
) -> ApiResult<(StatusCode, Json<ArchiveInfo>)> {
    let fs = state.controller.filesystem(id).await?;
    let archive = fs.compress(&req.paths, req.label.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(archive)))
}

pub async fn disk_usage(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<UsageResponse>> {
    let fs = state.controller.filesystem(id).await?;
    Ok(Json(UsageResponse {
        bytes: fs.disk_usage().await?,
    }))
}

// ============================================================================
// Backups
// ============================================================================

pub async fn list_backups(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<ArchiveInfo>>> {
    let fs = state.controller.filesystem(id).await?;
    Ok(Json(fs.list_backups().await?))
}

pub async fn create_backup(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ArchiveInfo>)> {
    let req: BackupRequest = optional_json(&body)?;
    let fs = state.controller.filesystem(id).await?;
    let backup = fs.create_backup(req.label.as_deref()).await?;
    info!(workload_id = %id, backup = %backup.name, "Backup created");
    Ok((StatusCode::CREATED, Json(backup)))
}

pub async fn delete_backup(
    State(state): State<AppState>,
    ApiPath((id, name)): ApiPath<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    let fs = state.controller.filesystem(id).await?;
    fs.delete_backup(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
