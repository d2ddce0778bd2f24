//! Node-to-node transfer endpoints.

use std::path::PathBuf;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::transfer::{ImportRequest, ReceiveResponse, TRANSFER_UUID_HEADER, Transfer, TransferTarget};

use super::error::{ApiError, ApiResult};
use super::extract::{ApiJson, ApiPath};
use super::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub uuid: Uuid,
    pub target_node: TransferTarget,
}

/// Run a transfer to completion and return the final record.
pub async fn initiate(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<InitiateRequest>,
) -> ApiResult<Json<Transfer>> {
    info!(
        workload_id = %req.uuid,
        target = %req.target_node.base_url(),
        "Transfer requested"
    );
    Ok(Json(state.transfers.initiate(req.uuid, req.target_node).await?))
}

/// Stream an incoming archive to disk.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<ReceiveResponse>> {
    let workload_id = headers
        .get(TRANSFER_UUID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing {TRANSFER_UUID_HEADER} header")))?
        .parse::<Uuid>()
        .map_err(|e| ApiError::bad_request(format!("invalid {TRANSFER_UUID_HEADER}: {e}")))?;

    let path = state
        .transfers
        .receive_incoming(workload_id, Box::pin(body.into_data_stream()))
        .await?;
    Ok(Json(ReceiveResponse {
        temp_path: path.to_string_lossy().to_string(),
    }))
}

pub async fn import(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ImportRequest>,
) -> ApiResult<StatusCode> {
    state
        .transfers
        .complete_import(req.uuid, &PathBuf::from(req.temp_path))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_transfers(State(state): State<AppState>) -> Json<Vec<Transfer>> {
    Json(state.transfers.list().await)
}

pub async fn get_transfer(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Transfer>> {
    Ok(Json(state.transfers.get(id).await?))
}
