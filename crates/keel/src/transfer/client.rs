//! HTTP client for the receiving agent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::error::{TransferError, TransferResult};
use super::model::TransferTarget;

/// Header naming the workload an uploaded archive belongs to.
pub const TRANSFER_UUID_HEADER: &str = "X-Transfer-UUID";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveResponse {
    pub temp_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub uuid: Uuid,
    pub temp_path: String,
}

#[derive(Debug, Clone)]
pub struct TargetClient {
    http: reqwest::Client,
    upload_timeout: Duration,
}

impl TargetClient {
    pub fn new(request_timeout: Duration, upload_timeout: Duration) -> TransferResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            upload_timeout,
        })
    }

    /// Stream `archive` to the target. Returns the target-side temp path.
    pub async fn upload(
        &self,
        target: &TransferTarget,
        workload_id: Uuid,
        archive: &Path,
    ) -> TransferResult<String> {
        let file = tokio::fs::File::open(archive).await?;
        let size = file.metadata().await?.len();
        let url = format!("{}/transfer/receive", target.base_url());
        debug!("Uploading {} bytes to {}", size, url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&target.token)
            .header(TRANSFER_UUID_HEADER, workload_id.to_string())
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .timeout(self.upload_timeout)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let response = check(response, "receive").await?;
        let body: ReceiveResponse = response.json().await?;
        Ok(body.temp_path)
    }

    /// Ask the target to unpack a previously uploaded archive.
    pub async fn import(
        &self,
        target: &TransferTarget,
        workload_id: Uuid,
        temp_path: String,
    ) -> TransferResult<()> {
        let url = format!("{}/transfer/import", target.base_url());
        let response = self
            .http
            .post(&url)
            .bearer_auth(&target.token)
            .json(&ImportRequest {
                uuid: workload_id,
                temp_path,
            })
            .send()
            .await?;
        check(response, "import").await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response, step: &'static str) -> TransferResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransferError::Rejected {
        step,
        status: status.as_u16(),
        body,
    })
}
