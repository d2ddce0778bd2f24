//! Transfer records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Preparing,
    Exporting,
    Uploading,
    Importing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Preparing => "preparing",
            TransferStatus::Exporting => "exporting",
            TransferStatus::Uploading => "uploading",
            TransferStatus::Importing => "importing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The agent a workload is moved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTarget {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub address: String,
    pub port: u16,
    /// Bearer token of the target's API. Never echoed back.
    #[serde(default, skip_serializing)]
    pub token: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl TransferTarget {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.address, self.port)
    }
}

/// One entry of a transfer's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStep {
    pub status: TransferStatus,
    pub progress: u8,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub workload_id: Uuid,
    pub target: TransferTarget,
    pub status: TransferStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<TransferStep>,
}

impl Transfer {
    pub fn new(workload_id: Uuid, target: TransferTarget) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workload_id,
            target,
            status: TransferStatus::Preparing,
            progress: 0,
            archive_path: None,
            archive_size: None,
            error: None,
            created_at: now,
            updated_at: now,
            history: vec![TransferStep {
                status: TransferStatus::Preparing,
                progress: 0,
                at: now,
            }],
        }
    }

    /// Move to `status` at `progress`. Progress never goes backwards.
    pub fn advance(&mut self, status: TransferStatus, progress: u8) {
        let now = Utc::now();
        self.status = status;
        self.progress = self.progress.max(progress.min(100));
        self.updated_at = now;
        self.history.push(TransferStep {
            status,
            progress: self.progress,
            at: now,
        });
    }

    /// Mark failed, keeping the last progress value.
    pub fn fail(&mut self, error: String) {
        let progress = self.progress;
        self.error = Some(error);
        self.advance(TransferStatus::Failed, progress);
    }
}
