//! Moving a workload's persistent state to another agent.
//!
//! The sending side runs the whole pipeline in [`TransferService::initiate`]:
//!
//! ```text
//! preparing -> exporting -> uploading -> importing -> completed
//!     \____________\____________\____________\______-> failed
//! ```
//!
//! The receiving side exposes [`TransferService::receive_incoming`] and
//! [`TransferService::complete_import`] through the HTTP API. Records live in
//! memory only and are lost on restart.

mod client;
mod error;
mod model;

pub use client::{ImportRequest, ReceiveResponse, TRANSFER_UUID_HEADER, TargetClient};
pub use error::{TransferError, TransferResult};
pub use model::{Transfer, TransferStatus, TransferStep, TransferTarget};

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::workload::{ControllerError, WorkloadController};

pub struct TransferService {
    controller: WorkloadController,
    client: TargetClient,
    transfers: RwLock<HashMap<Uuid, Transfer>>,
    outgoing: PathBuf,
    incoming: PathBuf,
}

impl TransferService {
    pub fn new(controller: WorkloadController, client: TargetClient, data_dir: &Path) -> Self {
        let root = data_dir.join("transfers");
        Self {
            controller,
            client,
            transfers: RwLock::new(HashMap::new()),
            outgoing: root.join("outgoing"),
            incoming: root.join("incoming"),
        }
    }

    pub fn incoming_dir(&self) -> &Path {
        &self.incoming
    }

    pub async fn get(&self, id: Uuid) -> TransferResult<Transfer> {
        self.transfers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound(id))
    }

    /// All transfers, newest first.
    pub async fn list(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.transfers.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    async fn update(&self, id: Uuid, f: impl FnOnce(&mut Transfer)) {
        if let Some(transfer) = self.transfers.write().await.get_mut(&id) {
            f(transfer);
        }
    }

    async fn advance(&self, id: Uuid, status: TransferStatus, progress: u8) {
        info!("Transfer {}: {} ({}%)", id, status, progress);
        self.update(id, |t| t.advance(status, progress)).await;
    }

    // ========================================================================
    // Sending side
    // ========================================================================

    /// Run a transfer to completion. The returned record is `completed`;
    /// on failure the record is `failed` and the error is returned.
    pub async fn initiate(
        &self,
        workload_id: Uuid,
        target: TransferTarget,
    ) -> TransferResult<Transfer> {
        if target.address.trim().is_empty() {
            return Err(TransferError::Invalid("target address is empty".to_string()));
        }
        // Fail fast on unknown workloads before a record is made.
        self.controller.status(workload_id).await?;

        let transfer = Transfer::new(workload_id, target.clone());
        let id = transfer.id;
        {
            let mut transfers = self.transfers.write().await;
            if transfers
                .values()
                .any(|t| t.workload_id == workload_id && !t.status.is_terminal())
            {
                return Err(TransferError::InProgress(workload_id));
            }
            transfers.insert(id, transfer);
        }
        info!(
            "Transfer {} of workload {} to {} started",
            id,
            workload_id,
            target.base_url()
        );

        let archive = self
            .outgoing
            .join(format!("{}-{}.zip", workload_id, Utc::now().timestamp_millis()));

        let result = self.run(id, workload_id, &target, &archive).await;
        remove_artifact(&archive).await;

        match result {
            Ok(()) => {
                info!("Transfer {} completed", id);
                self.get(id).await
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", id, e);
                let message = e.to_string();
                self.update(id, |t| t.fail(message)).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        id: Uuid,
        workload_id: Uuid,
        target: &TransferTarget,
        archive: &Path,
    ) -> TransferResult<()> {
        self.controller.stop(workload_id, None).await?;

        self.advance(id, TransferStatus::Exporting, 0).await;
        let store = self.controller.store();
        let root = store.root().to_path_buf();
        let mut sources = vec![store.dir(workload_id)];
        let backups = store.backup_dir(workload_id);
        if backups.is_dir() {
            sources.push(backups);
        }
        let dest = archive.to_path_buf();
        let size = tokio::task::spawn_blocking(move || {
            keel_files::write_archive(&root, &sources, &dest)
        })
        .await??;
        let path = archive.to_path_buf();
        self.update(id, |t| {
            t.archive_path = Some(path);
            t.archive_size = Some(size);
        })
        .await;

        self.advance(id, TransferStatus::Uploading, 30).await;
        let temp_path = self.client.upload(target, workload_id, archive).await?;

        self.advance(id, TransferStatus::Importing, 70).await;
        self.client.import(target, workload_id, temp_path).await?;
        self.update(id, |t| t.advance(TransferStatus::Importing, 90)).await;

        // Only now is the target the owner of the workload.
        self.controller.delete(workload_id).await?;
        self.advance(id, TransferStatus::Completed, 100).await;
        Ok(())
    }

    // ========================================================================
    // Receiving side
    // ========================================================================

    /// Write an uploaded archive into the incoming directory.
    pub async fn receive_incoming<S, E>(&self, workload_id: Uuid, mut body: S) -> TransferResult<PathBuf>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        tokio::fs::create_dir_all(&self.incoming).await?;
        let path = self.incoming.join(format!(
            "{}-{}.zip",
            workload_id,
            Utc::now().timestamp_millis()
        ));

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        let copied: TransferResult<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    TransferError::Io(std::io::Error::other(format!("upload interrupted: {e}")))
                })?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = copied {
            drop(file);
            remove_artifact(&path).await;
            return Err(e);
        }

        info!(
            "Received {} bytes for workload {} at {:?}",
            written, workload_id, path
        );
        Ok(path)
    }

    /// Unpack a received archive and adopt the workload as `stopped`.
    ///
    /// The archive holds `workloads/<uuid>/` and optionally `backups/<uuid>/`,
    /// relative to the data directory. It is unpacked into a staging
    /// directory first; only those two trees are moved into place.
    pub async fn complete_import(&self, workload_id: Uuid, temp_path: &Path) -> TransferResult<()> {
        let archive = self.verify_incoming(temp_path).await?;
        let store = self.controller.store().clone();
        if self.controller.exists(workload_id).await || store.dir(workload_id).exists() {
            return Err(TransferError::Controller(ControllerError::Conflict(format!(
                "workload {workload_id} already exists on this node"
            ))));
        }

        let staging = self.incoming.join(format!("{workload_id}.staging"));
        remove_tree(&staging).await;
        let source = archive.clone();
        let unpack_dest = staging.clone();
        let extracted =
            tokio::task::spawn_blocking(move || keel_files::extract_archive(&source, &unpack_dest))
                .await?;
        remove_artifact(&archive).await;

        let placed = match extracted {
            Ok(entries) => self
                .place_imported(workload_id, &staging)
                .await
                .map(|()| entries),
            Err(e) => Err(e.into()),
        };
        remove_tree(&staging).await;
        let entries = placed?;

        if let Err(e) = self.controller.adopt(workload_id).await {
            warn!("Adopting imported workload {} failed: {}", workload_id, e);
            if let Err(cleanup) = store.remove(workload_id).await {
                warn!("Failed to clean import of {}: {}", workload_id, cleanup);
            }
            return Err(e.into());
        }
        info!("Imported workload {} ({} entries)", workload_id, entries);
        Ok(())
    }

    /// Move the unpacked trees from `staging` into the store.
    async fn place_imported(&self, workload_id: Uuid, staging: &Path) -> TransferResult<()> {
        let store = self.controller.store();
        let staged = |dir: PathBuf| -> TransferResult<PathBuf> {
            dir.strip_prefix(store.root())
                .map(|p| staging.join(p))
                .map_err(|_| TransferError::Invalid(format!("{} is outside the data dir", dir.display())))
        };
        let unpacked_dir = staged(store.dir(workload_id))?;
        let unpacked_backups = staged(store.backup_dir(workload_id))?;

        if !unpacked_dir.join("meta.json").is_file() {
            return Err(TransferError::Invalid(format!(
                "archive does not contain workload {workload_id}"
            )));
        }

        tokio::fs::create_dir_all(store.workloads_dir()).await?;
        tokio::fs::rename(&unpacked_dir, store.dir(workload_id)).await?;
        if unpacked_backups.is_dir() {
            let dest = store.backup_dir(workload_id);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            remove_tree(&dest).await;
            if let Err(e) = tokio::fs::rename(&unpacked_backups, &dest).await {
                if let Err(cleanup) = store.remove(workload_id).await {
                    warn!("Failed to clean import of {}: {}", workload_id, cleanup);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// The path must name an existing file inside the incoming directory.
    async fn verify_incoming(&self, temp_path: &Path) -> TransferResult<PathBuf> {
        let invalid = || {
            TransferError::Invalid(format!(
                "{} is not a received transfer archive",
                temp_path.display()
            ))
        };
        let incoming = tokio::fs::canonicalize(&self.incoming)
            .await
            .map_err(|_| invalid())?;
        let archive = tokio::fs::canonicalize(temp_path)
            .await
            .map_err(|_| invalid())?;

        if archive.parent() != Some(incoming.as_path()) || !archive.is_file() {
            return Err(invalid());
        }
        Ok(archive)
    }
}

async fn remove_tree(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove transfer artifact {:?}: {}", path, e),
    }
}
