//! On-disk layout of workloads.
//!
//! ```text
//! <data_dir>/workloads/<uuid>/meta.json
//! <data_dir>/workloads/<uuid>/home/
//! <data_dir>/backups/<uuid>/
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::error::ControllerResult;
use super::model::WorkloadMeta;

const META_FILE: &str = "meta.json";
const HOME_DIR: &str = "home";

#[derive(Debug, Clone)]
pub struct WorkloadStore {
    root: PathBuf,
    workloads: PathBuf,
    backups: PathBuf,
}

impl WorkloadStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.to_path_buf(),
            workloads: data_dir.join("workloads"),
            backups: data_dir.join("backups"),
        }
    }

    /// The data directory both trees live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workloads_dir(&self) -> &Path {
        &self.workloads
    }

    pub fn dir(&self, id: Uuid) -> PathBuf {
        self.workloads.join(id.to_string())
    }

    pub fn home(&self, id: Uuid) -> PathBuf {
        self.dir(id).join(HOME_DIR)
    }

    pub fn backup_dir(&self, id: Uuid) -> PathBuf {
        self.backups.join(id.to_string())
    }

    /// Create the workload directories. Idempotent.
    pub async fn ensure_dirs(&self, id: Uuid) -> ControllerResult<()> {
        fs::create_dir_all(self.home(id)).await?;
        Ok(())
    }

    /// Write `meta.json` through a temporary file and rename.
    pub async fn save(&self, meta: &WorkloadMeta) -> ControllerResult<()> {
        let dir = self.dir(meta.id);
        fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(meta)?;
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, dir.join(META_FILE)).await?;
        Ok(())
    }

    pub async fn load(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        let raw = fs::read(self.dir(id).join(META_FILE)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every readable `meta.json` below the workloads directory.
    ///
    /// Unreadable or foreign entries are logged and skipped.
    pub async fn load_all(&self) -> ControllerResult<Vec<WorkloadMeta>> {
        let mut metas = Vec::new();
        let mut entries = match fs::read_dir(&self.workloads).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| Uuid::parse_str(n).ok())
            else {
                continue;
            };

            match self.load(id).await {
                Ok(meta) if meta.id == id => metas.push(meta),
                Ok(meta) => warn!(
                    "Skipping {}: meta.json names a different id {}",
                    id, meta.id
                ),
                Err(e) => warn!("Skipping workload {}: {}", id, e),
            }
        }

        metas.sort_by_key(|m| m.created_at);
        Ok(metas)
    }

    /// Remove the workload directory and its backups.
    ///
    /// Missing directories are not an error.
    pub async fn remove(&self, id: Uuid) -> ControllerResult<()> {
        for dir in [self.dir(id), self.backup_dir(id)] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::model::WorkloadSpec;
    use keel_protocol::{BackendKind, WorkloadStatus};
    use keel_sandbox::ResourceLimits;
    use tempfile::TempDir;

    fn meta() -> WorkloadMeta {
        WorkloadMeta::new(
            Uuid::new_v4(),
            BackendKind::BareProcess,
            ResourceLimits::default(),
            WorkloadSpec::default(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = WorkloadStore::new(dir.path());
        let mut m = meta();
        m.status = WorkloadStatus::Stopped;
        m.exit_code = Some(0);

        store.save(&m).await.unwrap();
        assert_eq!(store.load(m.id).await.unwrap(), m);
        assert!(!store.dir(m.id).join("meta.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_all_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = WorkloadStore::new(dir.path());
        let a = meta();
        store.save(&a).await.unwrap();

        std::fs::create_dir_all(store.workloads_dir().join("not-a-uuid")).unwrap();
        let broken = Uuid::new_v4();
        std::fs::create_dir_all(store.dir(broken)).unwrap();
        std::fs::write(store.dir(broken).join("meta.json"), "{").unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, a.id);
    }

    #[tokio::test]
    async fn test_load_all_without_dir() {
        let dir = TempDir::new().unwrap();
        let store = WorkloadStore::new(&dir.path().join("missing"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = WorkloadStore::new(dir.path());
        let m = meta();
        store.ensure_dirs(m.id).await.unwrap();
        std::fs::create_dir_all(store.backup_dir(m.id)).unwrap();

        store.remove(m.id).await.unwrap();
        assert!(!store.dir(m.id).exists());
        assert!(!store.backup_dir(m.id).exists());
        store.remove(m.id).await.unwrap();
    }
}
