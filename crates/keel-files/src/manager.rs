use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::{archive_name, write_archive};
use crate::error::{FileError, Result};
use crate::path::{relative_to, resolve_verified, sanitize_label};

/// Default cap for [`Filesystem::read_file`].
pub const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

/// One entry of a directory listing.
#[derive(Debug, Serialize, Clone)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the workload root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileType,
    pub size: u64,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

/// An archive produced by compress or backup.
#[derive(Debug, Serialize, Clone)]
pub struct ArchiveInfo {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// File access confined to one workload root.
///
/// Every method resolves its path arguments through the containment check
/// before touching the filesystem.
#[derive(Debug, Clone)]
pub struct Filesystem {
    root: PathBuf,
    backup_dir: PathBuf,
    max_read_bytes: u64,
}

impl Filesystem {
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }

    pub fn with_max_read_bytes(mut self, limit: u64) -> Self {
        self.max_read_bytes = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Resolve a caller-supplied path inside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        resolve_verified(&self.root, relative)
    }

    /// List a directory, directories first then by name.
    ///
    /// A missing directory is created and reported empty.
    pub async fn list_dir(&self, relative: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(relative)?;

        match fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => return Err(FileError::NotADirectory),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir).await?;
                debug!("Created missing directory {:?}", dir);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        }

        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let meta = fs::symlink_metadata(entry.path()).await?;
            let kind = if meta.file_type().is_symlink() {
                FileType::Symlink
            } else if meta.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: relative_to(&self.canonical_root(), &entry.path()),
                kind,
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            });
        }

        entries.sort_by(|a, b| {
            let a_dir = a.kind == FileType::Directory;
            let b_dir = b.kind == FileType::Directory;
            b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    /// Read a whole file, refusing files larger than the configured cap.
    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(relative.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            return Err(FileError::NotAFile);
        }
        if meta.len() > self.max_read_bytes {
            return Err(FileError::FileTooLarge {
                size: meta.len(),
                limit: self.max_read_bytes,
            });
        }
        Ok(fs::read(&path).await?)
    }

    /// Write a file, creating parent directories as needed.
    pub async fn write_file(&self, relative: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if path == self.canonical_root() || path == self.root {
            return Err(FileError::NotAFile);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(FileError::NotAFile);
        }
        fs::write(&path, data).await?;
        debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(())
    }

    pub async fn create_dir(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if fs::metadata(&path).await.is_ok_and(|m| !m.is_dir()) {
            return Err(FileError::AlreadyExists(relative.to_string()));
        }
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Delete a file or a directory tree. The root itself cannot be deleted.
    pub async fn delete(&self, relative: &str) -> Result<()> {
        let path = self.resolve_below_root(relative)?;
        let meta = match fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(relative.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        info!("Deleted {:?}", path);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve_below_root(from)?;
        let target = self.resolve_below_root(to)?;
        if fs::symlink_metadata(&source).await.is_err() {
            return Err(FileError::NotFound(from.to_string()));
        }
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(FileError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        Ok(())
    }

    /// Copy a file or directory tree to a new location.
    pub async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve_below_root(to)?;
        if fs::metadata(&source).await.is_err() {
            return Err(FileError::NotFound(from.to_string()));
        }
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(FileError::AlreadyExists(to.to_string()));
        }
        if target.starts_with(&source) {
            return Err(FileError::InvalidPath(format!(
                "cannot copy {from} into itself"
            )));
        }
        tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await??;
        Ok(())
    }

    /// Compress the given entries into an archive placed in the root.
    pub async fn compress(&self, paths: &[String], label: Option<&str>) -> Result<ArchiveInfo> {
        if paths.is_empty() {
            return Err(FileError::InvalidPath("no entries to compress".to_string()));
        }
        let resolved = paths
            .iter()
            .map(|p| self.resolve(p))
            .collect::<Result<Vec<_>>>()?;
        let label = label.and_then(sanitize_label).unwrap_or_else(|| "archive".to_string());
        let root = self.canonical_root();
        self.archive_into(root.clone(), resolved, root, &label).await
    }

    /// Archive the whole root into the backup directory.
    pub async fn create_backup(&self, label: Option<&str>) -> Result<ArchiveInfo> {
        let label = label.and_then(sanitize_label).unwrap_or_else(|| "backup".to_string());
        fs::create_dir_all(&self.root).await?;
        let root = self.canonical_root();
        let info = self
            .archive_into(root.clone(), vec![root], self.backup_dir.clone(), &label)
            .await?;
        info!("Created backup {} ({} bytes)", info.name, info.size);
        Ok(info)
    }

    /// Backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<ArchiveInfo>> {
        let mut backups = Vec::new();
        let mut reader = match fs::read_dir(&self.backup_dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".zip") {
                continue;
            }
            let meta = entry.metadata().await?;
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(ArchiveInfo {
                name,
                size: meta.len(),
                created_at,
            });
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        Ok(backups)
    }

    pub async fn delete_backup(&self, name: &str) -> Result<()> {
        if name.contains('/') || name.contains('\\') || !name.ends_with(".zip") {
            return Err(FileError::InvalidPath(name.to_string()));
        }
        let path = crate::path::resolve(&self.backup_dir, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FileError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Total size of regular files under the root, in bytes.
    pub async fn disk_usage(&self) -> Result<u64> {
        let root = self.root.clone();
        let total = tokio::task::spawn_blocking(move || {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum::<u64>()
        })
        .await?;
        Ok(total)
    }

    fn canonical_root(&self) -> PathBuf {
        self.root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone())
    }

    fn resolve_below_root(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if path == self.root || path == self.canonical_root() {
            return Err(FileError::InvalidPath(
                "operation not allowed on the root directory".to_string(),
            ));
        }
        Ok(path)
    }

    async fn archive_into(
        &self,
        root: PathBuf,
        paths: Vec<PathBuf>,
        dest_dir: PathBuf,
        label: &str,
    ) -> Result<ArchiveInfo> {
        let name = archive_name(label);
        let dest = dest_dir.join(&name);
        let size =
            tokio::task::spawn_blocking(move || write_archive(&root, &paths, &dest)).await??;
        Ok(ArchiveInfo {
            name,
            size,
            created_at: Utc::now(),
        })
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    if source.is_file() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|err| FileError::Io(err.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| FileError::PathTraversal)?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
