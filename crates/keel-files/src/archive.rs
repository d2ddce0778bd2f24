//! Zip archive creation and extraction.
//!
//! Archives are written to a temporary file next to their destination and
//! only persisted under the final name once every entry has been added, so a
//! failure never leaves a truncated archive behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{FileError, Result};
use crate::path::{relative_to, resolve};

const MAX_COMPRESSION: i64 = 9;

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(MAX_COMPRESSION))
        .large_file(true)
}

/// `<label>-<timestamp>.zip`
pub fn archive_name(label: &str) -> String {
    format!("{}-{}.zip", label, Utc::now().format("%Y%m%dT%H%M%S%3f"))
}

/// Zip `paths` (files or directories under `root`) into `dest`.
///
/// Entry names are relative to `root`. Returns the archive size in bytes.
pub fn write_archive(root: &Path, paths: &[PathBuf], dest: &Path) -> Result<u64> {
    let dest_dir = dest
        .parent()
        .ok_or_else(|| FileError::InvalidPath(dest.display().to_string()))?;
    std::fs::create_dir_all(dest_dir)?;

    let temp = NamedTempFile::new_in(dest_dir)?;
    let mut zip = ZipWriter::new(temp.reopen()?);
    let options = options();

    for path in paths {
        if path.is_dir() {
            add_directory(&mut zip, root, path, temp.path(), options)?;
        } else if path.is_file() {
            add_file(&mut zip, root, path, options)?;
        } else {
            return Err(FileError::NotFound(relative_to(root, path)));
        }
    }

    let mut file = zip.finish()?;
    file.flush()?;
    let size = file.metadata()?.len();

    temp.persist(dest)
        .map_err(|err| FileError::Io(err.error))?;
    debug!("Wrote archive {:?} ({} bytes)", dest, size);
    Ok(size)
}

fn add_file<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    path: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    let mut name = relative_to(root, path);
    if name.is_empty() {
        name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
    }
    zip.start_file(name, options)?;
    let mut input = std::fs::File::open(path)?;
    std::io::copy(&mut input, zip)?;
    Ok(())
}

fn add_directory<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    dir: &Path,
    skip: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|err| FileError::Io(err.into()))?;
        let path = entry.path();
        if path == skip {
            continue;
        }

        let name = relative_to(root, path);
        if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = std::fs::File::open(path)?;
            std::io::copy(&mut input, zip)?;
        } else if entry.file_type().is_dir() && !name.is_empty() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_symlink() {
            debug!("Skipping symlink {:?} while archiving", path);
        }
    }
    Ok(())
}

/// Extract `archive` into `dest`, refusing entries that would escape it.
///
/// Returns the number of entries written.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(enclosed) = entry.enclosed_name() else {
            warn!("Archive entry {:?} escapes destination", entry.name());
            return Err(FileError::PathTraversal);
        };
        let target = resolve(dest, &enclosed.to_string_lossy())?;

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        if let Some(mode) = entry.unix_mode().filter(|m| m & 0o777 != 0) {
            set_mode(&target, mode)?;
        }
    }

    Ok(zip.len())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))?;
    Ok(())
}
