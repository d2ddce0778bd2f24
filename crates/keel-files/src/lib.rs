//! Sandboxed filesystem access for keel workloads.
//!
//! Each workload owns one root directory. [`Filesystem`] exposes CRUD,
//! compression and backup operations confined to that root; the containment
//! rules live in [`path`] and the zip handling in [`archive`].

pub mod archive;
pub mod error;
pub mod manager;
pub mod path;

pub use archive::{extract_archive, write_archive};
pub use error::FileError;
pub use manager::{ArchiveInfo, DEFAULT_MAX_READ_BYTES, FileEntry, FileType, Filesystem};
