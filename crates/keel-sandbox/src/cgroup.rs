//! Best-effort cgroup v2 limit application.
//!
//! Each workload gets a child group under a configurable parent. Callers log
//! failures and carry on: a host without a delegated cgroup subtree still
//! runs workloads, just without kernel-enforced limits.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::limits::ResourceLimits;

#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    parent: PathBuf,
}

impl CgroupLimiter {
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: parent.into(),
        }
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn group_path(&self, name: &str) -> PathBuf {
        self.parent.join(name)
    }

    /// Create the group, write every limit and move `pid` into it.
    pub fn apply(&self, name: &str, pid: u32, limits: &ResourceLimits) -> io::Result<PathBuf> {
        let group = self.group_path(name);
        std::fs::create_dir_all(&group)?;

        for (file, value) in limits.cgroup_settings() {
            std::fs::write(group.join(file), &value)?;
            debug!("cgroup {}: {} = {}", name, file, value);
        }

        std::fs::write(group.join("cgroup.procs"), pid.to_string())?;
        Ok(group)
    }

    /// Remove the group. A missing group is not an error.
    pub fn remove(&self, name: &str) -> io::Result<()> {
        match std::fs::remove_dir(self.group_path(name)) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
