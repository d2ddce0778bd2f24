//! Bubblewrap (bwrap) argument construction for the namespace jail.
//!
//! The jail unshares every namespace, exposes the host's system directories
//! read-only and binds the workload home read-write at
//! [`CONTAINER_HOME`](crate::CONTAINER_HOME). Processes run under a fixed
//! unprivileged uid/gid.

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::CONTAINER_HOME;

/// Host directories bound read-only when they exist.
const SYSTEM_DIRS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc/alternatives"];

/// Individual files from /etc needed for name resolution and TLS.
const SYSTEM_FILES: &[&str] = &[
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/ssl",
    "/etc/ca-certificates",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// bwrap binary name or path.
    pub binary: String,
    /// uid inside the jail.
    pub uid: u32,
    /// gid inside the jail.
    pub gid: u32,
    /// Keep the host network namespace.
    pub allow_network: bool,
    /// Additional host paths bound read-only at the same location.
    pub extra_ro_bind: Vec<PathBuf>,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            binary: "bwrap".to_string(),
            uid: 1000,
            gid: 1000,
            allow_network: false,
            extra_ro_bind: Vec::new(),
        }
    }
}

impl JailConfig {
    /// Build the bwrap arguments that precede the workload command.
    ///
    /// The returned list ends with `--` so the command can be appended.
    pub fn build_args(&self, home: &Path, env: &[(String, String)]) -> Vec<String> {
        let mut args = vec![
            "--unshare-all".to_string(),
            "--die-with-parent".to_string(),
            "--new-session".to_string(),
        ];

        if self.allow_network {
            args.push("--share-net".to_string());
        }

        for dir in SYSTEM_DIRS.iter().chain(SYSTEM_FILES) {
            if Path::new(dir).exists() {
                args.push("--ro-bind".to_string());
                args.push(dir.to_string());
                args.push(dir.to_string());
            }
        }

        for path in &self.extra_ro_bind {
            if path.exists() {
                let path = path.to_string_lossy().to_string();
                args.push("--ro-bind".to_string());
                args.push(path.clone());
                args.push(path);
            } else {
                debug!("Skipping extra ro-bind {:?} (does not exist)", path);
            }
        }

        args.extend(
            [
                "--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp", "--dir", "/home",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        args.push("--bind".to_string());
        args.push(home.to_string_lossy().to_string());
        args.push(CONTAINER_HOME.to_string());
        args.push("--chdir".to_string());
        args.push(CONTAINER_HOME.to_string());

        args.push("--uid".to_string());
        args.push(self.uid.to_string());
        args.push("--gid".to_string());
        args.push(self.gid.to_string());

        args.push("--clearenv".to_string());
        for (key, value) in env {
            args.push("--setenv".to_string());
            args.push(key.clone());
            args.push(value.clone());
        }

        args.push("--".to_string());

        info!(
            "Jail configured: home='{}', uid={}, gid={}, network={}, {} bwrap args",
            home.display(),
            self.uid,
            self.gid,
            self.allow_network,
            args.len()
        );
        debug!("Full bwrap args: {:?}", args);
        args
    }
}
