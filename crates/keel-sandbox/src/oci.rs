//! OCI runtime bundle generation for the sandbox runtime.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::CONTAINER_HOME;
use crate::limits::ResourceLimits;

const OCI_VERSION: &str = "1.0.2";

/// Inputs for a single bundle.
#[derive(Debug, Clone)]
pub struct OciBundle {
    pub hostname: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub limits: ResourceLimits,
}

impl OciBundle {
    /// Render the `config.json` document.
    ///
    /// The host root is exposed read-only; only the workload home is
    /// writable. Every namespace including network is private.
    pub fn spec(&self) -> Value {
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        json!({
            "ociVersion": OCI_VERSION,
            "hostname": self.hostname,
            "process": {
                "terminal": false,
                "user": { "uid": self.uid, "gid": self.gid },
                "args": self.args,
                "env": env,
                "cwd": CONTAINER_HOME,
                "noNewPrivileges": true,
                "rlimits": self.limits.oci_rlimits(),
                "capabilities": {
                    "bounding": [],
                    "effective": [],
                    "permitted": [],
                    "ambient": []
                }
            },
            "root": { "path": "/", "readonly": true },
            "mounts": [
                { "destination": "/proc", "type": "proc", "source": "proc" },
                {
                    "destination": "/dev",
                    "type": "tmpfs",
                    "source": "tmpfs",
                    "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]
                },
                {
                    "destination": "/tmp",
                    "type": "tmpfs",
                    "source": "tmpfs",
                    "options": ["nosuid", "nodev", "mode=1777"]
                },
                {
                    "destination": CONTAINER_HOME,
                    "type": "bind",
                    "source": self.home.to_string_lossy(),
                    "options": ["rbind", "rw"]
                }
            ],
            "linux": {
                "namespaces": [
                    { "type": "pid" },
                    { "type": "mount" },
                    { "type": "ipc" },
                    { "type": "uts" },
                    { "type": "network" }
                ],
                "resources": self.limits.oci_resources()
            }
        })
    }

    /// Write `config.json` into `dir`, creating it when missing.
    pub fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("config.json");
        let body = serde_json::to_vec_pretty(&self.spec()).map_err(io::Error::other)?;
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bundle(home: &Path) -> OciBundle {
        OciBundle {
            hostname: "keel-1234".to_string(),
            args: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            home: home.to_path_buf(),
            uid: 1000,
            gid: 1000,
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_spec_isolates_network_and_binds_home() {
        let dir = tempdir().unwrap();
        let spec = bundle(dir.path()).spec();

        let namespaces = spec["linux"]["namespaces"].as_array().unwrap();
        assert!(namespaces.iter().any(|n| n["type"] == "network"));

        let mounts = spec["mounts"].as_array().unwrap();
        let home = mounts
            .iter()
            .find(|m| m["destination"] == CONTAINER_HOME)
            .unwrap();
        assert_eq!(home["source"], dir.path().to_string_lossy().as_ref());

        assert_eq!(spec["process"]["env"][0], "PATH=/usr/bin:/bin");
        assert_eq!(spec["process"]["args"][2], "echo hi");
        assert_eq!(spec["root"]["readonly"], true);
    }

    #[test]
    fn test_write_creates_config_json() {
        let home = tempdir().unwrap();
        let bundle_dir = tempdir().unwrap();
        let path = bundle(home.path())
            .write(&bundle_dir.path().join("nested"))
            .unwrap();
        assert!(path.ends_with("nested/config.json"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["ociVersion"], OCI_VERSION);
        assert_eq!(parsed["hostname"], "keel-1234");
    }
}
