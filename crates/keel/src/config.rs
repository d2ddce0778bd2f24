//! Agent configuration.
//!
//! Loaded by the binary through the `config` crate: built-in defaults, then
//! the TOML file, then `KEEL__SECTION__KEY` environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use keel_protocol::BackendKind;
use keel_sandbox::{JailConfig, ResourceLimits};
use serde::{Deserialize, Serialize};

use crate::backend::{EngineConfig, ProcessConfig, RuntimeConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub isolation: IsolationConfig,
    /// Limits applied when a create request carries none.
    pub limits: ResourceLimits,
    pub monitor: MonitorConfig,
    pub panel: PanelConfig,
    pub files: FilesConfig,
    pub transfer: TransferConfig,
    pub api: ApiConfig,
}

impl AgentConfig {
    /// Reject settings that deserialize fine but cannot be honoured.
    pub fn validate(&self) -> Result<()> {
        if self.panel.max_attempts == 0 {
            bail!("panel.max_attempts must be at least 1");
        }
        if self.panel.reconnect_base_secs == 0 {
            bail!("panel.reconnect_base_secs must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the HTTP API. Empty disables authentication.
    pub auth_token: String,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            auth_token: String::new(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for workloads, backups, bundles and transfers. Supports `~` and
    /// environment variables.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub mode: BackendKind,
    /// cgroup v2 directory under which namespace-jail workloads are placed.
    pub cgroup_parent: PathBuf,
    pub engine: EngineConfig,
    pub runtime: RuntimeConfig,
    pub jail: JailConfig,
    pub process: ProcessConfig,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: BackendKind::SandboxRuntime,
            cgroup_parent: PathBuf::from("/sys/fs/cgroup/keel"),
            engine: EngineConfig::default(),
            runtime: RuntimeConfig::default(),
            jail: JailConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// WebSocket URL of the panel. The control channel is off when unset.
    pub url: Option<String>,
    pub token: String,
    /// Identifier reported on auth. Defaults to the host name.
    pub node_id: Option<String>,
    pub heartbeat_secs: u64,
    pub stats_secs: u64,
    pub auth_timeout_secs: u64,
    pub reconnect_base_secs: u64,
    /// Consecutive failures before giving up. Must be at least 1.
    pub max_attempts: u32,
    /// Relay workload output lines upstream.
    pub relay_output: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: String::new(),
            node_id: None,
            heartbeat_secs: 30,
            stats_secs: 10,
            auth_timeout_secs: 10,
            reconnect_base_secs: 5,
            max_attempts: 10,
            relay_output: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_read_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_read_bytes: keel_files::DEFAULT_MAX_READ_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Timeout for the small control requests to the target.
    pub request_timeout_secs: u64,
    /// Timeout for the archive upload.
    pub upload_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            upload_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Minimum spacing between two create requests.
    pub create_interval_ms: u64,
    /// Grace period between interrupt and kill on stop.
    pub stop_timeout_secs: u64,
    /// Request body cap for every route except transfer receive.
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            create_interval_ms: 500,
            stop_timeout_secs: 10,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}
