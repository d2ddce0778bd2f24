//! Resource usage snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Host-wide usage sampled by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    /// Average busy percentage across logical cores.
    pub cpu_percent: f64,
    pub cpu_cores: usize,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_available_bytes: u64,
    /// Usage of the filesystem mounted at `/`.
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    /// Primary network interface, empty when none was found.
    pub net_interface: String,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Usage of a single workload.
///
/// All fields are zero when the backend could not be queried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub pids: u64,
}
