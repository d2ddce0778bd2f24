//! Workload status and backend identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workload as tracked by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    /// Directory and metadata exist, never started.
    #[default]
    Created,
    /// A start is in progress; no other start may begin.
    Starting,
    /// A live handle exists.
    Running,
    /// A stop has been requested and the exit is pending.
    Stopping,
    /// Exited cleanly or was stopped on request.
    Stopped,
    /// Exited with a non-zero code or failed to launch.
    Failed,
}

impl WorkloadStatus {
    /// Whether the workload holds (or is acquiring) a live handle.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether a start may be attempted from this status.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse power state reported to the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Offline,
    Starting,
    Stopping,
}

impl PowerState {
    /// Map a native state string into a power state.
    ///
    /// Accepts both container engine states (`created`, `restarting`,
    /// `exited`, ...) and the agent's own status names. Anything not
    /// recognised is reported as offline.
    pub fn from_native(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" | "online" => Self::Running,
            "starting" | "restarting" | "installing" => Self::Starting,
            "stopping" | "removing" => Self::Stopping,
            _ => Self::Offline,
        }
    }
}

impl From<WorkloadStatus> for PowerState {
    fn from(status: WorkloadStatus) -> Self {
        match status {
            WorkloadStatus::Running => Self::Running,
            WorkloadStatus::Starting => Self::Starting,
            WorkloadStatus::Stopping => Self::Stopping,
            WorkloadStatus::Created | WorkloadStatus::Stopped | WorkloadStatus::Failed => {
                Self::Offline
            }
        }
    }
}

/// Isolation mechanism a workload runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ContainerEngine,
    SandboxRuntime,
    NamespaceJail,
    BareProcess,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContainerEngine => "container-engine",
            Self::SandboxRuntime => "sandbox-runtime",
            Self::NamespaceJail => "namespace-jail",
            Self::BareProcess => "bare-process",
        }
    }

    /// Next weaker isolation to fall back to when tooling is missing.
    ///
    /// The container engine never downgrades.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::SandboxRuntime => Some(Self::NamespaceJail),
            Self::NamespaceJail => Some(Self::BareProcess),
            Self::ContainerEngine | Self::BareProcess => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container-engine" | "container" | "docker" | "podman" => Ok(Self::ContainerEngine),
            "sandbox-runtime" | "sandbox" | "gvisor" | "runsc" => Ok(Self::SandboxRuntime),
            "namespace-jail" | "jail" | "bwrap" | "bubblewrap" => Ok(Self::NamespaceJail),
            "bare-process" | "process" | "none" => Ok(Self::BareProcess),
            other => Err(format!("unknown isolation mode: {other}")),
        }
    }
}

/// Which stream an output line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_from_engine_states() {
        assert_eq!(PowerState::from_native("running"), PowerState::Running);
        assert_eq!(PowerState::from_native("restarting"), PowerState::Starting);
        assert_eq!(PowerState::from_native("removing"), PowerState::Stopping);
        assert_eq!(PowerState::from_native("exited"), PowerState::Offline);
        assert_eq!(PowerState::from_native("dead"), PowerState::Offline);
        assert_eq!(PowerState::from_native("created"), PowerState::Offline);
        assert_eq!(PowerState::from_native("paused"), PowerState::Offline);
    }

    #[test]
    fn test_power_state_unknown_is_offline() {
        assert_eq!(PowerState::from_native(""), PowerState::Offline);
        assert_eq!(PowerState::from_native("banana"), PowerState::Offline);
        assert_eq!(PowerState::from_native("  RUNNING "), PowerState::Running);
    }

    #[test]
    fn test_power_state_total_over_workload_status() {
        let all = [
            WorkloadStatus::Created,
            WorkloadStatus::Starting,
            WorkloadStatus::Running,
            WorkloadStatus::Stopping,
            WorkloadStatus::Stopped,
            WorkloadStatus::Failed,
        ];
        for status in all {
            let via_enum = PowerState::from(status);
            let via_name = PowerState::from_native(status.as_str());
            assert_eq!(via_enum, via_name, "mismatch for {status}");
        }
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(
            "bwrap".parse::<BackendKind>().unwrap(),
            BackendKind::NamespaceJail
        );
        assert_eq!(
            "Container-Engine".parse::<BackendKind>().unwrap(),
            BackendKind::ContainerEngine
        );
        assert!("vm".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_fallback_chain() {
        assert_eq!(
            BackendKind::SandboxRuntime.fallback(),
            Some(BackendKind::NamespaceJail)
        );
        assert_eq!(
            BackendKind::NamespaceJail.fallback(),
            Some(BackendKind::BareProcess)
        );
        assert_eq!(BackendKind::BareProcess.fallback(), None);
        assert_eq!(BackendKind::ContainerEngine.fallback(), None);
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&WorkloadStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
        let kind: BackendKind = serde_json::from_str("\"sandbox-runtime\"").unwrap();
        assert_eq!(kind, BackendKind::SandboxRuntime);
    }
}
