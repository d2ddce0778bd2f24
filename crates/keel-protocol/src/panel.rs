//! Control channel messages exchanged with the panel.
//!
//! Both directions are JSON text frames tagged by a `type` field. Panel
//! commands carry an optional `request_id` that is echoed back in the
//! matching [`AgentMessage::Result`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::stats::{HostStats, WorkloadStats};
use crate::status::{OutputStream, PowerState, WorkloadStatus};

// ============================================================================
// Agent -> panel
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    // -- Session --
    /// First frame after connecting.
    Auth {
        token: String,
        node_id: String,
        version: String,
    },

    /// Liveness signal sent on a fixed interval.
    Heartbeat { uptime_secs: u64, workloads: usize },

    // -- Telemetry --
    /// Host usage plus a sample for every running workload.
    Stats {
        host: HostStats,
        workloads: Vec<WorkloadSample>,
    },

    /// A workload changed status.
    Status {
        workload_id: Uuid,
        status: WorkloadStatus,
        power: PowerState,
    },

    /// One line of workload output.
    Output {
        workload_id: Uuid,
        stream: OutputStream,
        data: String,
    },

    /// A workload process exited.
    Exit { workload_id: Uuid, code: i32 },

    // -- Replies --
    /// Outcome of a panel command.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Per-workload entry of a stats report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSample {
    pub workload_id: Uuid,
    pub stats: WorkloadStats,
}

// ============================================================================
// Panel -> agent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PanelMessage {
    // -- Session --
    AuthOk,
    AuthError { message: String },

    // -- Commands --
    /// Change the power state of a workload.
    Power {
        #[serde(default)]
        request_id: Option<String>,
        workload_id: Uuid,
        action: PowerAction,
    },

    /// Write a console command to the workload's input.
    Command {
        #[serde(default)]
        request_id: Option<String>,
        workload_id: Uuid,
        command: String,
    },

    /// Run the workload's install script.
    Install {
        #[serde(default)]
        request_id: Option<String>,
        workload_id: Uuid,
    },

    /// Create a workload. The spec is validated by the agent.
    Create {
        #[serde(default)]
        request_id: Option<String>,
        workload_id: Uuid,
        spec: Value,
    },

    /// Delete a workload and all of its files.
    Delete {
        #[serde(default)]
        request_id: Option<String>,
        workload_id: Uuid,
    },
}

impl PanelMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Power { request_id, .. }
            | Self::Command { request_id, .. }
            | Self::Install { request_id, .. }
            | Self::Create { request_id, .. }
            | Self::Delete { request_id, .. } => request_id.as_deref(),
            Self::AuthOk | Self::AuthError { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_command() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"power","request_id":"r1","workload_id":"{id}","action":"restart"}}"#
        );
        let msg: PanelMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.request_id(), Some("r1"));
        assert_eq!(
            msg,
            PanelMessage::Power {
                request_id: Some("r1".to_string()),
                workload_id: id,
                action: PowerAction::Restart,
            }
        );
    }

    #[test]
    fn test_parse_create_keeps_spec_opaque() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"create","workload_id":"{id}","spec":{{"memory":"1GB","anything":[1,2]}}}}"#
        );
        let msg: PanelMessage = serde_json::from_str(&raw).unwrap();
        match msg {
            PanelMessage::Create { spec, request_id, .. } => {
                assert!(request_id.is_none());
                assert_eq!(spec["memory"], "1GB");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_result_omits_empty_fields() {
        let msg = AgentMessage::Result {
            request_id: None,
            ok: true,
            error: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, serde_json::json!({"type": "result", "ok": true}));
    }
}
