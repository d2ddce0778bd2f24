//! Per-workload console WebSocket messages.

use serde::{Deserialize, Serialize};

use crate::stats::WorkloadStats;
use crate::status::{OutputStream, WorkloadStatus};

/// Messages sent from the agent to a console client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One line of process output.
    Output { stream: OutputStream, data: String },
    /// Periodic usage sample.
    Stats { stats: WorkloadStats },
    /// Status transition.
    Status { status: WorkloadStatus },
    /// The process exited.
    Exit { code: i32 },
    /// A client command failed. The socket stays open.
    Error { message: String },
}

/// Messages a console client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Write to the workload's standard input.
    Input { data: String },
    /// Start the workload with its configured startup command.
    Start,
    /// Graceful stop.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    /// Immediate kill.
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parse() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"input","data":"say hi\n"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                data: "say hi\n".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Stop { timeout: None });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"kill"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Kill);
    }

    #[test]
    fn test_server_message_shape() {
        let msg = ServerMessage::Output {
            stream: OutputStream::Stderr,
            data: "boom".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["stream"], "stderr");
        assert_eq!(value["data"], "boom");

        let value = serde_json::to_value(ServerMessage::Exit { code: 3 }).unwrap();
        assert_eq!(value["type"], "exit");
        assert_eq!(value["code"], 3);
    }
}
