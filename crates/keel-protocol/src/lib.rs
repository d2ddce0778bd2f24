//! Wire types for keel agent communication.
//!
//! This crate defines every message that crosses a process boundary:
//!
//! ```text
//! Panel <--[control channel: AgentMessage / PanelMessage]--> keel agent
//!                                                               |
//! Browser console <--[WS: ServerMessage / ClientMessage]--------+
//! ```
//!
//! The types are plain serde structures so that both the agent and any tooling
//! talking to it can share them without pulling in the runtime.

pub mod panel;
pub mod stats;
pub mod status;
pub mod ws;

pub use panel::{AgentMessage, PanelMessage, PowerAction, WorkloadSample};
pub use stats::{HostStats, WorkloadStats};
pub use status::{BackendKind, OutputStream, PowerState, WorkloadStatus};
pub use ws::{ClientMessage, ServerMessage};
