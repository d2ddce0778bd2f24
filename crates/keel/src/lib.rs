//! keel node agent.
//!
//! Runs tenant workloads under a configurable isolation backend, exposes them
//! over an authenticated HTTP and WebSocket API, and optionally keeps a control
//! channel to a central panel.

pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod monitor;
pub mod panel;
pub mod transfer;
pub mod workload;
