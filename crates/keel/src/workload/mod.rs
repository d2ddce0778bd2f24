//! Workload registry and lifecycle.

mod controller;
mod error;
mod model;
mod store;
pub mod template;

pub use controller::{ControllerConfig, WorkloadController};
pub use error::{ControllerError, ControllerResult};
pub use model::{WorkloadMeta, WorkloadSpec};
pub use store::WorkloadStore;
