//! Isolation building blocks for the keel agent.
//!
//! Everything in this crate is synchronous and side-effect free except the
//! cgroup writer: it turns declared resource limits and workload settings into
//! the arguments, files and documents each isolation tool expects.
//!
//! - [`limits`]: declared limits, memory-string parsing, per-backend translation
//! - [`jail`]: bubblewrap argument construction
//! - [`oci`]: OCI runtime bundle spec for the sandbox runtime
//! - [`cgroup`]: best-effort cgroup v2 limit application

pub mod cgroup;
pub mod jail;
pub mod limits;
pub mod oci;

pub use cgroup::CgroupLimiter;
pub use jail::JailConfig;
pub use limits::{LimitError, ResourceLimits, parse_memory};
pub use oci::OciBundle;

/// Mount point of the workload home inside every isolated environment.
pub const CONTAINER_HOME: &str = "/home/container";

/// Check whether a binary can be executed with `--version`.
pub fn binary_available(binary: &str) -> bool {
    std::process::Command::new(binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
