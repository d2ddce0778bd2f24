//! Isolation backends.
//!
//! A backend turns a resolved launch request into a running, attached
//! process inside one kind of isolation:
//!
//! - [`EngineBackend`]: docker/podman CLI
//! - [`SandboxRuntimeBackend`]: gVisor `runsc` with a generated OCI bundle
//! - [`JailBackend`]: bubblewrap namespaces plus cgroup v2 limits
//! - [`BareProcessBackend`]: plain child process with `prlimit`
//!
//! Exactly one backend is active per agent. [`select_backend`] picks it from
//! the configuration and walks the downgrade chain when tools are missing.

mod bare;
mod engine;
mod error;
mod jail;
pub(crate) mod process;
mod sandbox_runtime;

pub use bare::{BareProcessBackend, ProcessConfig};
pub use engine::{EngineBackend, EngineConfig, EngineKind};
pub use error::{BackendError, BackendResult};
pub use jail::JailBackend;
pub use sandbox_runtime::{RuntimeConfig, SandboxRuntimeBackend};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use keel_protocol::{BackendKind, WorkloadStats};
use keel_sandbox::ResourceLimits;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::ChildStdin;
use uuid::Uuid;

use crate::config::IsolationConfig;
use crate::events::OutputSink;

/// A published port: host side to workload side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// What a backend needs to know about a workload.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: Uuid,
    /// Host directory mounted as the workload home.
    pub home: PathBuf,
    pub image: Option<String>,
    pub limits: ResourceLimits,
    /// Fully rendered environment, `STARTUP` and built-ins included.
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
}

impl Target {
    /// Engine object name: `keel-` plus the first 8 hex chars of the id.
    pub fn engine_name(&self) -> String {
        let simple = self.id.simple().to_string();
        format!("keel-{}", &simple[..8])
    }

    /// Sandbox runtime container id.
    pub fn runtime_id(&self) -> String {
        format!("keel-{}", self.id)
    }
}

/// A resolved command to run for a target.
pub struct LaunchSpec {
    pub target: Target,
    pub program: String,
    pub args: Vec<String>,
    pub output: OutputSink,
}

/// A started workload process.
pub struct Launch {
    /// Engine name, runtime id or pid rendered as a string.
    pub native_id: String,
    pub pid: Option<u32>,
    pub input: Option<ChildStdin>,
    /// Resolves with the exit code once the process is gone and its output
    /// has been drained.
    pub exit: BoxFuture<'static, i32>,
}

/// Identifies a live process for signalling and stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeHandle {
    pub native_id: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Kill,
}

impl StopSignal {
    pub fn as_libc(self) -> libc::c_int {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Kill => libc::SIGKILL,
        }
    }

    /// Signal name as accepted by engine and runtime CLIs.
    pub fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Contract shared by every isolation mechanism.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create any backend-side object before the first start.
    async fn prepare(&self, target: &Target) -> BackendResult<()>;

    /// Start the command and attach to its I/O.
    async fn launch(&self, spec: LaunchSpec) -> BackendResult<Launch>;

    async fn signal(
        &self,
        target: &Target,
        handle: &NativeHandle,
        signal: StopSignal,
    ) -> BackendResult<()>;

    /// Remove backend-side objects. Must succeed when nothing exists.
    async fn destroy(&self, target: &Target) -> BackendResult<()>;

    async fn stats(&self, target: &Target, handle: &NativeHandle) -> BackendResult<WorkloadStats>;
}

/// Build the configured backend, downgrading when its tool is missing.
///
/// The container engine never downgrades; a missing engine binary is only
/// logged and later operations fail with [`BackendError`].
pub fn select_backend(config: &IsolationConfig, data_dir: &Path) -> Arc<dyn IsolationBackend> {
    select_with(config, data_dir, keel_sandbox::binary_available)
}

fn select_with(
    config: &IsolationConfig,
    data_dir: &Path,
    available: impl Fn(&str) -> bool,
) -> Arc<dyn IsolationBackend> {
    let requested = config.mode;
    let mut kind = requested;

    loop {
        let binary = match kind {
            BackendKind::ContainerEngine => {
                let binary = config.engine.binary();
                if !available(binary) {
                    warn!(
                        "Container engine '{}' not found; workload operations will fail",
                        binary
                    );
                }
                break;
            }
            BackendKind::SandboxRuntime => config.runtime.binary.as_str(),
            BackendKind::NamespaceJail => config.jail.binary.as_str(),
            BackendKind::BareProcess => break,
        };

        if available(binary) {
            break;
        }

        match kind.fallback() {
            Some(next) => {
                warn!("{} unavailable ('{}' not found), trying {}", kind, binary, next);
                kind = next;
            }
            None => break,
        }
    }

    if kind != requested {
        info!("Isolation mode downgraded from {} to {}", requested, kind);
    } else {
        info!("Isolation mode: {}", kind);
    }

    match kind {
        BackendKind::ContainerEngine => Arc::new(EngineBackend::new(config.engine.clone())),
        BackendKind::SandboxRuntime => Arc::new(SandboxRuntimeBackend::new(
            config.runtime.clone(),
            data_dir.join("bundles"),
        )),
        BackendKind::NamespaceJail => Arc::new(JailBackend::new(
            config.jail.clone(),
            &config.cgroup_parent,
        )),
        BackendKind::BareProcess => Arc::new(BareProcessBackend::new(config.process.clone())),
    }
}
