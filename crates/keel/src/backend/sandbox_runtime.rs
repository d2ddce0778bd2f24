//! gVisor (`runsc`) backend.
//!
//! Each launch writes a fresh OCI bundle under `<data_dir>/bundles/<uuid>`
//! and runs `runsc run` attached, so stdio and the exit status come straight
//! from the runtime process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use keel_protocol::{BackendKind, WorkloadStats};
use keel_sandbox::OciBundle;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use super::error::{BackendError, BackendResult};
use super::process::{GroupSampler, signal_group, spawn_attached};
use super::{IsolationBackend, Launch, LaunchSpec, NativeHandle, StopSignal, Target};

/// PATH inside the sandbox.
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// runsc binary name or path.
    pub binary: String,
    /// Global flags placed before every subcommand.
    pub global_args: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "runsc".to_string(),
            global_args: vec!["--rootless".to_string(), "--network=none".to_string()],
            uid: 1000,
            gid: 1000,
        }
    }
}

pub struct SandboxRuntimeBackend {
    config: RuntimeConfig,
    bundle_root: PathBuf,
    sampler: GroupSampler,
    /// Runtime id -> (cpu nanoseconds, sampled at)
    cpu_previous: Mutex<HashMap<String, (u64, Instant)>>,
}

impl SandboxRuntimeBackend {
    pub fn new(config: RuntimeConfig, bundle_root: PathBuf) -> Self {
        Self {
            config,
            bundle_root,
            sampler: GroupSampler::new(),
            cpu_previous: Mutex::new(HashMap::new()),
        }
    }

    fn bundle_dir(&self, target: &Target) -> PathBuf {
        self.bundle_root.join(target.id.to_string())
    }

    fn bundle(&self, spec: &LaunchSpec) -> OciBundle {
        let target = &spec.target;
        let mut env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), keel_sandbox::CONTAINER_HOME.to_string()),
        ];
        env.extend(target.env.iter().cloned());

        let mut args = Vec::with_capacity(spec.args.len() + 1);
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());

        OciBundle {
            hostname: target.engine_name(),
            args,
            env,
            home: target.home.clone(),
            uid: self.config.uid,
            gid: self.config.gid,
            limits: target.limits.clone(),
        }
    }

    fn runsc(&self) -> Command {
        let mut command = Command::new(&self.config.binary);
        command.args(&self.config.global_args);
        command
    }

    /// Run a runsc subcommand to completion and return its stdout.
    async fn run(&self, args: &[&str]) -> BackendResult<String> {
        let subcommand = args.first().copied().unwrap_or_default();
        let output = self
            .runsc()
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::command(format!("runsc {subcommand}"), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::command(
                format!("runsc {subcommand}"),
                stderr.trim(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn cpu_percent(&self, id: &str, total_ns: u64) -> f64 {
        let now = Instant::now();
        let Ok(mut previous) = self.cpu_previous.lock() else {
            return 0.0;
        };
        let percent = previous
            .get(id)
            .map(|(prev_ns, at)| {
                let elapsed = now.duration_since(*at).as_nanos() as f64;
                if elapsed > 0.0 {
                    total_ns.saturating_sub(*prev_ns) as f64 / elapsed * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);
        previous.insert(id.to_string(), (total_ns, now));
        percent
    }
}

/// Usage reported by `runsc events --stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RuntimeUsage {
    pub cpu_ns: u64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: u64,
}

/// Parse the JSON line printed by `runsc events --stats <id>`.
pub(crate) fn parse_events_stats(output: &str) -> Option<RuntimeUsage> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let value: Value = serde_json::from_str(line).ok()?;
    let data = value.get("data")?;
    let number = |pointer: &str| data.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);

    Some(RuntimeUsage {
        cpu_ns: number("/cpu/usage/total"),
        memory_bytes: number("/memory/usage/usage"),
        memory_limit_bytes: number("/memory/usage/limit"),
        pids: number("/pids/current"),
    })
}

#[async_trait]
impl IsolationBackend for SandboxRuntimeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SandboxRuntime
    }

    async fn prepare(&self, target: &Target) -> BackendResult<()> {
        tokio::fs::create_dir_all(&target.home).await?;
        tokio::fs::create_dir_all(self.bundle_dir(target)).await?;
        Ok(())
    }

    async fn launch(&self, spec: LaunchSpec) -> BackendResult<Launch> {
        let id = spec.target.runtime_id();
        let dir = self.bundle_dir(&spec.target);

        // A previous run may have left the container registered.
        if let Err(e) = self.run(&["delete", "--force", id.as_str()]).await {
            debug!("No stale sandbox to delete for {}: {}", id, e);
        }

        let bundle = self.bundle(&spec);
        let config_path = tokio::task::spawn_blocking(move || bundle.write(&dir))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e)))??;
        debug!("Wrote OCI bundle {:?}", config_path);

        let bundle_dir = self.bundle_dir(&spec.target);
        let mut command = self.runsc();
        command
            .arg("run")
            .arg("--bundle")
            .arg(&bundle_dir)
            .arg(&id)
            .process_group(0);

        let attached = spawn_attached(command, spec.output.clone())
            .map_err(|e| BackendError::command("runsc run", e.to_string()))?;
        info!("Started sandboxed workload {} as {}", spec.target.id, id);

        Ok(Launch {
            native_id: id,
            pid: attached.pid,
            input: attached.stdin,
            exit: attached.exit,
        })
    }

    async fn signal(
        &self,
        _target: &Target,
        handle: &NativeHandle,
        signal: StopSignal,
    ) -> BackendResult<()> {
        let name = match signal {
            StopSignal::Interrupt => "INT",
            StopSignal::Kill => "KILL",
        };
        match self.run(&["kill", handle.native_id.as_str(), name]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("runsc kill {} failed: {}", handle.native_id, e);
                let pid = handle.pid.ok_or(e)?;
                signal_group(pid, signal)
            }
        }
    }

    async fn destroy(&self, target: &Target) -> BackendResult<()> {
        let id = target.runtime_id();
        if let Err(e) = self.run(&["delete", "--force", id.as_str()]).await {
            debug!("runsc delete {}: {}", id, e);
        }
        if let Ok(mut previous) = self.cpu_previous.lock() {
            previous.remove(&id);
        }
        match tokio::fs::remove_dir_all(self.bundle_dir(target)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stats(&self, target: &Target, handle: &NativeHandle) -> BackendResult<WorkloadStats> {
        let usage = match self.run(&["events", "--stats", handle.native_id.as_str()]).await {
            Ok(out) => parse_events_stats(&out),
            Err(e) => {
                debug!("runsc events failed for {}: {}", handle.native_id, e);
                None
            }
        };

        let Some(usage) = usage else {
            let pid = handle.pid.ok_or(BackendError::NotRunning)?;
            let mut stats = self.sampler.sample(pid, true);
            stats.memory_limit_bytes = target.limits.memory_bytes();
            return Ok(stats);
        };

        Ok(WorkloadStats {
            cpu_percent: self.cpu_percent(&handle.native_id, usage.cpu_ns),
            memory_bytes: usage.memory_bytes,
            memory_limit_bytes: if usage.memory_limit_bytes > 0 {
                usage.memory_limit_bytes
            } else {
                target.limits.memory_bytes()
            },
            pids: usage.pids,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, OutputSink};
    use keel_sandbox::ResourceLimits;
    use std::sync::Arc;
    use uuid::Uuid;

    fn target() -> Target {
        Target {
            id: Uuid::new_v4(),
            home: PathBuf::from("/srv/keel/w/home"),
            image: None,
            limits: ResourceLimits {
                memory_mb: 128,
                ..Default::default()
            },
            env: vec![("SERVER_MEMORY".to_string(), "128".to_string())],
            ports: Vec::new(),
        }
    }

    #[test]
    fn test_bundle_carries_command_env_and_limits() {
        let backend = SandboxRuntimeBackend::new(RuntimeConfig::default(), PathBuf::from("/tmp/b"));
        let target = target();
        let spec = LaunchSpec {
            output: OutputSink::new(Arc::new(EventHub::new()), target.id),
            target: target.clone(),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo hi".to_string()],
        };

        let doc = backend.bundle(&spec).spec();
        assert_eq!(doc["process"]["args"][0], "/bin/sh");
        assert_eq!(doc["process"]["args"][2], "echo hi");
        let env: Vec<String> = serde_json::from_value(doc["process"]["env"].clone()).unwrap();
        assert!(env.contains(&"SERVER_MEMORY=128".to_string()));
        assert!(env.contains(&"HOME=/home/container".to_string()));
        assert_eq!(
            doc["linux"]["resources"]["memory"]["limit"],
            128 * 1024 * 1024
        );
        assert_eq!(doc["hostname"], target.engine_name());
    }

    #[test]
    fn test_bundle_dir_per_workload() {
        let backend = SandboxRuntimeBackend::new(RuntimeConfig::default(), PathBuf::from("/data/bundles"));
        let target = target();
        assert_eq!(
            backend.bundle_dir(&target),
            PathBuf::from(format!("/data/bundles/{}", target.id))
        );
    }

    #[test]
    fn test_parse_events_stats() {
        let out = r#"{"type":"stats","id":"keel-x","data":{"cpu":{"usage":{"total":1500000000}},"memory":{"usage":{"usage":73400320,"limit":134217728}},"pids":{"current":12}}}"#;
        let usage = parse_events_stats(out).unwrap();
        assert_eq!(usage.cpu_ns, 1_500_000_000);
        assert_eq!(usage.memory_bytes, 73_400_320);
        assert_eq!(usage.memory_limit_bytes, 134_217_728);
        assert_eq!(usage.pids, 12);
    }

    #[test]
    fn test_parse_events_stats_rejects_garbage() {
        assert!(parse_events_stats("").is_none());
        assert!(parse_events_stats("not json").is_none());
        assert!(parse_events_stats(r#"{"type":"stats"}"#).is_none());
    }

    #[tokio::test]
    async fn test_destroy_missing_bundle_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = SandboxRuntimeBackend::new(
            RuntimeConfig {
                binary: "/nonexistent/runsc".to_string(),
                ..Default::default()
            },
            dir.path().to_path_buf(),
        );
        backend.destroy(&target()).await.unwrap();
    }
}
