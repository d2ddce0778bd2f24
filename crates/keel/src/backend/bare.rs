//! Bare-process backend: no namespaces, just a scrubbed environment, an
//! optional unprivileged identity and `prlimit`.

use async_trait::async_trait;
use keel_protocol::{BackendKind, WorkloadStats};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::{BackendError, BackendResult};
use super::process::{GroupSampler, signal_group, spawn_attached};
use super::{IsolationBackend, Launch, LaunchSpec, NativeHandle, StopSignal, Target};

/// PATH given to bare processes after the environment is cleared.
const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// uid to drop to. Only applied when the agent runs as root.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// `prlimit` binary used to apply limits after spawn.
    pub prlimit_binary: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            prlimit_binary: "prlimit".to_string(),
        }
    }
}

pub struct BareProcessBackend {
    config: ProcessConfig,
    sampler: GroupSampler,
}

impl BareProcessBackend {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            sampler: GroupSampler::new(),
        }
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let target = &spec.target;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&target.home)
            .env_clear()
            .env("PATH", BASE_PATH)
            .env("HOME", &target.home)
            .env("LANG", "C.UTF-8")
            .envs(target.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .process_group(0);

        // SAFETY: geteuid has no preconditions.
        let is_root = unsafe { libc::geteuid() } == 0;
        if is_root {
            if let Some(gid) = self.config.gid {
                command.gid(gid);
            }
            if let Some(uid) = self.config.uid {
                command.uid(uid);
            }
        } else if self.config.uid.is_some() || self.config.gid.is_some() {
            debug!("Not running as root, ignoring configured uid/gid");
        }

        command
    }

    /// Best-effort `prlimit` on the freshly spawned process.
    async fn apply_limits(&self, target: &Target, pid: u32) {
        let Some(args) = target.limits.prlimit_args(pid) else {
            return;
        };

        match Command::new(&self.config.prlimit_binary)
            .args(&args)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                debug!("Applied prlimit to pid {}", pid);
            }
            Ok(output) => {
                warn!(
                    "prlimit for pid {} failed: {}",
                    pid,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                warn!("prlimit unavailable ({}), limits not applied to pid {}", e, pid);
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for BareProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BareProcess
    }

    async fn prepare(&self, target: &Target) -> BackendResult<()> {
        tokio::fs::create_dir_all(&target.home).await?;
        Ok(())
    }

    async fn launch(&self, spec: LaunchSpec) -> BackendResult<Launch> {
        let command = self.command(&spec);
        let attached = spawn_attached(command, spec.output.clone())
            .map_err(|e| BackendError::command(&spec.program, e.to_string()))?;

        let pid = attached.pid.ok_or(BackendError::NotRunning)?;
        info!("Started workload {} as pid {}", spec.target.id, pid);
        self.apply_limits(&spec.target, pid).await;

        Ok(Launch {
            native_id: pid.to_string(),
            pid: Some(pid),
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
        let pid = handle.pid.ok_or(BackendError::NotRunning)?;
        signal_group(pid, signal)
    }

    async fn destroy(&self, _target: &Target) -> BackendResult<()> {
        Ok(())
    }

    async fn stats(&self, target: &Target, handle: &NativeHandle) -> BackendResult<WorkloadStats> {
        let pid = handle.pid.ok_or(BackendError::NotRunning)?;
        let mut stats = self.sampler.sample(pid, false);
        stats.memory_limit_bytes = target.limits.memory_bytes();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, OutputSink, WorkloadEvent};
    use keel_protocol::OutputStream;
    use keel_sandbox::ResourceLimits;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn target(home: &std::path::Path) -> Target {
        Target {
            id: Uuid::new_v4(),
            home: home.to_path_buf(),
            image: None,
            limits: ResourceLimits::default(),
            env: vec![("GREETING".to_string(), "hi".to_string())],
            ports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_launch_runs_in_home_with_clean_env() {
        let dir = TempDir::new().unwrap();
        let backend = BareProcessBackend::new(ProcessConfig::default());
        let hub = Arc::new(EventHub::new());
        let target = target(dir.path());
        let mut sub = hub.subscribe(target.id);

        std::fs::write(dir.path().join("marker"), "x").unwrap();
        // SAFETY: test-only env mutation before spawning.
        unsafe { std::env::set_var("KEEL_TEST_LEAK", "leaked") };

        let launch = backend
            .launch(LaunchSpec {
                output: OutputSink::new(hub.clone(), target.id),
                target: target.clone(),
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "ls; echo $GREETING; echo ${KEEL_TEST_LEAK:-clean}".to_string(),
                ],
            })
            .await
            .unwrap();

        assert_eq!(launch.native_id, launch.pid.unwrap().to_string());
        assert_eq!(launch.exit.await, 0);

        let mut lines = Vec::new();
        while let Ok(WorkloadEvent::Output { stream, line }) = sub.events.try_recv() {
            assert_eq!(stream, OutputStream::Stdout);
            lines.push(line);
        }
        assert_eq!(lines, vec!["marker", "hi", "clean"]);
    }

    #[tokio::test]
    async fn test_signal_without_pid_is_not_running() {
        let backend = BareProcessBackend::new(ProcessConfig::default());
        let dir = TempDir::new().unwrap();
        let handle = NativeHandle {
            native_id: String::new(),
            pid: None,
        };
        let err = backend
            .signal(&target(dir.path()), &handle, StopSignal::Interrupt)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotRunning));
    }

    #[tokio::test]
    async fn test_missing_prlimit_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let backend = BareProcessBackend::new(ProcessConfig {
            prlimit_binary: "/nonexistent/prlimit".to_string(),
            ..Default::default()
        });
        let hub = Arc::new(EventHub::new());
        let target = target(dir.path());
        let launch = backend
            .launch(LaunchSpec {
                output: OutputSink::new(hub, target.id),
                target,
                program: "true".to_string(),
                args: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(launch.exit.await, 0);
    }
}
