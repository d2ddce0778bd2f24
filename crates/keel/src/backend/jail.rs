//! Namespace-jail backend built on bubblewrap.

use std::path::Path;

use async_trait::async_trait;
use keel_protocol::{BackendKind, WorkloadStats};
use keel_sandbox::{CgroupLimiter, JailConfig};
use log::{debug, info, warn};
use tokio::process::Command;

use super::error::{BackendError, BackendResult};
use super::process::{GroupSampler, signal_tree, spawn_attached};
use super::{IsolationBackend, Launch, LaunchSpec, NativeHandle, StopSignal, Target};

pub struct JailBackend {
    config: JailConfig,
    cgroups: CgroupLimiter,
    sampler: GroupSampler,
}

impl JailBackend {
    pub fn new(config: JailConfig, cgroup_parent: &Path) -> Self {
        Self {
            config,
            cgroups: CgroupLimiter::new(cgroup_parent),
            sampler: GroupSampler::new(),
        }
    }

    fn cgroup_name(target: &Target) -> String {
        format!("keel-{}", target.id)
    }

    /// Command name bwrap shows up with in `/proc/<pid>/stat`.
    fn wrapper_comm(&self) -> String {
        let name = Path::new(&self.config.binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.config.binary.clone());
        // The kernel truncates comm to 15 bytes.
        name.chars().take(15).collect()
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&self.config.binary);
        command
            .args(self.config.build_args(&spec.target.home, &spec.target.env))
            .arg(&spec.program)
            .args(&spec.args)
            .process_group(0);
        command
    }
}

#[async_trait]
impl IsolationBackend for JailBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NamespaceJail
    }

    async fn prepare(&self, target: &Target) -> BackendResult<()> {
        tokio::fs::create_dir_all(&target.home).await?;
        Ok(())
    }

    async fn launch(&self, spec: LaunchSpec) -> BackendResult<Launch> {
        let command = self.command(&spec);
        let attached = spawn_attached(command, spec.output.clone())
            .map_err(|e| BackendError::command(&self.config.binary, e.to_string()))?;
        let pid = attached.pid.ok_or(BackendError::NotRunning)?;
        info!("Started jailed workload {} as pid {}", spec.target.id, pid);

        match self
            .cgroups
            .apply(&Self::cgroup_name(&spec.target), pid, &spec.target.limits)
        {
            Ok(path) => debug!("Applied cgroup limits at {:?}", path),
            Err(e) => warn!(
                "cgroup limits not applied to workload {}: {}",
                spec.target.id, e
            ),
        }

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
        // bwrap starts the workload in a new session, outside its own
        // process group, and does not forward SIGINT.
        let pid = handle.pid.ok_or(BackendError::NotRunning)?;
        signal_tree(pid, &self.wrapper_comm(), signal)
    }

    async fn destroy(&self, target: &Target) -> BackendResult<()> {
        if let Err(e) = self.cgroups.remove(&Self::cgroup_name(target)) {
            warn!("Failed to remove cgroup for {}: {}", target.id, e);
        }
        Ok(())
    }

    async fn stats(&self, target: &Target, handle: &NativeHandle) -> BackendResult<WorkloadStats> {
        let pid = handle.pid.ok_or(BackendError::NotRunning)?;
        let mut stats = self.sampler.sample_tree(pid, !self.config.allow_network);
        stats.memory_limit_bytes = target.limits.memory_bytes();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, OutputSink};
    use keel_sandbox::ResourceLimits;
    use std::path::PathBuf;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_command_wraps_program_after_separator() {
        let backend = JailBackend::new(JailConfig::default(), Path::new("/sys/fs/cgroup/keel"));
        let target = Target {
            id: Uuid::new_v4(),
            home: PathBuf::from("/srv/keel/w/home"),
            image: None,
            limits: ResourceLimits::default(),
            env: vec![("STARTUP".to_string(), "./run.sh".to_string())],
            ports: Vec::new(),
        };
        let spec = LaunchSpec {
            output: OutputSink::new(Arc::new(EventHub::new()), target.id),
            target,
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "./run.sh".to_string()],
        };

        let command = backend.command(&spec);
        let std_cmd = command.as_std();
        assert_eq!(std_cmd.get_program(), "bwrap");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["/bin/sh", "-c", "./run.sh"]);
        assert!(args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"STARTUP".to_string()));
    }

    #[test]
    fn test_wrapper_comm_uses_binary_name() {
        let config = JailConfig {
            binary: "/usr/local/bin/bwrap".to_string(),
            ..JailConfig::default()
        };
        let backend = JailBackend::new(config, Path::new("/sys/fs/cgroup/keel"));
        assert_eq!(backend.wrapper_comm(), "bwrap");
    }

    fn bwrap_usable() -> bool {
        std::process::Command::new("bwrap")
            .args(["--unshare-all", "--ro-bind", "/", "/", "true"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_jailed_workload_is_sampled_and_interrupted() {
        if !bwrap_usable() {
            eprintln!("bwrap unavailable, skipping");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        // SAFETY: geteuid/getegid have no preconditions.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        let config = JailConfig {
            uid,
            gid,
            ..JailConfig::default()
        };
        let backend = JailBackend::new(config, &dir.path().join("cgroup"));
        let target = Target {
            id: Uuid::new_v4(),
            home: dir.path().join("home"),
            image: None,
            limits: ResourceLimits::default(),
            env: Vec::new(),
            ports: Vec::new(),
        };
        backend.prepare(&target).await.unwrap();
        let launch = backend
            .launch(LaunchSpec {
                output: OutputSink::new(Arc::new(EventHub::new()), target.id),
                target: target.clone(),
                program: "sleep".to_string(),
                args: vec!["30".to_string()],
            })
            .await
            .unwrap();
        let handle = NativeHandle {
            native_id: launch.native_id.clone(),
            pid: launch.pid,
        };

        let mut stats = WorkloadStats::default();
        for _ in 0..100 {
            stats = backend.stats(&target, &handle).await.unwrap();
            if stats.pids >= 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(stats.pids >= 3, "sandboxed process not found: {stats:?}");
        assert!(stats.memory_bytes > 0);

        backend
            .signal(&target, &handle, StopSignal::Interrupt)
            .await
            .unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), launch.exit)
            .await
            .expect("interrupt did not stop the jailed workload");
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn test_destroy_without_cgroup_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = JailBackend::new(JailConfig::default(), dir.path());
        let target = Target {
            id: Uuid::new_v4(),
            home: dir.path().join("home"),
            image: None,
            limits: ResourceLimits::default(),
            env: Vec::new(),
            ports: Vec::new(),
        };
        backend.destroy(&target).await.unwrap();
    }
}
