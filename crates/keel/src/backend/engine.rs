//! Container-engine backend driving the docker or podman CLI.
//!
//! Every launch re-creates the container `keel-<8 hex>` with the resolved
//! command, starts it detached and then attaches three helper processes:
//! `logs -f` for output, `attach --sig-proxy=false` for stdin and `wait` for
//! the exit code.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use keel_protocol::{BackendKind, WorkloadStats};
use keel_sandbox::{CONTAINER_HOME, parse_memory};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::{BackendError, BackendResult};
use super::process::spawn_attached;
use super::{IsolationBackend, Launch, LaunchSpec, NativeHandle, StopSignal, Target};

/// How long output may keep draining after `wait` returned.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Container engine flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Docker,
    #[default]
    Podman,
}

impl EngineKind {
    pub fn default_binary(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }

    /// Whether bind mounts need the SELinux relabel suffix.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, EngineKind::Podman)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Override for the engine binary path.
    pub binary: Option<String>,
    pub restart_policy: String,
    /// Image used when a workload does not name one.
    pub default_image: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            binary: None,
            restart_policy: "no".to_string(),
            default_image: None,
        }
    }
}

impl EngineConfig {
    pub fn binary(&self) -> &str {
        self.binary
            .as_deref()
            .unwrap_or_else(|| self.kind.default_binary())
    }
}

/// Validate a Docker/OCI image reference.
///
/// Allowed: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`.
pub fn validate_image_name(image: &str) -> BackendResult<()> {
    if image.is_empty() {
        return Err(BackendError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(BackendError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@');
    if !image.chars().all(valid) || image.contains("..") || image.starts_with('-') {
        return Err(BackendError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    Ok(())
}

/// One row of `stats --no-stream --format json`.
///
/// Podman emits snake_case keys, docker the PascalCase aliases.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct EngineStats {
    #[serde(default, alias = "CPUPerc")]
    pub cpu_percent: String,
    #[serde(default, alias = "MemUsage")]
    pub mem_usage: String,
    #[serde(default, alias = "NetIO")]
    pub net_io: String,
    #[serde(default, alias = "PIDs")]
    pub pids: String,
}

impl EngineStats {
    /// Parse either a JSON array (podman) or one object per line (docker).
    pub fn parse(output: &str) -> BackendResult<Self> {
        let trimmed = output.trim();
        if trimmed.starts_with('[') {
            let rows: Vec<EngineStats> = serde_json::from_str(trimmed)
                .map_err(|e| BackendError::Parse(format!("engine stats: {e}")))?;
            return rows.into_iter().next().ok_or(BackendError::NotRunning);
        }

        let line = trimmed.lines().next().ok_or(BackendError::NotRunning)?;
        serde_json::from_str(line).map_err(|e| BackendError::Parse(format!("engine stats: {e}")))
    }

    pub fn to_workload_stats(&self) -> WorkloadStats {
        let (mem_used, mem_limit) = split_pair(&self.mem_usage);
        let (net_rx, net_tx) = split_pair(&self.net_io);
        WorkloadStats {
            cpu_percent: self
                .cpu_percent
                .trim()
                .trim_end_matches('%')
                .parse()
                .unwrap_or(0.0),
            memory_bytes: mem_used,
            memory_limit_bytes: mem_limit,
            net_rx_bytes: net_rx,
            net_tx_bytes: net_tx,
            pids: self.pids.trim().parse().unwrap_or(0),
        }
    }
}

/// Parse `"73.4MiB / 128MiB"` style pairs; unparsable sides become zero.
fn split_pair(value: &str) -> (u64, u64) {
    let mut parts = value.split('/').map(|p| parse_memory(p.trim()).unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

pub struct EngineBackend {
    config: EngineConfig,
}

impl EngineBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn image<'a>(&'a self, target: &'a Target) -> BackendResult<&'a str> {
        let image = target
            .image
            .as_deref()
            .or(self.config.default_image.as_deref())
            .ok_or_else(|| {
                BackendError::InvalidInput("container engine workloads need an image".to_string())
            })?;
        validate_image_name(image)?;
        Ok(image)
    }

    /// Arguments for `create`, followed by the optional command.
    pub(crate) fn create_args(
        &self,
        target: &Target,
        image: &str,
        command: Option<(&str, &[String])>,
    ) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--interactive".to_string(),
            "--name".to_string(),
            target.engine_name(),
            "--hostname".to_string(),
            target.engine_name(),
            "--restart".to_string(),
            self.config.restart_policy.clone(),
            "--workdir".to_string(),
            CONTAINER_HOME.to_string(),
        ];

        let volume = if self.config.kind.needs_selinux_labels() {
            format!("{}:{}:Z", target.home.display(), CONTAINER_HOME)
        } else {
            format!("{}:{}", target.home.display(), CONTAINER_HOME)
        };
        args.push("--volume".to_string());
        args.push(volume);

        for port in &target.ports {
            args.push("--publish".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }

        for (key, value) in &target.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }

        args.extend(target.limits.engine_args());
        args.push(image.to_string());

        if let Some((program, rest)) = command {
            args.push(program.to_string());
            args.extend(rest.iter().cloned());
        }
        args
    }

    async fn run(&self, args: &[String]) -> BackendResult<String> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let output = Command::new(self.config.binary())
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackendError::command(&subcommand, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::command(subcommand, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn remove(&self, name: &str) -> BackendResult<()> {
        match self.run(&["rm".to_string(), "-f".to_string(), name.to_string()]).await {
            Ok(_) => Ok(()),
            Err(BackendError::CommandFailed { message, .. })
                if message.to_lowercase().contains("no such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IsolationBackend for EngineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ContainerEngine
    }

    async fn prepare(&self, target: &Target) -> BackendResult<()> {
        tokio::fs::create_dir_all(&target.home).await?;
        let image = self.image(target)?;
        self.remove(&target.engine_name()).await?;
        self.run(&self.create_args(target, image, None)).await?;
        info!("Created container {}", target.engine_name());
        Ok(())
    }

    async fn launch(&self, spec: LaunchSpec) -> BackendResult<Launch> {
        let target = &spec.target;
        let name = target.engine_name();
        let image = self.image(target)?;

        self.remove(&name).await?;
        let command = (spec.program.as_str(), spec.args.as_slice());
        self.run(&self.create_args(target, image, Some(command)))
            .await?;
        self.run(&["start".to_string(), name.clone()]).await?;

        let binary = self.config.binary().to_string();

        let mut logs = Command::new(&binary);
        logs.args(["logs", "--follow", name.as_str()]);
        let logs = spawn_attached(logs, spec.output.clone())
            .map_err(|e| BackendError::command("logs", e.to_string()))?;

        let mut attach = Command::new(&binary)
            .args(["attach", "--sig-proxy=false", name.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::command("attach", e.to_string()))?;
        let input = attach.stdin.take();

        let wait_name = name.clone();
        let exit = async move {
            let code = match Command::new(&binary)
                .args(["wait", wait_name.as_str()])
                .stderr(Stdio::null())
                .output()
                .await
            {
                Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                    .trim()
                    .parse()
                    .unwrap_or(-1),
                Ok(out) => {
                    warn!("wait {} exited with {}", wait_name, out.status);
                    -1
                }
                Err(e) => {
                    warn!("wait {} failed: {}", wait_name, e);
                    -1
                }
            };
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, logs.exit).await.is_err() {
                debug!("Log follower for {} still running after exit", wait_name);
            }
            drop(attach);
            code
        }
        .boxed();

        info!("Started container {} for workload {}", name, target.id);
        Ok(Launch {
            native_id: name,
            pid: None,
            input,
            exit,
        })
    }

    async fn signal(
        &self,
        _target: &Target,
        handle: &NativeHandle,
        signal: StopSignal,
    ) -> BackendResult<()> {
        let args = [
            "kill".to_string(),
            "--signal".to_string(),
            signal.name().to_string(),
            handle.native_id.clone(),
        ];
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(BackendError::CommandFailed { message, .. })
                if message.to_lowercase().contains("not running") =>
            {
                Err(BackendError::NotRunning)
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, target: &Target) -> BackendResult<()> {
        self.remove(&target.engine_name()).await
    }

    async fn stats(&self, _target: &Target, handle: &NativeHandle) -> BackendResult<WorkloadStats> {
        let out = self
            .run(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "json".to_string(),
                handle.native_id.clone(),
            ])
            .await?;
        Ok(EngineStats::parse(&out)?.to_workload_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PortBinding;
    use keel_sandbox::ResourceLimits;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn target() -> Target {
        Target {
            id: Uuid::parse_str("aabbccdd-0000-4000-8000-000000000001").unwrap(),
            home: PathBuf::from("/srv/keel/w/home"),
            image: Some("ghcr.io/acme/java:21".to_string()),
            limits: ResourceLimits {
                memory_mb: 512,
                cpu_percent: 150,
                ..Default::default()
            },
            env: vec![("STARTUP".to_string(), "java -jar server.jar".to_string())],
            ports: vec![PortBinding {
                host: 25565,
                container: 25565,
            }],
        }
    }

    // ========================================================================
    // Argument building
    // ========================================================================

    #[test]
    fn test_create_args_podman() {
        let backend = EngineBackend::new(EngineConfig::default());
        let t = target();
        let cmd = vec!["-c".to_string(), "java -jar server.jar".to_string()];
        let args = backend.create_args(&t, "ghcr.io/acme/java:21", Some(("/bin/sh", cmd.as_slice())));

        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--name", "keel-aabbccdd"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["--volume", "/srv/keel/w/home:/home/container:Z"])
        );
        assert!(args.windows(2).any(|w| w == ["--publish", "25565:25565"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["--env", "STARTUP=java -jar server.jar"])
        );
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1.5".to_string()));
        assert!(args.windows(2).any(|w| w == ["--restart", "no"]));

        let image_pos = args.iter().position(|a| a == "ghcr.io/acme/java:21").unwrap();
        assert_eq!(&args[image_pos + 1..], ["/bin/sh", "-c", "java -jar server.jar"]);
    }

    #[test]
    fn test_create_args_docker_has_no_selinux_label() {
        let backend = EngineBackend::new(EngineConfig {
            kind: EngineKind::Docker,
            ..Default::default()
        });
        let args = backend.create_args(&target(), "alpine", None);
        assert!(
            args.windows(2)
                .any(|w| w == ["--volume", "/srv/keel/w/home:/home/container"])
        );
        assert_eq!(args.last().unwrap(), "alpine");
    }

    #[test]
    fn test_binary_override() {
        let config = EngineConfig {
            binary: Some("/opt/bin/docker".to_string()),
            kind: EngineKind::Docker,
            ..Default::default()
        };
        assert_eq!(config.binary(), "/opt/bin/docker");
        assert_eq!(EngineConfig::default().binary(), "podman");
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("ubuntu:latest").is_ok());
        assert!(validate_image_name("registry.io/ns/img@sha256:abc").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("img; rm -rf /").is_err());
        assert!(validate_image_name("--privileged").is_err());
        assert!(validate_image_name("a/../b").is_err());
    }

    #[test]
    fn test_missing_image_is_invalid_input() {
        let backend = EngineBackend::new(EngineConfig::default());
        let mut t = target();
        t.image = None;
        assert!(matches!(backend.image(&t), Err(BackendError::InvalidInput(_))));
    }

    // ========================================================================
    // Stats parsing
    // ========================================================================

    #[test]
    fn test_parse_podman_stats_array() {
        let out = r#"[{"id":"abc","name":"keel-aabbccdd","cpu_percent":"12.50%","mem_usage":"64MiB / 512MiB","mem_percent":"12.5%","net_io":"1KB / 2KB","block_io":"0B / 0B","pids":"7"}]"#;
        let stats = EngineStats::parse(out).unwrap().to_workload_stats();
        assert!((stats.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert_eq!(stats.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(stats.memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(stats.net_rx_bytes, 1024);
        assert_eq!(stats.net_tx_bytes, 2048);
        assert_eq!(stats.pids, 7);
    }

    #[test]
    fn test_parse_docker_stats_line() {
        let out = "{\"Container\":\"keel-aabbccdd\",\"CPUPerc\":\"0.50%\",\"MemUsage\":\"1.5GiB / 2GiB\",\"NetIO\":\"0B / 0B\",\"PIDs\":\"3\"}\n";
        let stats = EngineStats::parse(out).unwrap().to_workload_stats();
        assert!((stats.cpu_percent - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.memory_bytes, 1536 * 1024 * 1024);
        assert_eq!(stats.pids, 3);
    }

    #[test]
    fn test_parse_empty_stats() {
        assert!(matches!(
            EngineStats::parse("[]"),
            Err(BackendError::NotRunning)
        ));
        assert!(matches!(EngineStats::parse("{"), Err(BackendError::Parse(_))));
    }
}
