//! Declared resource limits and their translation per isolation backend.
//!
//! A zero value always means "no limit" and produces no primitive.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// CFS period used for CPU quotas, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    #[error("invalid memory value: {0}")]
    InvalidMemory(String),

    #[error("unknown memory unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },
}

/// Parse a memory string such as `512MB`, `1.5GB` or `2GiB` into bytes.
///
/// Units are case-insensitive and always use 1024 multipliers; a bare number
/// is taken as bytes.
pub fn parse_memory(input: &str) -> Result<u64, LimitError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| LimitError::InvalidMemory(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(LimitError::InvalidMemory(input.to_string()));
    }

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        other => {
            return Err(LimitError::UnknownUnit {
                input: input.to_string(),
                unit: other.to_string(),
            });
        }
    };

    Ok((value * multiplier as f64).round() as u64)
}

/// Limits declared for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB. Accepts a number (MiB) or a unit string.
    #[serde(alias = "memory", deserialize_with = "deserialize_memory_mb")]
    pub memory_mb: u64,
    /// CPU share in percent of one core (150 = one and a half cores).
    #[serde(alias = "cpu")]
    pub cpu_percent: u32,
    /// Disk quota in MiB. Reported, not enforced by the kernel.
    #[serde(alias = "disk")]
    pub disk_mb: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
    /// Wall-clock limit for a single run. Zero disables it.
    pub timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_percent: 100,
            disk_mb: 10 * 1024,
            max_processes: 256,
            max_open_files: 1024,
            timeout_secs: 0,
        }
    }
}

fn deserialize_memory_mb<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MemoryValue {
        Int(u64),
        Float(f64),
        Str(String),
    }

    match MemoryValue::deserialize(deserializer)? {
        MemoryValue::Int(mb) => Ok(mb),
        MemoryValue::Float(mb) if mb >= 0.0 => Ok(mb.ceil() as u64),
        MemoryValue::Float(mb) => Err(serde::de::Error::custom(format!(
            "memory must not be negative: {mb}"
        ))),
        MemoryValue::Str(s) => {
            let bytes = parse_memory(&s).map_err(serde::de::Error::custom)?;
            Ok(bytes.div_ceil(MIB))
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(MIB)
    }

    /// CPU share expressed in millicores (1000 = one core).
    pub fn millicores(&self) -> u64 {
        u64::from(self.cpu_percent) * 10
    }

    /// CFS quota in microseconds per [`CPU_PERIOD_US`].
    pub fn cpu_quota_us(&self) -> u64 {
        u64::from(self.cpu_percent) * CPU_PERIOD_US / 100
    }

    /// Flags for `docker create` / `podman create`.
    pub fn engine_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.memory_mb > 0 {
            args.push(format!("--memory={}m", self.memory_mb));
            // Equal swap limit disables swap for the container.
            args.push(format!("--memory-swap={}m", self.memory_mb));
        }
        if self.cpu_percent > 0 {
            args.push(format!("--cpus={}", self.millicores() as f64 / 1000.0));
        }
        if self.max_processes > 0 {
            args.push(format!("--pids-limit={}", self.max_processes));
        }
        if self.max_open_files > 0 {
            args.push(format!(
                "--ulimit=nofile={}:{}",
                self.max_open_files, self.max_open_files
            ));
        }
        args
    }

    /// Arguments for `prlimit` applied to a running process.
    ///
    /// Returns `None` when there is nothing to apply.
    pub fn prlimit_args(&self, pid: u32) -> Option<Vec<String>> {
        let mut args = vec!["--pid".to_string(), pid.to_string()];
        if self.memory_mb > 0 {
            args.push(format!("--as={}", self.memory_bytes()));
        }
        if self.max_processes > 0 {
            args.push(format!("--nproc={}", self.max_processes));
        }
        if self.max_open_files > 0 {
            args.push(format!("--nofile={}", self.max_open_files));
        }
        (args.len() > 2).then_some(args)
    }

    /// cgroup v2 controller files and the values to write into them.
    pub fn cgroup_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = Vec::new();
        if self.memory_mb > 0 {
            settings.push(("memory.max", self.memory_bytes().to_string()));
        }
        if self.cpu_percent > 0 {
            settings.push((
                "cpu.max",
                format!("{} {}", self.cpu_quota_us(), CPU_PERIOD_US),
            ));
        }
        if self.max_processes > 0 {
            settings.push(("pids.max", self.max_processes.to_string()));
        }
        settings
    }

    /// `linux.resources` section of an OCI runtime spec.
    pub fn oci_resources(&self) -> Value {
        let mut resources = serde_json::Map::new();
        if self.memory_mb > 0 {
            resources.insert(
                "memory".into(),
                json!({ "limit": self.memory_bytes(), "swap": self.memory_bytes() }),
            );
        }
        if self.cpu_percent > 0 {
            resources.insert(
                "cpu".into(),
                json!({ "quota": self.cpu_quota_us(), "period": CPU_PERIOD_US }),
            );
        }
        if self.max_processes > 0 {
            resources.insert("pids".into(), json!({ "limit": self.max_processes }));
        }
        Value::Object(resources)
    }

    /// `process.rlimits` section of an OCI runtime spec.
    pub fn oci_rlimits(&self) -> Vec<Value> {
        let mut rlimits = Vec::new();
        if self.max_open_files > 0 {
            rlimits.push(json!({
                "type": "RLIMIT_NOFILE",
                "hard": self.max_open_files,
                "soft": self.max_open_files,
            }));
        }
        if self.max_processes > 0 {
            rlimits.push(json!({
                "type": "RLIMIT_NPROC",
                "hard": self.max_processes,
                "soft": self.max_processes,
            }));
        }
        rlimits
    }
}
