//! Host usage readings backed by `/proc` and `statvfs`.
//!
//! Every reading degrades to zeros on failure; one unreadable file never
//! blanks the rest of the snapshot.

use std::ffi::CString;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_protocol::HostStats;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    total: u64,
    idle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

/// Counters of one interface from `/proc/net/dev`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Keeps the previous per-core CPU times so each sample is a delta.
#[derive(Debug, Default)]
pub struct HostSampler {
    previous_cpu: Option<Vec<CpuTimes>>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sample(&mut self) -> HostStats {
        let mut stats = HostStats {
            sampled_at: Some(Utc::now()),
            ..Default::default()
        };

        match read_to_string("/proc/stat").await.and_then(|s| parse_core_times(&s)) {
            Ok(cores) => {
                stats.cpu_cores = cores.len();
                stats.cpu_percent = average_busy_percent(self.previous_cpu.as_deref(), &cores);
                self.previous_cpu = Some(cores);
            }
            Err(e) => debug!("cpu reading failed: {:#}", e),
        }

        match read_to_string("/proc/meminfo").await.and_then(|s| parse_meminfo(&s)) {
            Ok(mem) => {
                stats.mem_total_bytes = mem.total_bytes;
                stats.mem_available_bytes = mem.available_bytes;
                stats.mem_used_bytes = mem.total_bytes.saturating_sub(mem.available_bytes);
            }
            Err(e) => debug!("memory reading failed: {:#}", e),
        }

        match disk_usage("/") {
            Ok((total, used)) => {
                stats.disk_total_bytes = total;
                stats.disk_used_bytes = used;
            }
            Err(e) => debug!("disk reading failed: {:#}", e),
        }

        match read_to_string("/proc/net/dev").await {
            Ok(contents) => {
                if let Some(iface) = primary_interface(&contents) {
                    stats.net_interface = iface.name;
                    stats.net_rx_bytes = iface.rx_bytes;
                    stats.net_tx_bytes = iface.tx_bytes;
                }
            }
            Err(e) => debug!("network reading failed: {:#}", e),
        }

        stats
    }
}

async fn read_to_string(path: &str) -> Result<String> {
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {path}"))
}

/// Per-core times from the `cpuN` lines of `/proc/stat`.
fn parse_core_times(contents: &str) -> Result<Vec<CpuTimes>> {
    let cores: Vec<CpuTimes> = contents
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .filter_map(parse_cpu_line)
        .collect();

    if cores.is_empty() {
        anyhow::bail!("no per-core cpu lines in /proc/stat");
    }
    Ok(cores)
}

fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }

    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

fn busy_percent(prev: &CpuTimes, current: &CpuTimes) -> f64 {
    let total_delta = current.total.saturating_sub(prev.total);
    let idle_delta = current.idle.saturating_sub(prev.idle);
    if total_delta == 0 {
        return 0.0;
    }
    let busy_delta = total_delta.saturating_sub(idle_delta);
    (busy_delta as f64 / total_delta as f64) * 100.0
}

/// Mean of the per-core busy percentages. Zero on the first sample or when
/// the core count changed.
fn average_busy_percent(prev: Option<&[CpuTimes]>, current: &[CpuTimes]) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };
    if prev.len() != current.len() || current.is_empty() {
        return 0.0;
    }

    let sum: f64 = prev
        .iter()
        .zip(current)
        .map(|(p, c)| busy_percent(p, c))
        .sum();
    sum / current.len() as f64
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let available_kb = available_kb.context("missing MemAvailable in /proc/meminfo")?;

    Ok(MemInfo {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.saturating_mul(1024),
    })
}

fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

/// Parse `/proc/net/dev`, skipping the two header lines.
pub fn parse_net_dev(contents: &str) -> Vec<InterfaceCounters> {
    contents
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let fields: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            // receive: bytes packets errs drop fifo frame compressed multicast
            // transmit: bytes ...
            Some(InterfaceCounters {
                name: name.trim().to_string(),
                rx_bytes: *fields.first()?,
                tx_bytes: *fields.get(8)?,
            })
        })
        .collect()
}

/// First interface that is not loopback.
fn primary_interface(contents: &str) -> Option<InterfaceCounters> {
    parse_net_dev(contents).into_iter().find(|i| i.name != "lo")
}

/// Total and used bytes of the filesystem mounted at `path`.
fn disk_usage(path: &str) -> Result<(u64, u64)> {
    let c_path = CString::new(path).context("path contains NUL")?;
    // SAFETY: statvfs is plain old data; zeroed is a valid initial value.
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid C string and vfs a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("statvfs");
    }

    let block = vfs.f_frsize as u64;
    let total = (vfs.f_blocks as u64).saturating_mul(block);
    let free = (vfs.f_bfree as u64).saturating_mul(block);
    Ok((total, total.saturating_sub(free)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  300 0 100 1600 0 0 0 0 0 0
cpu0 100 0 50 850 0 0 0 0 0 0
cpu1 200 0 50 750 0 0 0 0 0 0
intr 12345
ctxt 999
";

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    0    0    0     0          0         0  1234567    4000    0    0    0     0       0          0
";

    #[test]
    fn test_parse_core_times_skips_aggregate() {
        let cores = parse_core_times(STAT).unwrap();
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0], CpuTimes { total: 1000, idle: 850 });
    }

    #[test]
    fn test_parse_core_times_requires_cores() {
        assert!(parse_core_times("cpu  1 2 3 4\n").is_err());
    }

    #[test]
    fn test_average_busy_percent() {
        let prev = [
            CpuTimes { total: 100, idle: 50 },
            CpuTimes { total: 100, idle: 50 },
        ];
        let current = [
            // 100% busy
            CpuTimes { total: 200, idle: 50 },
            // 0% busy
            CpuTimes { total: 200, idle: 150 },
        ];
        let percent = average_busy_percent(Some(&prev), &current);
        assert!((percent - 50.0).abs() < 0.01);
        assert_eq!(average_busy_percent(None, &current), 0.0);
        assert_eq!(average_busy_percent(Some(&prev[..1]), &current), 0.0);
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "\
MemTotal:       16384256 kB
MemFree:         123456 kB
MemAvailable:    999999 kB
";
        let info = parse_meminfo(sample).unwrap();
        assert_eq!(info.total_bytes, 16384256 * 1024);
        assert_eq!(info.available_bytes, 999999 * 1024);
        assert!(parse_meminfo("MemTotal: 1 kB\n").is_err());
    }

    #[test]
    fn test_parse_net_dev_and_primary() {
        let ifaces = parse_net_dev(NET_DEV);
        assert_eq!(ifaces.len(), 2);

        let primary = primary_interface(NET_DEV).unwrap();
        assert_eq!(primary.name, "eth0");
        assert_eq!(primary.rx_bytes, 9876543);
        assert_eq!(primary.tx_bytes, 1234567);
    }

    #[test]
    fn test_primary_interface_none_when_only_loopback() {
        let only_lo = NET_DEV.lines().take(3).collect::<Vec<_>>().join("\n");
        assert!(primary_interface(&only_lo).is_none());
    }

    #[test]
    fn test_disk_usage_root() {
        let (total, used) = disk_usage("/").unwrap();
        assert!(total > 0);
        assert!(used <= total);
    }

    #[tokio::test]
    async fn test_sample_twice_never_panics() {
        let mut sampler = HostSampler::new();
        let first = sampler.sample().await;
        let second = sampler.sample().await;
        assert!(first.sampled_at.is_some());
        assert!(second.cpu_percent >= 0.0);
    }
}
