//! Child process plumbing shared by the process-based backends.
//!
//! Spawning with piped stdio, line pumps into the event hub, signalling a
//! whole process group and sampling its usage from `/proc`.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use keel_protocol::{OutputStream, WorkloadStats};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};

use super::error::{BackendError, BackendResult};
use super::StopSignal;
use crate::events::OutputSink;
use crate::monitor::host::parse_net_dev;

/// Upper bound for draining output after the process exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A spawned child with its I/O wired up.
pub(crate) struct Attached {
    pub pid: Option<u32>,
    pub stdin: Option<ChildStdin>,
    pub exit: BoxFuture<'static, i32>,
}

/// Spawn `command` with piped stdio and forward every output line to `output`.
///
/// The child is killed if the returned exit future is dropped before the
/// child finished.
pub(crate) fn spawn_attached(mut command: Command, output: OutputSink) -> io::Result<Attached> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();
    let stdin = child.stdin.take();

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(
            stdout,
            OutputStream::Stdout,
            output.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(stderr, OutputStream::Stderr, output)));
    }

    let exit = async move {
        let code = match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!("Failed to wait for child {:?}: {}", pid, e);
                -1
            }
        };
        for pump in pumps {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                debug!("Output pump for {:?} still busy after exit", pid);
            }
        }
        code
    }
    .boxed();

    Ok(Attached { pid, stdin, exit })
}

/// Forward a stream line by line, tolerating invalid UTF-8.
pub(crate) async fn pump_lines<R>(reader: R, stream: OutputStream, output: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                output.emit(stream, line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

/// Exit code, or `128 + signal` when the process was killed by a signal.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Fields of `/proc/<pid>/stat` the sampler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    pub pgrp: u32,
    /// utime + stime in clock ticks.
    pub cpu_ticks: u64,
    pub rss_pages: u64,
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub(crate) fn parse_proc_stat(line: &str) -> Option<ProcStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid = line[..open].trim().parse::<u32>().ok()?;
    let comm = line.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
    // fields[0] is the state (field 3 of the man page).
    let field = |n: usize| fields.get(n - 3).and_then(|v| v.parse::<u64>().ok());

    Some(ProcStat {
        pid,
        comm,
        ppid: u32::try_from(field(4)?).ok()?,
        pgrp: u32::try_from(field(5)?).ok()?,
        cpu_ticks: field(14)? + field(15)?,
        rss_pages: field(24)?,
    })
}

/// Every readable process on the host.
pub(crate) fn process_table() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let line = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
            parse_proc_stat(&line)
        })
        .collect()
}

/// `root` and all of its descendants found in `table`, parents first.
pub(crate) fn process_tree(table: &[ProcStat], root: u32) -> Vec<ProcStat> {
    let mut tree: Vec<ProcStat> = table.iter().filter(|p| p.pid == root).cloned().collect();
    let mut next = 0;
    while next < tree.len() {
        let parent = tree[next].pid;
        tree.extend(table.iter().filter(|p| p.ppid == parent && p.pid != root).cloned());
        next += 1;
    }
    tree
}

fn send(pid: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory safety preconditions.
    if unsafe { libc::kill(pid, sig) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn to_pid(pid: u32) -> BackendResult<libc::pid_t> {
    libc::pid_t::try_from(pid)
        .map_err(|_| BackendError::InvalidInput(format!("pid out of range: {pid}")))
}

fn not_running_or(err: io::Error) -> BackendError {
    if err.raw_os_error() == Some(libc::ESRCH) {
        BackendError::NotRunning
    } else {
        err.into()
    }
}

/// Signal the process group led by `pid`, falling back to the pid itself.
pub(crate) fn signal_group(pid: u32, signal: StopSignal) -> BackendResult<()> {
    let pid = to_pid(pid)?;
    let sig = signal.as_libc();

    if send(-pid, sig).is_ok() {
        return Ok(());
    }
    send(pid, sig).map_err(not_running_or)
}

/// Signal every process below `root` whose command name is not `wrapper`.
///
/// Wrappers that move the workload into its own session (bwrap with
/// `--new-session`) leave it outside the wrapper's process group, so the
/// tree is walked instead. A kill also takes down the wrappers themselves.
pub(crate) fn signal_tree(root: u32, wrapper: &str, signal: StopSignal) -> BackendResult<()> {
    let tree = process_tree(&process_table(), root);
    if tree.is_empty() {
        return Err(BackendError::NotRunning);
    }

    let sig = signal.as_libc();
    let mut delivered = 0usize;
    for process in tree.iter().skip(1) {
        if process.comm == wrapper && signal != StopSignal::Kill {
            continue;
        }
        match send(to_pid(process.pid)?, sig) {
            Ok(()) => delivered += 1,
            Err(e) => debug!("Signal to {} failed: {}", process.pid, e),
        }
    }

    if signal == StopSignal::Kill {
        return signal_group(root, signal);
    }
    if delivered == 0 {
        // Nothing started inside the wrapper yet; the wrapper is all there is.
        return signal_group(root, signal);
    }
    Ok(())
}

/// Samples usage of process sets, remembering the previous CPU reading per
/// key to derive a percentage.
pub(crate) struct GroupSampler {
    previous: Mutex<HashMap<u32, (u64, Instant)>>,
    ticks_per_sec: u64,
    page_size: u64,
}

impl Default for GroupSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupSampler {
    pub fn new() -> Self {
        // SAFETY: sysconf only reads system configuration.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        // SAFETY: as above.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            previous: Mutex::new(HashMap::new()),
            ticks_per_sec: u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100),
            page_size: u64::try_from(page).ok().filter(|p| *p > 0).unwrap_or(4096),
        }
    }

    /// Aggregate every process in group `pgid`.
    ///
    /// With `private_net` the counters of the leader's network namespace are
    /// included; for processes sharing the host network they would be
    /// host-wide and are left at zero.
    pub fn sample(&self, pgid: u32, private_net: bool) -> WorkloadStats {
        let members: Vec<ProcStat> = process_table()
            .into_iter()
            .filter(|p| p.pgrp == pgid)
            .collect();
        let net_pid = private_net.then_some(pgid);
        self.aggregate(pgid, &members, net_pid)
    }

    /// Aggregate `root` and all of its descendants.
    ///
    /// Network counters come from the first descendant, which already lives
    /// in the wrapper's new network namespace; `root` itself does not.
    pub fn sample_tree(&self, root: u32, private_net: bool) -> WorkloadStats {
        let tree = process_tree(&process_table(), root);
        let net_pid = if private_net {
            tree.get(1).map(|p| p.pid)
        } else {
            None
        };
        self.aggregate(root, &tree, net_pid)
    }

    fn aggregate(&self, key: u32, members: &[ProcStat], net_pid: Option<u32>) -> WorkloadStats {
        if members.is_empty() {
            self.forget(key);
            return WorkloadStats::default();
        }

        let ticks: u64 = members.iter().map(|p| p.cpu_ticks).sum();
        let rss_pages: u64 = members.iter().map(|p| p.rss_pages).sum();
        let mut stats = WorkloadStats {
            cpu_percent: self.cpu_percent(key, ticks),
            memory_bytes: rss_pages * self.page_size,
            pids: members.len() as u64,
            ..Default::default()
        };

        if let Some(pid) = net_pid
            && let Ok(dev) = std::fs::read_to_string(format!("/proc/{pid}/net/dev"))
        {
            for iface in parse_net_dev(&dev).into_iter().filter(|i| i.name != "lo") {
                stats.net_rx_bytes += iface.rx_bytes;
                stats.net_tx_bytes += iface.tx_bytes;
            }
        }

        stats
    }

    fn cpu_percent(&self, key: u32, ticks: u64) -> f64 {
        let now = Instant::now();
        let Ok(mut previous) = self.previous.lock() else {
            return 0.0;
        };
        let percent = match previous.get(&key) {
            Some((prev_ticks, at)) => {
                let elapsed = now.duration_since(*at).as_secs_f64();
                if elapsed > 0.0 {
                    let used = ticks.saturating_sub(*prev_ticks) as f64 / self.ticks_per_sec as f64;
                    used / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        previous.insert(key, (ticks, now));
        percent
    }

    pub fn forget(&self, key: u32) {
        if let Ok(mut previous) = self.previous.lock() {
            previous.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, WorkloadEvent};
    use std::sync::Arc;
    use uuid::Uuid;

    // ========================================================================
    // /proc parsing
    // ========================================================================

    #[test]
    fn test_parse_proc_stat() {
        let line = "4242 (java) S 1 4242 4242 0 -1 4194560 1200 0 0 0 150 50 0 0 20 0 31 0 9000 \
                    4000000000 52000 18446744073709551615 1 1 0 0 0 0 0 4096 17414 0 0 0 17 3 0 0";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.comm, "java");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.cpu_ticks, 200);
        assert_eq!(stat.rss_pages, 52000);
    }

    #[test]
    fn test_parse_proc_stat_name_with_parens() {
        let line = "77 (my (odd) name) R 1 70 70 0 -1 0 0 0 0 0 3 4 0 0 20 0 1 0 1 1000 10";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.comm, "my (odd) name");
        assert_eq!(stat.pgrp, 70);
        assert_eq!(stat.cpu_ticks, 7);
        assert_eq!(stat.rss_pages, 10);
    }

    #[test]
    fn test_parse_proc_stat_truncated() {
        assert!(parse_proc_stat("12 (sh) S 1").is_none());
        assert!(parse_proc_stat("garbage").is_none());
    }

    fn proc(pid: u32, ppid: u32, comm: &str) -> ProcStat {
        ProcStat {
            pid,
            comm: comm.to_string(),
            ppid,
            pgrp: pid,
            cpu_ticks: 1,
            rss_pages: 1,
        }
    }

    #[test]
    fn test_process_tree_follows_parents_across_sessions() {
        let table = vec![
            proc(1, 0, "init"),
            proc(10, 1, "bwrap"),
            proc(11, 10, "bwrap"),
            proc(12, 11, "java"),
            proc(13, 12, "sh"),
            proc(20, 1, "other"),
        ];
        let pids: Vec<u32> = process_tree(&table, 10).iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![10, 11, 12, 13]);
        assert!(process_tree(&table, 99).is_empty());
    }

    #[test]
    fn test_sampler_unknown_tree_is_zero() {
        let sampler = GroupSampler::new();
        assert_eq!(sampler.sample_tree(u32::MAX - 1, true), WorkloadStats::default());
    }

    #[test]
    fn test_sampler_unknown_group_is_zero() {
        let sampler = GroupSampler::new();
        let stats = sampler.sample(u32::MAX - 1, false);
        assert_eq!(stats, WorkloadStats::default());
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    #[tokio::test]
    async fn test_spawn_attached_forwards_lines_and_exit_code() {
        let hub = Arc::new(EventHub::new());
        let id = Uuid::new_v4();
        let mut sub = hub.subscribe(id);

        let mut command = Command::new("sh");
        command.args(["-c", "echo one; echo two >&2; exit 3"]);
        let attached = spawn_attached(command, OutputSink::new(hub.clone(), id)).unwrap();
        assert!(attached.pid.is_some());
        assert_eq!(attached.exit.await, 3);

        let mut lines = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            if let WorkloadEvent::Output { stream, line } = event {
                lines.push((stream, line));
            }
        }
        assert!(lines.contains(&(OutputStream::Stdout, "one".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "two".to_string())));
    }

    #[tokio::test]
    async fn test_signal_group_kills_process() {
        let hub = Arc::new(EventHub::new());
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]).process_group(0);
        let attached = spawn_attached(command, OutputSink::new(hub, Uuid::new_v4())).unwrap();

        signal_group(attached.pid.unwrap(), StopSignal::Kill).unwrap();
        assert_eq!(attached.exit.await, 128 + libc::SIGKILL);
    }

    fn setsid_supports_fork_and_wait() -> bool {
        std::process::Command::new("setsid")
            .args(["-f", "-w", "true"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// A wrapper that puts its child in a new session, the way bwrap does.
    #[tokio::test]
    async fn test_signal_tree_reaches_child_in_new_session() {
        if !setsid_supports_fork_and_wait() {
            eprintln!("setsid -f -w unavailable, skipping");
            return;
        }
        let hub = Arc::new(EventHub::new());
        let mut command = Command::new("setsid");
        command.args(["-f", "-w", "sleep", "30"]).process_group(0);
        let attached = spawn_attached(command, OutputSink::new(hub, Uuid::new_v4())).unwrap();
        let root = attached.pid.unwrap();

        let mut tree = Vec::new();
        for _ in 0..100 {
            tree = process_tree(&process_table(), root);
            if tree.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(tree.len() >= 2, "child never appeared under {root}");
        assert_ne!(tree[1].pgrp, root);

        let stats = GroupSampler::new().sample_tree(root, false);
        assert!(stats.pids >= 2);
        assert!(stats.memory_bytes > 0);

        signal_tree(root, "setsid", StopSignal::Interrupt).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), attached.exit)
            .await
            .expect("interrupt never reached the session child");
        assert_ne!(code, 0);
    }
}
