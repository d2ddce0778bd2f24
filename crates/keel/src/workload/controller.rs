//! Workload lifecycle controller.
//!
//! The controller is the single owner of the workload registry: metadata for
//! every known workload plus at most one live handle per id. All state
//! transitions happen under the registry lock; backend calls happen outside
//! of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use keel_files::Filesystem;
use keel_protocol::{BackendKind, WorkloadStats, WorkloadStatus};
use keel_sandbox::ResourceLimits;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ControllerError, ControllerResult};
use super::model::{WorkloadMeta, WorkloadSpec};
use super::store::WorkloadStore;
use crate::backend::{
    BackendError, IsolationBackend, LaunchSpec, NativeHandle, StopSignal, Target,
};
use crate::events::{EventHub, OutputSink, WorkloadEvent};

/// How long to wait for the exit after a force-kill before giving up.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub stop_timeout: Duration,
    pub default_limits: ResourceLimits,
    pub max_read_bytes: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            default_limits: ResourceLimits::default(),
            max_read_bytes: keel_files::DEFAULT_MAX_READ_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Server,
    Install,
}

struct LiveHandle {
    run_id: u64,
    kind: RunKind,
    handle: NativeHandle,
    input: Option<Arc<Mutex<ChildStdin>>>,
    exited: watch::Receiver<bool>,
    stop_requested: bool,
}

struct Entry {
    meta: WorkloadMeta,
    live: Option<LiveHandle>,
}

struct Inner {
    store: WorkloadStore,
    backend: Arc<dyn IsolationBackend>,
    hub: Arc<EventHub>,
    config: ControllerConfig,
    registry: Mutex<HashMap<Uuid, Entry>>,
    stats: DashMap<Uuid, WorkloadStats>,
    next_run: AtomicU64,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct WorkloadController {
    inner: Arc<Inner>,
}

impl WorkloadController {
    pub fn new(
        store: WorkloadStore,
        backend: Arc<dyn IsolationBackend>,
        hub: Arc<EventHub>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                hub,
                config,
                registry: Mutex::new(HashMap::new()),
                stats: DashMap::new(),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.inner.hub
    }

    pub fn store(&self) -> &WorkloadStore {
        &self.inner.store
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    fn target(&self, meta: &WorkloadMeta) -> Target {
        meta.target(&self.inner.store.home(meta.id))
    }

    fn publish_status(&self, id: Uuid, status: WorkloadStatus) {
        self.inner.hub.publish(id, WorkloadEvent::Status(status));
    }

    async fn persist(&self, meta: &WorkloadMeta) {
        if let Err(e) = self.inner.store.save(meta).await {
            warn!("Failed to persist metadata for {}: {}", meta.id, e);
        }
    }

    // ========================================================================
    // Registry bootstrap
    // ========================================================================

    /// Register every workload found on disk.
    ///
    /// Handles do not survive a restart, so live statuses become `stopped`.
    pub async fn load_existing(&self) -> ControllerResult<usize> {
        let active = self.backend_kind();
        let metas = self.inner.store.load_all().await?;
        let count = metas.len();

        for mut meta in metas {
            let mut dirty = false;
            if meta.status.is_live() {
                info!(
                    "Workload {} was {} before restart, marking stopped",
                    meta.id, meta.status
                );
                meta.status = WorkloadStatus::Stopped;
                meta.native_id = None;
                meta.stopped_at = Some(Utc::now());
                dirty = true;
            }
            if meta.backend != active {
                warn!(
                    "Workload {} was created for {}, now running under {}",
                    meta.id, meta.backend, active
                );
                meta.backend = active;
                dirty = true;
            }
            if dirty {
                self.persist(&meta).await;
            }
            self.inner
                .registry
                .lock()
                .await
                .insert(meta.id, Entry { meta, live: None });
        }

        info!("Loaded {} workload(s) from disk", count);
        Ok(count)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn status(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        let registry = self.inner.registry.lock().await;
        registry
            .get(&id)
            .map(|e| e.meta.clone())
            .ok_or(ControllerError::NotFound(id))
    }

    pub async fn list(&self) -> Vec<WorkloadMeta> {
        let registry = self.inner.registry.lock().await;
        let mut metas: Vec<WorkloadMeta> = registry.values().map(|e| e.meta.clone()).collect();
        metas.sort_by_key(|m| m.created_at);
        metas
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.inner.registry.lock().await.contains_key(&id)
    }

    /// Latest cached stats; `None` unless the workload is running.
    pub fn stats(&self, id: Uuid) -> Option<WorkloadStats> {
        self.inner.stats.get(&id).map(|s| s.clone())
    }

    /// Ids of workloads with a live handle.
    pub async fn running_ids(&self) -> Vec<Uuid> {
        let registry = self.inner.registry.lock().await;
        registry
            .iter()
            .filter(|(_, e)| e.live.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sandboxed filesystem of a workload.
    pub async fn filesystem(&self, id: Uuid) -> ControllerResult<Filesystem> {
        if !self.exists(id).await {
            return Err(ControllerError::NotFound(id));
        }
        let store = &self.inner.store;
        Ok(Filesystem::new(store.home(id), store.backup_dir(id))
            .with_max_read_bytes(self.inner.config.max_read_bytes))
    }

    // ========================================================================
    // Create / delete
    // ========================================================================

    /// Create a workload, or rewrite the record of an existing one that is
    /// not running. The directory tree is reused when it already exists.
    pub async fn create(&self, spec: WorkloadSpec) -> ControllerResult<WorkloadMeta> {
        let id = spec.id.unwrap_or_else(Uuid::new_v4);
        let limits = spec
            .limits
            .clone()
            .unwrap_or_else(|| self.inner.config.default_limits.clone());
        let mut meta = WorkloadMeta::new(id, self.backend_kind(), limits, spec);

        let existed = {
            let mut registry = self.inner.registry.lock().await;
            match registry.get_mut(&id) {
                Some(entry) => {
                    if entry.live.is_some() || entry.meta.status == WorkloadStatus::Starting {
                        return Err(ControllerError::Conflict(format!(
                            "workload {id} is {} and cannot be recreated",
                            entry.meta.status
                        )));
                    }
                    meta.created_at = entry.meta.created_at;
                    meta.installed = entry.meta.installed;
                    entry.meta = meta.clone();
                    true
                }
                None => {
                    // Reserve the id while directories and backend objects are made.
                    registry.insert(
                        id,
                        Entry {
                            meta: meta.clone(),
                            live: None,
                        },
                    );
                    false
                }
            }
        };

        if existed {
            self.provision(&meta).await?;
            info!("Rewrote workload {} ({})", id, meta.backend);
            return Ok(meta);
        }

        if let Err(e) = self.provision(&meta).await {
            warn!("Create of {} failed, rolling back: {}", id, e);
            self.inner.registry.lock().await.remove(&id);
            if let Err(e) = self.inner.backend.destroy(&self.target(&meta)).await {
                debug!("Rollback destroy for {}: {}", id, e);
            }
            if let Err(e) = self.inner.store.remove(id).await {
                warn!("Rollback cleanup for {}: {}", id, e);
            }
            return Err(e);
        }

        info!("Created workload {} ({})", id, meta.backend);
        Ok(meta)
    }

    async fn provision(&self, meta: &WorkloadMeta) -> ControllerResult<()> {
        self.inner.store.ensure_dirs(meta.id).await?;
        self.inner.backend.prepare(&self.target(meta)).await?;
        self.inner.store.save(meta).await
    }

    /// Kill if live, destroy backend objects and remove all directories.
    ///
    /// Cleanup failures are logged; the record is dropped regardless.
    pub async fn delete(&self, id: Uuid) -> ControllerResult<()> {
        let entry = self
            .inner
            .registry
            .lock()
            .await
            .remove(&id)
            .ok_or(ControllerError::NotFound(id))?;
        let target = self.target(&entry.meta);

        if let Some(live) = entry.live {
            info!("Killing workload {} before delete", id);
            self.send_signal(&target, &live.handle, StopSignal::Kill).await;
            wait_exited(live.exited, KILL_GRACE).await;
        }

        if let Err(e) = self.inner.backend.destroy(&target).await {
            warn!("Failed to destroy backend object of {}: {}", id, e);
        }
        if let Err(e) = self.inner.store.remove(id).await {
            warn!("Failed to remove directories of {}: {}", id, e);
        }
        self.inner.stats.remove(&id);
        self.inner.hub.remove_workload(id);

        info!("Deleted workload {}", id);
        Ok(())
    }

    /// Register a workload whose directory was placed on disk externally.
    pub async fn adopt(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        let mut meta = self.inner.store.load(id).await.map_err(|e| {
            ControllerError::Validation(format!("no usable metadata for {id}: {e}"))
        })?;
        if meta.id != id {
            return Err(ControllerError::Validation(format!(
                "metadata belongs to {}, not {id}",
                meta.id
            )));
        }

        meta.status = WorkloadStatus::Stopped;
        meta.native_id = None;
        meta.backend = self.backend_kind();

        {
            let mut registry = self.inner.registry.lock().await;
            if registry.contains_key(&id) {
                return Err(ControllerError::Conflict(format!(
                    "workload {id} already exists"
                )));
            }
            registry.insert(
                id,
                Entry {
                    meta: meta.clone(),
                    live: None,
                },
            );
        }

        self.inner.store.ensure_dirs(id).await?;
        if let Err(e) = self.inner.backend.prepare(&self.target(&meta)).await {
            warn!("Backend prepare for adopted workload {} failed: {}", id, e);
        }
        self.persist(&meta).await;

        info!("Adopted workload {}", id);
        Ok(meta)
    }

    // ========================================================================
    // Power
    // ========================================================================

    /// Start the workload with an explicit command or its startup template.
    pub async fn start(
        &self,
        id: Uuid,
        command: Option<String>,
        args: Vec<String>,
    ) -> ControllerResult<WorkloadMeta> {
        self.launch(id, RunKind::Server, |meta| meta.resolve_command(command, args))
            .await
    }

    /// Run the install script once; success marks the workload installed.
    pub async fn install(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        self.launch(id, RunKind::Install, |meta| {
            let script = meta
                .install_script
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    ControllerError::Validation(format!("workload {} has no install script", id))
                })?;
            let rendered = super::template::render(script, &meta.template_vars());
            Ok(("/bin/sh".to_string(), vec!["-c".to_string(), rendered]))
        })
        .await
    }

    pub async fn restart(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        self.stop(id, None).await?;
        self.start(id, None, Vec::new()).await
    }

    async fn launch<F>(&self, id: Uuid, kind: RunKind, resolve: F) -> ControllerResult<WorkloadMeta>
    where
        F: FnOnce(&WorkloadMeta) -> ControllerResult<(String, Vec<String>)>,
    {
        // Compare-and-swap to `starting` under the lock.
        let (meta, program, args) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry.get_mut(&id).ok_or(ControllerError::NotFound(id))?;
            if entry.live.is_some() || !entry.meta.status.can_start() {
                return Err(ControllerError::Conflict(format!(
                    "workload {id} is {}",
                    entry.meta.status
                )));
            }
            let (program, args) = resolve(&entry.meta)?;
            entry.meta.status = WorkloadStatus::Starting;
            (entry.meta.clone(), program, args)
        };
        self.publish_status(id, WorkloadStatus::Starting);

        let target = self.target(&meta);
        let spec = LaunchSpec {
            target: target.clone(),
            program,
            args,
            output: OutputSink::new(self.inner.hub.clone(), id),
        };

        let launch = match self.inner.backend.launch(spec).await {
            Ok(launch) => launch,
            Err(e) => {
                warn!("Failed to start workload {}: {}", id, e);
                let failed = {
                    let mut registry = self.inner.registry.lock().await;
                    registry.get_mut(&id).map(|entry| {
                        entry.meta.status = WorkloadStatus::Failed;
                        entry.meta.stopped_at = Some(Utc::now());
                        entry.meta.clone()
                    })
                };
                if let Some(meta) = failed {
                    self.persist(&meta).await;
                    self.publish_status(id, WorkloadStatus::Failed);
                }
                return Err(e.into());
            }
        };

        let handle = NativeHandle {
            native_id: launch.native_id.clone(),
            pid: launch.pid,
        };
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let (exited_tx, exited_rx) = watch::channel(false);

        let meta = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.get_mut(&id) else {
                drop(registry);
                warn!("Workload {} deleted while starting, killing it", id);
                self.send_signal(&target, &handle, StopSignal::Kill).await;
                drop(launch);
                return Err(ControllerError::NotFound(id));
            };

            entry.meta.status = WorkloadStatus::Running;
            entry.meta.started_at = Some(Utc::now());
            entry.meta.stopped_at = None;
            entry.meta.exit_code = None;
            entry.meta.native_id = Some(launch.native_id.clone());
            entry.live = Some(LiveHandle {
                run_id,
                kind,
                handle: handle.clone(),
                input: launch.input.map(|stdin| Arc::new(Mutex::new(stdin))),
                exited: exited_rx,
                stop_requested: false,
            });

            // Spawned under the lock so the exit cannot be recorded before
            // the handle exists.
            tokio::spawn(self.clone().observe(
                id,
                run_id,
                launch.exit,
                exited_tx,
                target,
                handle,
                entry.meta.limits.timeout_secs,
            ));
            entry.meta.clone()
        };

        self.persist(&meta).await;
        self.publish_status(id, WorkloadStatus::Running);
        info!(
            "Workload {} running as {} ({:?})",
            id,
            meta.native_id.as_deref().unwrap_or("?"),
            kind
        );
        Ok(meta)
    }

    async fn observe(
        self,
        id: Uuid,
        run_id: u64,
        mut exit: BoxFuture<'static, i32>,
        exited: watch::Sender<bool>,
        target: Target,
        handle: NativeHandle,
        timeout_secs: u64,
    ) {
        let code = if timeout_secs > 0 {
            tokio::select! {
                code = &mut exit => code,
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                    warn!("Workload {} exceeded its {}s run limit, killing", id, timeout_secs);
                    self.mark_stop_requested(id, run_id).await;
                    self.send_signal(&target, &handle, StopSignal::Kill).await;
                    exit.await
                }
            }
        } else {
            exit.await
        };

        self.on_exit(id, run_id, code).await;
        let _ = exited.send(true);
    }

    async fn mark_stop_requested(&self, id: Uuid, run_id: u64) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(live) = registry
            .get_mut(&id)
            .and_then(|e| e.live.as_mut())
            .filter(|l| l.run_id == run_id)
        {
            live.stop_requested = true;
        }
    }

    async fn on_exit(&self, id: Uuid, run_id: u64, code: i32) {
        let meta = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.get_mut(&id) else {
                debug!("Exit of deleted workload {} ignored", id);
                return;
            };
            if entry.live.as_ref().map(|l| l.run_id) != Some(run_id) {
                return;
            }
            let Some(live) = entry.live.take() else {
                return;
            };

            entry.meta.status = if code == 0 || live.stop_requested {
                WorkloadStatus::Stopped
            } else {
                WorkloadStatus::Failed
            };
            if live.kind == RunKind::Install && code == 0 {
                entry.meta.installed = true;
            }
            entry.meta.exit_code = Some(code);
            entry.meta.stopped_at = Some(Utc::now());
            entry.meta.native_id = None;
            entry.meta.clone()
        };

        self.inner.stats.remove(&id);
        self.persist(&meta).await;
        info!("Workload {} exited with {} ({})", id, code, meta.status);
        self.publish_status(id, meta.status);
        self.inner.hub.publish(id, WorkloadEvent::Exit { code });
    }

    /// Interrupt, then force-kill if the exit does not arrive in time.
    ///
    /// Stopping a workload without a live process is a no-op.
    pub async fn stop(&self, id: Uuid, timeout: Option<Duration>) -> ControllerResult<WorkloadMeta> {
        let (target, handle, exited) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry.get_mut(&id).ok_or(ControllerError::NotFound(id))?;
            if entry.meta.status == WorkloadStatus::Starting {
                return Err(ControllerError::Conflict(format!(
                    "workload {id} is starting"
                )));
            }
            let target = self.target(&entry.meta);
            let Some(live) = entry.live.as_mut() else {
                return Ok(entry.meta.clone());
            };
            live.stop_requested = true;
            entry.meta.status = WorkloadStatus::Stopping;
            (target, live.handle.clone(), live.exited.clone())
        };
        self.publish_status(id, WorkloadStatus::Stopping);

        let timeout = timeout.unwrap_or(self.inner.config.stop_timeout);
        self.send_signal(&target, &handle, StopSignal::Interrupt).await;

        tokio::select! {
            _ = exit_observed(exited.clone()) => {
                debug!("Workload {} stopped after interrupt", id);
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("Workload {} did not stop within {:?}, killing", id, timeout);
                self.send_signal(&target, &handle, StopSignal::Kill).await;
                wait_exited(exited, KILL_GRACE).await;
            }
        }

        self.status(id).await
    }

    /// Force-kill a running workload and wait for its exit.
    pub async fn kill(&self, id: Uuid) -> ControllerResult<WorkloadMeta> {
        let (target, handle, exited) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry.get_mut(&id).ok_or(ControllerError::NotFound(id))?;
            let target = self.target(&entry.meta);
            let Some(live) = entry.live.as_mut() else {
                return Err(ControllerError::Conflict(format!(
                    "workload {id} is not running"
                )));
            };
            live.stop_requested = true;
            (target, live.handle.clone(), live.exited.clone())
        };

        self.send_signal(&target, &handle, StopSignal::Kill).await;
        wait_exited(exited, KILL_GRACE).await;
        self.status(id).await
    }

    async fn send_signal(&self, target: &Target, handle: &NativeHandle, signal: StopSignal) {
        match self.inner.backend.signal(target, handle, signal).await {
            Ok(()) => {}
            Err(BackendError::NotRunning) => debug!("{} already gone", handle.native_id),
            Err(e) => warn!("Failed to send {} to {}: {}", signal.name(), handle.native_id, e),
        }
    }

    /// Write raw input to the workload's stdin.
    pub async fn send_input(&self, id: Uuid, data: &str) -> ControllerResult<()> {
        let input = {
            let registry = self.inner.registry.lock().await;
            let entry = registry.get(&id).ok_or(ControllerError::NotFound(id))?;
            let live = entry
                .live
                .as_ref()
                .filter(|_| entry.meta.status == WorkloadStatus::Running)
                .ok_or_else(|| {
                    ControllerError::Conflict(format!("workload {id} is not running"))
                })?;
            live.input.clone().ok_or_else(|| {
                ControllerError::Conflict(format!("workload {id} does not accept input"))
            })?
        };

        let mut stdin = input.lock().await;
        let write = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => {
                ControllerError::Conflict(format!("workload {id} closed its input"))
            }
            _ => ControllerError::Io(e),
        })
    }

    // ========================================================================
    // Stats and shutdown
    // ========================================================================

    /// Query the backend for every live workload and refresh the cache.
    pub async fn refresh_stats(&self) {
        let live: Vec<(Uuid, u64, Target, NativeHandle)> = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .filter_map(|(id, e)| {
                    e.live
                        .as_ref()
                        .map(|l| (*id, l.run_id, self.target(&e.meta), l.handle.clone()))
                })
                .collect()
        };

        for (id, run_id, target, handle) in live {
            match self.inner.backend.stats(&target, &handle).await {
                Ok(stats) => {
                    if self.store_stats(id, run_id, stats.clone()).await {
                        self.inner.hub.publish(id, WorkloadEvent::Stats(stats));
                    }
                }
                Err(e) => debug!("Stats for {} unavailable: {}", id, e),
            }
        }
    }

    /// Cache a sample taken from run `run_id`, unless that run has since ended.
    async fn store_stats(&self, id: Uuid, run_id: u64, stats: WorkloadStats) -> bool {
        let registry = self.inner.registry.lock().await;
        let current = registry
            .get(&id)
            .and_then(|e| e.live.as_ref())
            .map(|l| l.run_id);
        if current != Some(run_id) {
            debug!("Dropping stale stats sample for {}", id);
            return false;
        }
        self.inner.stats.insert(id, stats);
        true
    }

    /// Stop every live workload concurrently.
    pub async fn shutdown(&self) {
        let ids = self.running_ids().await;
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} running workload(s)", ids.len());
        let results = join_all(ids.iter().map(|id| self.stop(*id, None))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop {} during shutdown: {}", id, e);
            }
        }
    }
}

/// Resolve once the exit watch flips, without holding its borrow guard.
async fn exit_observed(mut exited: watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

/// Wait until the exit watch fires or `limit` passes.
async fn wait_exited(exited: watch::Receiver<bool>, limit: Duration) {
    if tokio::time::timeout(limit, exit_observed(exited)).await.is_err() {
        warn!("Exit not observed within {:?}", limit);
    }
}
