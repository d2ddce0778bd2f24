//! Periodic host and workload sampling.

pub mod host;

use std::sync::Arc;
use std::time::Duration;

use keel_protocol::HostStats;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::workload::WorkloadController;
use host::HostSampler;

/// Latest host snapshot, replaced as a whole on every tick.
pub type SharedHostStats = Arc<RwLock<HostStats>>;

pub struct Monitor {
    controller: WorkloadController,
    host: SharedHostStats,
    sampler: Mutex<HostSampler>,
    interval: Duration,
}

impl Monitor {
    pub fn new(controller: WorkloadController, interval: Duration) -> Self {
        Self {
            controller,
            host: Arc::new(RwLock::new(HostStats::default())),
            sampler: Mutex::new(HostSampler::new()),
            interval,
        }
    }

    pub fn host_stats(&self) -> SharedHostStats {
        self.host.clone()
    }

    /// One sampling pass: host snapshot, then every running workload.
    pub async fn tick(&self) {
        let snapshot = self.sampler.lock().await.sample().await;
        *self.host.write().await = snapshot;
        self.controller.refresh_stats().await;
    }

    /// Run [`Monitor::tick`] on a fixed interval until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!("Monitor sampling every {:?}", self.interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
                debug!("Monitor tick complete");
            }
        })
    }
}
