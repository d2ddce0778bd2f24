//! Application state shared across handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::monitor::SharedHostStats;
use crate::transfer::TransferService;
use crate::workload::WorkloadController;

use super::rate_limit::CreateLimiter;

/// Shared state for the HTTP and WebSocket API.
#[derive(Clone)]
pub struct AppState {
    pub controller: WorkloadController,
    pub transfers: Arc<TransferService>,
    pub host: SharedHostStats,
    /// Bearer token required on protected routes. Empty disables the check.
    pub auth_token: Arc<String>,
    pub create_limiter: Arc<CreateLimiter>,
    pub cors_origins: Arc<Vec<String>>,
    pub started: Instant,
    /// Default grace period for stop requests without a timeout.
    pub stop_timeout: Duration,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        controller: WorkloadController,
        transfers: Arc<TransferService>,
        host: SharedHostStats,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            transfers,
            host,
            auth_token: Arc::new(auth_token.into()),
            create_limiter: Arc::new(CreateLimiter::new(Duration::from_millis(500))),
            cors_origins: Arc::new(Vec::new()),
            started: Instant::now(),
            stop_timeout: Duration::from_secs(10),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }

    pub fn with_create_interval(mut self, interval: Duration) -> Self {
        self.create_limiter = Arc::new(CreateLimiter::new(interval));
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Arc::new(origins);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}
