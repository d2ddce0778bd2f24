//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use keel::api::{AppState, create_router};
use keel::backend::{BareProcessBackend, ProcessConfig};
use keel::events::EventHub;
use keel::monitor::SharedHostStats;
use keel::transfer::{TargetClient, TransferService};
use keel::workload::{ControllerConfig, WorkloadController, WorkloadStore};
use keel_protocol::HostStats;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tower::ServiceExt;

pub const TEST_TOKEN: &str = "test-token";

/// A fully wired agent over the bare process backend, rooted in a temp dir.
pub struct TestApp {
    pub dir: TempDir,
    pub router: Router,
    pub controller: WorkloadController,
    pub transfers: Arc<TransferService>,
}

pub fn test_app() -> TestApp {
    test_app_with(Duration::ZERO)
}

/// Build an app whose create endpoint allows one request per `create_interval`.
pub fn test_app_with(create_interval: Duration) -> TestApp {
    let dir = TempDir::new().expect("create temp dir");
    let controller = WorkloadController::new(
        WorkloadStore::new(dir.path()),
        Arc::new(BareProcessBackend::new(ProcessConfig::default())),
        Arc::new(EventHub::new()),
        ControllerConfig {
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    );
    let client = TargetClient::new(Duration::from_secs(5), Duration::from_secs(30))
        .expect("build transfer client");
    let transfers = Arc::new(TransferService::new(controller.clone(), client, dir.path()));
    let host: SharedHostStats = Arc::new(RwLock::new(HostStats::default()));

    let state = AppState::new(controller.clone(), transfers.clone(), host, TEST_TOKEN)
        .with_create_interval(create_interval)
        .with_stop_timeout(Duration::from_secs(2));

    TestApp {
        dir,
        router: create_router(state),
        controller,
        transfers,
    }
}

impl TestApp {
    /// Send an authenticated JSON request and decode the JSON response.
    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"));
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
        };
        (status, json)
    }

    /// Poll a workload until its status matches or the deadline passes.
    pub async fn wait_for_status(&self, id: &str, status: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (code, body) = self.call(Method::GET, &format!("/sandboxes/{id}"), None).await;
            assert_eq!(code, StatusCode::OK, "{body}");
            if body["status"] == status {
                return body;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workload {id} never reached {status}, last: {body}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
