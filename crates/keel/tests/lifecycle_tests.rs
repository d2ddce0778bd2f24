//! End-to-end workload lifecycle over HTTP and the console WebSocket.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use futures::{SinkExt, StreamExt};
use keel_protocol::{ServerMessage, WorkloadStatus};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

mod common;
use common::{TEST_TOKEN, TestApp, test_app};

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Read console messages until `stop` returns true or the deadline passes.
async fn collect_until<S>(
    socket: &mut S,
    mut stop: impl FnMut(&ServerMessage) -> bool,
) -> Vec<ServerMessage>
where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(frame) = socket.next().await {
            let WsMessage::Text(text) = frame.unwrap() else {
                continue;
            };
            let msg: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
            let done = stop(&msg);
            seen.push(msg);
            if done {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out, saw {seen:?}");
    seen
}

#[tokio::test]
async fn test_short_lived_workload_over_console() {
    let app = test_app();
    let (status, meta) = app
        .call(
            Method::POST,
            "/sandboxes",
            Some(json!({"startup": "echo hello from {{SERVER_UUID}}", "limits": {"memory": 128}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(meta["limits"]["memory_mb"], 128);
    let id = meta["id"].as_str().unwrap().to_string();

    let addr = serve(&app).await;
    let url = format!("ws://{addr}/sandboxes/{id}/ws?token={TEST_TOKEN}");
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let first = collect_until(&mut socket, |_| true).await;
    assert_eq!(
        first,
        vec![ServerMessage::Status {
            status: WorkloadStatus::Created
        }]
    );

    socket
        .send(WsMessage::text(json!({"type": "start"}).to_string()))
        .await
        .unwrap();

    let seen = collect_until(&mut socket, |m| matches!(m, ServerMessage::Exit { .. })).await;

    let expected_line = format!("hello from {id}");
    assert!(
        seen.iter().any(|m| matches!(
            m,
            ServerMessage::Output { data, .. } if *data == expected_line
        )),
        "no output in {seen:?}"
    );
    assert!(seen.contains(&ServerMessage::Status {
        status: WorkloadStatus::Running
    }));
    assert!(seen.contains(&ServerMessage::Status {
        status: WorkloadStatus::Stopped
    }));
    assert_eq!(seen.last(), Some(&ServerMessage::Exit { code: 0 }));

    let (_, meta) = app.call(Method::GET, &format!("/sandboxes/{id}"), None).await;
    assert_eq!(meta["status"], "stopped");
    assert_eq!(meta["exitCode"], 0);
}

#[tokio::test]
async fn test_console_errors_keep_socket_open() {
    let app = test_app();
    let (_, meta) = app
        .call(Method::POST, "/sandboxes", Some(json!({"startup": "cat"})))
        .await;
    let id = meta["id"].as_str().unwrap().to_string();

    let addr = serve(&app).await;
    let url = format!("ws://{addr}/sandboxes/{id}/ws?token={TEST_TOKEN}");
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    collect_until(&mut socket, |_| true).await;

    // Input to a stopped workload fails but the console stays usable.
    socket
        .send(WsMessage::text(json!({"type": "input", "data": "x\n"}).to_string()))
        .await
        .unwrap();
    let seen = collect_until(&mut socket, |m| matches!(m, ServerMessage::Error { .. })).await;
    assert!(matches!(seen.last(), Some(ServerMessage::Error { .. })));

    socket
        .send(WsMessage::text("not json".to_string()))
        .await
        .unwrap();
    collect_until(&mut socket, |m| matches!(m, ServerMessage::Error { .. })).await;

    socket
        .send(WsMessage::text(json!({"type": "start"}).to_string()))
        .await
        .unwrap();
    collect_until(&mut socket, |m| {
        *m == ServerMessage::Status {
            status: WorkloadStatus::Running,
        }
    })
    .await;

    socket
        .send(WsMessage::text(json!({"type": "input", "data": "echoed\n"}).to_string()))
        .await
        .unwrap();
    collect_until(&mut socket, |m| {
        matches!(m, ServerMessage::Output { data, .. } if data == "echoed")
    })
    .await;

    socket
        .send(WsMessage::text(json!({"type": "kill"}).to_string()))
        .await
        .unwrap();
    let seen = collect_until(&mut socket, |m| matches!(m, ServerMessage::Exit { .. })).await;
    assert!(matches!(seen.last(), Some(ServerMessage::Exit { code }) if *code != 0));

    let (_, meta) = app.call(Method::GET, &format!("/sandboxes/{id}"), None).await;
    assert_eq!(meta["status"], "stopped");
}

#[tokio::test]
async fn test_console_for_unknown_workload_is_refused() {
    let app = test_app();
    let addr = serve(&app).await;
    let url = format!(
        "ws://{addr}/sandboxes/{}/ws?token={TEST_TOKEN}",
        uuid::Uuid::new_v4()
    );
    let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_workload_is_failed() {
    let app = test_app();
    let (_, meta) = app
        .call(Method::POST, "/sandboxes", Some(json!({"startup": "exit 3"})))
        .await;
    let id = meta["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .call(Method::POST, &format!("/sandboxes/{id}/start"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let meta = app.wait_for_status(&id, "failed").await;
    assert_eq!(meta["exitCode"], 3);
}

#[tokio::test]
async fn test_install_then_restart() {
    let app = test_app();
    let (_, meta) = app
        .call(
            Method::POST,
            "/sandboxes",
            Some(json!({"startup": "sleep 30", "installScript": "echo ok > installed.txt"})),
        )
        .await;
    let id = meta["id"].as_str().unwrap().to_string();
    assert_eq!(meta["installed"], false);

    let (status, _) = app
        .call(Method::POST, &format!("/sandboxes/{id}/install"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let meta = app.wait_for_status(&id, "stopped").await;
    assert_eq!(meta["installed"], true);

    let (status, _) = app
        .call(Method::POST, &format!("/sandboxes/{id}/start"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, meta) = app
        .call(Method::POST, &format!("/sandboxes/{id}/restart"), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{meta}");
    assert_eq!(meta["status"], "running");

    let (status, meta) = app
        .call(Method::POST, &format!("/sandboxes/{id}/kill"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(meta["status"], "stopped");
}
