//! Control channel against an in-process fake panel.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use keel::panel::{ChannelConfig, ChannelEvent, ChannelState, ControlChannel, ReconnectPolicy};
use keel_protocol::{AgentMessage, PanelMessage, PowerAction, WorkloadStatus};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

mod common;
use common::test_app;

type PanelSocket = WebSocketStream<TcpStream>;

fn channel_config(url: String, max_attempts: u32) -> ChannelConfig {
    ChannelConfig {
        url,
        token: "node-secret".to_string(),
        node_id: "node-1".to_string(),
        heartbeat: Duration::from_millis(100),
        stats_interval: Duration::from_millis(150),
        auth_timeout: Duration::from_secs(2),
        policy: ReconnectPolicy::new(Duration::from_millis(10), max_attempts),
        relay_output: false,
    }
}

async fn accept(listener: &TcpListener) -> PanelSocket {
    let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("agent never connected")
        .unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn send(socket: &mut PanelSocket, message: &PanelMessage) {
    socket
        .send(WsMessage::text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

/// Read agent frames until one matches.
async fn expect<F>(socket: &mut PanelSocket, mut matches: F) -> AgentMessage
where
    F: FnMut(&AgentMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let frame = socket.next().await.expect("agent hung up").unwrap();
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let message: AgentMessage = serde_json::from_str(text.as_str()).unwrap();
            if matches(&message) {
                return message;
            }
        }
    })
    .await
    .expect("expected frame never arrived")
}

fn is_result(request_id: &'static str) -> impl FnMut(&AgentMessage) -> bool {
    move |m| matches!(m, AgentMessage::Result { request_id: Some(r), .. } if r == request_id)
}

#[tokio::test]
async fn test_authenticate_and_serve_commands() {
    let app = test_app();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (events_tx, mut events) = mpsc::channel(64);
    let channel = ControlChannel::new(
        channel_config(url, 3),
        app.controller.clone(),
        Arc::new(tokio::sync::RwLock::new(Default::default())),
    )
    .with_event_channel(events_tx);
    let task = Arc::new(channel).spawn();

    let mut panel = accept(&listener).await;
    match expect(&mut panel, |_| true).await {
        AgentMessage::Auth { token, node_id, .. } => {
            assert_eq!(token, "node-secret");
            assert_eq!(node_id, "node-1");
        }
        other => panic!("expected auth first, got {other:?}"),
    }
    send(&mut panel, &PanelMessage::AuthOk).await;

    let authenticated = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == ChannelEvent::StateChanged(ChannelState::Authenticated) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(authenticated);

    expect(&mut panel, |m| matches!(m, AgentMessage::Heartbeat { .. })).await;
    expect(&mut panel, |m| matches!(m, AgentMessage::Stats { .. })).await;

    let id = Uuid::new_v4();
    send(
        &mut panel,
        &PanelMessage::Create {
            request_id: Some("create-1".to_string()),
            workload_id: id,
            spec: json!({"startup": "echo panel", "limits": {"memory": "64MiB"}}),
        },
    )
    .await;
    match expect(&mut panel, is_result("create-1")).await {
        AgentMessage::Result { ok, error, .. } => assert!(ok, "{error:?}"),
        _ => unreachable!(),
    }
    assert_eq!(app.controller.status(id).await.unwrap().limits.memory_mb, 64);

    send(
        &mut panel,
        &PanelMessage::Power {
            request_id: Some("start-1".to_string()),
            workload_id: id,
            action: PowerAction::Start,
        },
    )
    .await;
    let exit = expect(&mut panel, |m| matches!(m, AgentMessage::Exit { .. })).await;
    assert_eq!(exit, AgentMessage::Exit { workload_id: id, code: 0 });
    assert_eq!(
        app.controller.status(id).await.unwrap().status,
        WorkloadStatus::Stopped
    );

    send(
        &mut panel,
        &PanelMessage::Delete {
            request_id: Some("delete-1".to_string()),
            workload_id: id,
        },
    )
    .await;
    match expect(&mut panel, is_result("delete-1")).await {
        AgentMessage::Result { ok, .. } => assert!(ok),
        _ => unreachable!(),
    }
    assert!(!app.controller.exists(id).await);

    // Commands for unknown workloads fail without dropping the session.
    send(
        &mut panel,
        &PanelMessage::Power {
            request_id: Some("kill-1".to_string()),
            workload_id: id,
            action: PowerAction::Kill,
        },
    )
    .await;
    match expect(&mut panel, is_result("kill-1")).await {
        AgentMessage::Result { ok, error, .. } => {
            assert!(!ok);
            assert!(error.is_some());
        }
        _ => unreachable!(),
    }

    task.abort();
}

#[tokio::test]
async fn test_rejected_auth_gives_up() {
    let app = test_app();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (events_tx, mut events) = mpsc::channel(64);
    let channel = ControlChannel::new(
        channel_config(url, 2),
        app.controller.clone(),
        Arc::new(tokio::sync::RwLock::new(Default::default())),
    )
    .with_event_channel(events_tx);
    let task = Arc::new(channel).spawn();

    for _ in 0..2 {
        let mut panel = accept(&listener).await;
        expect(&mut panel, |m| matches!(m, AgentMessage::Auth { .. })).await;
        send(
            &mut panel,
            &PanelMessage::AuthError {
                message: "unknown node".to_string(),
            },
        )
        .await;
    }

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, ChannelEvent::GaveUp { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(seen.contains(&ChannelEvent::Reconnecting {
        attempt: 1,
        delay: Duration::from_millis(10),
    }));
    assert_eq!(seen.last(), Some(&ChannelEvent::GaveUp { attempts: 2 }));

    // The loop has ended; nothing reconnects.
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("channel task still running")
        .unwrap();
    let again = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(again.is_err());
}
