//! Per-workload console WebSocket.
//!
//! After the upgrade the client receives the current status, then every event
//! the workload emits. Client commands run on their own tasks so a slow stop
//! never blocks output delivery; their failures come back as `error` messages.

use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use keel_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::workload::{ControllerResult, WorkloadController};

use super::error::ApiResult;
use super::extract::ApiPath;
use super::state::AppState;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// GET /sandboxes/{id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    // Unknown workloads are refused before the upgrade.
    state.controller.status(id).await?;
    info!(workload_id = %id, "Console WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, id: Uuid) {
    let controller = state.controller.clone();
    let hub = controller.hub().clone();
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = hub.subscribe(id);

    let initial = match controller.status(id).await {
        Ok(meta) => ServerMessage::Status {
            status: meta.status,
        },
        Err(e) => ServerMessage::Error {
            message: e.to_string(),
        },
    };
    if send(&mut sender, &initial).await.is_err() {
        hub.unsubscribe(id, subscription.id);
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(16);
    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            event = subscription.events.recv() => {
                let Some(event) = event else {
                    debug!(workload_id = %id, "Workload removed, closing console");
                    break;
                };
                if send(&mut sender, &ServerMessage::from(event)).await.is_err() {
                    break;
                }
            }

            Some(reply) = reply_rx.recv() => {
                if send(&mut sender, &reply).await.is_err() {
                    break;
                }
            }

            _ = ping.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(cmd) => {
                                let controller = controller.clone();
                                let reply_tx = reply_tx.clone();
                                let stop_timeout = state.stop_timeout;
                                tokio::spawn(async move {
                                    if let Err(e) = run_command(&controller, id, cmd, stop_timeout).await {
                                        let _ = reply_tx
                                            .send(ServerMessage::Error { message: e.to_string() })
                                            .await;
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(workload_id = %id, "Invalid console message: {}", e);
                                let msg = ServerMessage::Error {
                                    message: format!("invalid message: {e}"),
                                };
                                if send(&mut sender, &msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(workload_id = %id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    hub.unsubscribe(id, subscription.id);
    info!(workload_id = %id, "Console WebSocket closed");
}

async fn run_command(
    controller: &WorkloadController,
    id: Uuid,
    cmd: ClientMessage,
    stop_timeout: Duration,
) -> ControllerResult<()> {
    match cmd {
        ClientMessage::Input { data } => controller.send_input(id, &data).await,
        ClientMessage::Start => controller.start(id, None, Vec::new()).await.map(|_| ()),
        ClientMessage::Stop { timeout } => {
            let timeout = timeout.map(Duration::from_secs).unwrap_or(stop_timeout);
            controller.stop(id, Some(timeout)).await.map(|_| ())
        }
        ClientMessage::Kill => controller.kill(id).await.map(|_| ()),
    }
}

async fn send<S>(sender: &mut S, msg: &ServerMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize console message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
