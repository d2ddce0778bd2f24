//! Control channel to the panel.
//!
//! One outbound WebSocket per agent. After connecting the agent sends
//! [`AgentMessage::Auth`] and waits for `auth_ok`; from then on it sends
//! heartbeats and stats on fixed intervals, relays workload status and exit
//! events, and answers every panel command with a `result` frame.
//!
//! Lost connections are retried with [`ReconnectPolicy`]. The failure counter
//! resets after every successful authentication; once it reaches the limit
//! the channel emits [`ChannelEvent::GaveUp`] and stops.

mod backoff;
pub mod dispatch;

pub use backoff::ReconnectPolicy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use keel_protocol::{AgentMessage, PanelMessage, WorkloadSample};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::WorkloadEvent;
use crate::monitor::SharedHostStats;
use crate::workload::WorkloadController;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("connection failed: {0}")]
    Connection(#[from] tungstenite::Error),

    #[error("panel rejected authentication: {0}")]
    AuthRejected(String),

    #[error("no authentication reply within {0:?}")]
    AuthTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PanelResult<T> = Result<T, PanelError>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub token: String,
    pub node_id: String,
    pub heartbeat: Duration,
    pub stats_interval: Duration,
    pub auth_timeout: Duration,
    pub policy: ReconnectPolicy,
    pub relay_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticated,
}

/// Observable progress of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal. No further attempts are made.
    GaveUp { attempts: u32 },
}

pub struct ControlChannel {
    config: ChannelConfig,
    controller: WorkloadController,
    host: SharedHostStats,
    events: Option<mpsc::Sender<ChannelEvent>>,
    started: Instant,
}

impl ControlChannel {
    pub fn new(config: ChannelConfig, controller: WorkloadController, host: SharedHostStats) -> Self {
        Self {
            config,
            controller,
            host,
            events: None,
            started: Instant::now(),
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<ChannelEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn emit(&self, event: ChannelEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Connect and keep reconnecting until the policy gives up.
    pub async fn run(&self) {
        let mut failures = 0u32;

        loop {
            self.emit(ChannelEvent::StateChanged(ChannelState::Connecting))
                .await;
            let result = self.run_once(&mut failures).await;
            self.emit(ChannelEvent::StateChanged(ChannelState::Disconnected))
                .await;

            match result {
                Ok(()) => info!("Control channel closed"),
                Err(e) => warn!("Control channel error: {}", e),
            }

            failures += 1;
            match self.config.policy.next_delay(failures) {
                Some(delay) => {
                    info!(
                        "Reconnecting to panel in {:?} (attempt {})",
                        delay, failures
                    );
                    self.emit(ChannelEvent::Reconnecting {
                        attempt: failures,
                        delay,
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        "Giving up on the panel after {} consecutive failures",
                        failures
                    );
                    self.emit(ChannelEvent::GaveUp { attempts: failures }).await;
                    return;
                }
            }
        }
    }

    /// One connection: connect, authenticate, then serve until it drops.
    async fn run_once(&self, failures: &mut u32) -> PanelResult<()> {
        debug!("Connecting to panel at {}", self.config.url);
        let (ws, _response) = connect_async(self.config.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let auth = AgentMessage::Auth {
            token: self.config.token.clone(),
            node_id: self.config.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        sink.send(encode(&auth)?).await?;

        let reply = timeout(self.config.auth_timeout, async {
            while let Some(frame) = stream.next().await {
                match frame? {
                    WsMessage::Text(text) => {
                        return serde_json::from_str::<PanelMessage>(text.as_str())
                            .map_err(PanelError::from);
                    }
                    WsMessage::Close(frame) => {
                        return Err(PanelError::Closed(close_reason(frame)));
                    }
                    _ => {}
                }
            }
            Err(PanelError::Closed("closed before authentication".to_string()))
        })
        .await
        .map_err(|_| PanelError::AuthTimeout(self.config.auth_timeout))??;

        match reply {
            PanelMessage::AuthOk => {}
            PanelMessage::AuthError { message } => return Err(PanelError::AuthRejected(message)),
            other => {
                return Err(PanelError::Protocol(format!(
                    "expected auth reply, got {other:?}"
                )));
            }
        }

        *failures = 0;
        info!("Authenticated with panel as {}", self.config.node_id);
        self.emit(ChannelEvent::StateChanged(ChannelState::Authenticated))
            .await;

        let mut feed = self.controller.hub().feed();
        let (reply_tx, mut replies) = mpsc::channel::<AgentMessage>(64);
        let mut heartbeat = interval(self.config.heartbeat);
        let mut stats = interval(self.config.stats_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let message = AgentMessage::Heartbeat {
                        uptime_secs: self.started.elapsed().as_secs(),
                        workloads: self.controller.running_ids().await.len(),
                    };
                    sink.send(encode(&message)?).await?;
                }

                _ = stats.tick() => {
                    let message = self.stats_report().await;
                    sink.send(encode(&message)?).await?;
                }

                event = feed.recv() => match event {
                    Ok((id, event)) => {
                        if let Some(message) = relay(id, event, self.config.relay_output) {
                            sink.send(encode(&message)?).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Control channel lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },

                Some(reply) = replies.recv() => {
                    sink.send(encode(&reply)?).await?;
                }

                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str(), &reply_tx),
                    Some(Ok(WsMessage::Ping(data))) => sink.send(WsMessage::Pong(data)).await?,
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(PanelError::Closed(close_reason(frame)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(PanelError::Closed("stream ended".to_string())),
                },
            }
        }
    }

    /// Commands run on their own task so a slow stop never stalls the loop.
    fn handle_text(&self, text: &str, replies: &mpsc::Sender<AgentMessage>) {
        let message = match serde_json::from_str::<PanelMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable panel frame: {}", e);
                let reply = AgentMessage::Result {
                    request_id: None,
                    ok: false,
                    error: Some(format!("invalid message: {e}")),
                };
                let _ = replies.try_send(reply);
                return;
            }
        };

        let controller = self.controller.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatch::dispatch(&controller, message).await {
                let _ = replies.send(reply).await;
            }
        });
    }

    async fn stats_report(&self) -> AgentMessage {
        let host = self.host.read().await.clone();
        let workloads = self
            .controller
            .running_ids()
            .await
            .into_iter()
            .filter_map(|id| {
                self.controller
                    .stats(id)
                    .map(|stats| WorkloadSample {
                        workload_id: id,
                        stats,
                    })
            })
            .collect();
        AgentMessage::Stats { host, workloads }
    }
}

/// Upstream form of a workload event. Stats travel in the periodic report.
fn relay(id: Uuid, event: WorkloadEvent, relay_output: bool) -> Option<AgentMessage> {
    match event {
        WorkloadEvent::Status(status) => Some(AgentMessage::Status {
            workload_id: id,
            status,
            power: status.into(),
        }),
        WorkloadEvent::Exit { code } => Some(AgentMessage::Exit {
            workload_id: id,
            code,
        }),
        WorkloadEvent::Output { stream, line } if relay_output => Some(AgentMessage::Output {
            workload_id: id,
            stream,
            data: line,
        }),
        WorkloadEvent::Output { .. } | WorkloadEvent::Stats(_) => None,
    }
}

fn encode(message: &AgentMessage) -> PanelResult<WsMessage> {
    Ok(WsMessage::text(serde_json::to_string(message)?))
}

fn close_reason(frame: Option<tungstenite::protocol::CloseFrame>) -> String {
    frame.map_or_else(
        || "closed by panel".to_string(),
        |f| f.reason.as_str().to_string(),
    )
}
