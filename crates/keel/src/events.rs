//! Workload event fan-out.
//!
//! Every workload has an explicit list of subscribers (console WebSockets).
//! A single broadcast feed additionally carries every event of every workload
//! for consumers that want all of them, such as the control channel.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use keel_protocol::{OutputStream, ServerMessage, WorkloadStats, WorkloadStatus};
use log::{debug, info};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Size of the broadcast feed.
const FEED_BUFFER_SIZE: usize = 1024;

/// Size of the per-subscriber buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadEvent {
    Output { stream: OutputStream, line: String },
    Status(WorkloadStatus),
    Stats(WorkloadStats),
    Exit { code: i32 },
}

impl From<WorkloadEvent> for ServerMessage {
    fn from(event: WorkloadEvent) -> Self {
        match event {
            WorkloadEvent::Output { stream, line } => ServerMessage::Output { stream, data: line },
            WorkloadEvent::Status(status) => ServerMessage::Status { status },
            WorkloadEvent::Stats(stats) => ServerMessage::Stats { stats },
            WorkloadEvent::Exit { code } => ServerMessage::Exit { code },
        }
    }
}

/// A live subscription to one workload's events.
pub struct Subscription {
    pub id: u64,
    pub workload_id: Uuid,
    pub events: mpsc::Receiver<WorkloadEvent>,
}

pub struct EventHub {
    /// Workload ID -> subscribers
    subscribers: DashMap<Uuid, Vec<(u64, mpsc::Sender<WorkloadEvent>)>>,
    next_id: AtomicU64,
    feed: broadcast::Sender<(Uuid, WorkloadEvent)>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER_SIZE);
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            feed,
        }
    }

    pub fn subscribe(&self, workload_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entry(workload_id).or_default().push((id, tx));
        info!("Subscriber {} attached to workload {}", id, workload_id);
        Subscription {
            id,
            workload_id,
            events: rx,
        }
    }

    pub fn unsubscribe(&self, workload_id: Uuid, subscriber: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(&workload_id) {
            subs.retain(|(id, _)| *id != subscriber);
            info!("Subscriber {} detached from workload {}", subscriber, workload_id);
        }
        self.subscribers.remove_if(&workload_id, |_, subs| subs.is_empty());
    }

    /// Deliver an event to the workload's subscribers and the global feed.
    ///
    /// Never blocks: a subscriber whose buffer is full misses the event, a
    /// subscriber whose receiver is gone is dropped.
    pub fn publish(&self, workload_id: Uuid, event: WorkloadEvent) {
        if let Some(mut subs) = self.subscribers.get_mut(&workload_id) {
            subs.retain(|(id, tx)| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Subscriber {} lagging, dropped event", id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        let _ = self.feed.send((workload_id, event));
    }

    /// Receive every event of every workload.
    pub fn feed(&self) -> broadcast::Receiver<(Uuid, WorkloadEvent)> {
        self.feed.subscribe()
    }

    pub fn subscriber_count(&self, workload_id: Uuid) -> usize {
        self.subscribers
            .get(&workload_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drop all subscribers of a deleted workload, closing their streams.
    pub fn remove_workload(&self, workload_id: Uuid) {
        self.subscribers.remove(&workload_id);
    }
}

/// Sink handed to backends for forwarding process output.
#[derive(Clone)]
pub struct OutputSink {
    hub: std::sync::Arc<EventHub>,
    workload_id: Uuid,
}

impl OutputSink {
    pub fn new(hub: std::sync::Arc<EventHub>, workload_id: Uuid) -> Self {
        Self { hub, workload_id }
    }

    pub fn emit(&self, stream: OutputStream, line: String) {
        self.hub
            .publish(self.workload_id, WorkloadEvent::Output { stream, line });
    }
}
