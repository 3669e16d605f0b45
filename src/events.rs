use std::time::Duration;

use tokio::sync::broadcast;

use crate::{
    model::{ConnectionStatus, SessionId},
    topics::PushMessage,
};

/// Receiver side of the event bus.
pub type EventStream = broadcast::Receiver<LiveEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorCollection {
    Tasks,
    Queues,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    ConnectionState(ConnectionStatus),
    ConnectionError(String),
    /// The push channel dropped without a local disconnect.
    ConnectionLost {
        session: Option<SessionId>,
        reason: String,
    },
    Push(PushMessage),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectCountdown {
        seconds_remaining: u64,
    },
    Reconnected {
        session: Option<SessionId>,
    },
    ReconnectGaveUp {
        attempts: u32,
    },
    NotificationsChanged {
        total: usize,
        unread: usize,
    },
    MirrorRefreshed(MirrorCollection),
}

/// Typed fan-out between components. Dropping every receiver ends the
/// subscription; emission never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    event_tx: broadcast::Sender<LiveEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: LiveEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}
