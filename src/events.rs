//! Events pushed toward the presentation layer.
//!
//! Every subscriber holds a [`Subscription`]; dropping it is the only way to
//! unsubscribe, so a listener can never outlive its handle.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, trace, warn};

use crate::{
    diagnostics::RuntimeDiagnostics,
    model::{ConnectionState, Message},
    notifications::NotificationContent,
    pause::PauseMode,
};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum CoreEvent {
    ConnectionState(ConnectionState),
    ConnectionError(String),
    MessageReceived(Message),
    MessagesUpdated(Vec<Message>),
    RuntimeDiagnostics(RuntimeDiagnostics),
    NotificationsPausedUntil {
        until: u64,
        mode: Option<PauseMode>,
    },
    NotificationsResumed,
    NotificationMessage {
        message: Message,
        content: NotificationContent,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ConnectionState(_) => "connection-state",
            CoreEvent::ConnectionError(_) => "connection-error",
            CoreEvent::MessageReceived(_) => "message-received",
            CoreEvent::MessagesUpdated(_) => "messages-updated",
            CoreEvent::RuntimeDiagnostics(_) => "runtime-diagnostics",
            CoreEvent::NotificationsPausedUntil { .. } => "notifications-paused-until",
            CoreEvent::NotificationsResumed => "notifications-resumed",
            CoreEvent::NotificationMessage { .. } => "notification-message",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "event emitted"),
            Err(_) => trace!(event = name, "event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        debug!(subscribers = self.tx.receiver_count() + 1, "event subscription acquired");
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<CoreEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. A slow reader skips what it missed.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("event subscription released");
    }
}
