//! Push-event boundary between the core and its caller.
//!
//! The caller registers interest per channel and receives events over a
//! bounded queue. The core never holds caller-side closures, only the
//! subscription id and its buffer; a subscriber that stops draining loses
//! newest events instead of blocking connection I/O.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffered events per subscriber
const SUBSCRIBER_BUFFER: usize = 1024;

/// The push channels exposed to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventChannel {
    FileChanged,
    TerminalData,
    TerminalClose,
    TerminalError,
}

/// A pushed event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    FileChanged {
        local_path: String,
        remote_path: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalData {
        connection_id: String,
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalClose {
        connection_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalError {
        connection_id: String,
        message: String,
    },
}

impl Event {
    pub fn channel(&self) -> EventChannel {
        match self {
            Event::FileChanged { .. } => EventChannel::FileChanged,
            Event::TerminalData { .. } => EventChannel::TerminalData,
            Event::TerminalClose { .. } => EventChannel::TerminalClose,
            Event::TerminalError { .. } => EventChannel::TerminalError,
        }
    }
}

/// Fan-out bus for push events
pub struct EventBus {
    subscribers: DashMap<EventChannel, Vec<(String, mpsc::Sender<Event>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Subscribe to a channel; returns the subscription id and the receiver
    pub fn subscribe(&self, channel: EventChannel) -> (String, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .entry(channel)
            .or_default()
            .push((id.clone(), tx));

        tracing::debug!("Subscribed {} to {:?}", id, channel);
        (id, rx)
    }

    /// Remove a single subscription by id; unknown ids are a no-op
    pub fn unsubscribe(&self, subscription_id: &str) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|(id, _)| id != subscription_id);
        }
    }

    /// Remove every subscription registered on a channel
    pub fn unsubscribe_all(&self, channel: EventChannel) {
        if let Some(mut entry) = self.subscribers.get_mut(&channel) {
            entry.value_mut().clear();
        }
    }

    /// Push an event to every live subscriber of its channel.
    ///
    /// Delivery is best-effort: a full subscriber buffer drops this event
    /// for that subscriber only, and closed receivers are pruned.
    pub fn emit(&self, event: Event) {
        let channel = event.channel();
        let Some(mut entry) = self.subscribers.get_mut(&channel) else {
            return;
        };

        entry.value_mut().retain(|(id, tx)| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Subscriber {} lagging on {:?}, event dropped", id, channel);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: EventChannel) -> usize {
        self.subscribers.get(&channel).map_or(0, |v| v.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
