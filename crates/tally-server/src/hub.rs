//! Subscriber registry and tally fan-out.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use tally_core::{ChannelName, ConnectionId, DeliveryError, Tally};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::ServerMessage;

/// A connected subscriber: its outbox and the channels it joined.
struct Subscriber {
    tx: mpsc::Sender<String>,
    channels: HashSet<ChannelName>,
}

/// Outcome of one publish call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
}

/// Registry of live subscriber connections grouped into channels.
///
/// Channel membership is bookkeeping only: [`BroadcastHub::publish`] reaches
/// every connection regardless of the channels it joined.
pub struct BroadcastHub {
    subscribers: DashMap<ConnectionId, Subscriber>,
    max_send_queue: usize,
    welcome_text: String,
}

impl BroadcastHub {
    pub fn new(max_send_queue: usize, welcome_text: impl Into<String>) -> Self {
        Self {
            subscribers: DashMap::new(),
            max_send_queue,
            welcome_text: welcome_text.into(),
        }
    }

    /// Register a new connection and return its ID + outbox receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                tx,
                channels: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Send the greeting to this connection only.
    pub fn on_connect(&self, id: &ConnectionId) -> Result<(), DeliveryError> {
        let message = ServerMessage::Welcome {
            text: self.welcome_text.clone(),
        };
        let result = message
            .to_text()
            .map_err(|e| DeliveryError::Encode(e.to_string()))
            .and_then(|text| self.send_to(id, text));
        if let Err(e) = &result {
            warn!(connection_id = %id, error = %e, "failed to send welcome");
        }
        result
    }

    /// Add `id` to `channel`. Returns false if it was already a member or the
    /// connection is gone.
    pub fn subscribe(&self, id: &ConnectionId, channel: ChannelName) -> bool {
        let Some(mut subscriber) = self.subscribers.get_mut(id) else {
            debug!(connection_id = %id, channel = %channel, "subscribe from unknown connection");
            return false;
        };
        let added = subscriber.channels.insert(channel.clone());
        debug!(connection_id = %id, channel = %channel, added, "subscribe");
        added
    }

    /// Forget the connection and all its subscriptions. Returns how many
    /// subscriptions were dropped.
    pub fn on_disconnect(&self, id: &ConnectionId) -> usize {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                debug!(
                    connection_id = %id,
                    subscriptions = subscriber.channels.len(),
                    "connection removed"
                );
                subscriber.channels.len()
            }
            None => 0,
        }
    }

    /// Push a `scores` message to every connection. Never blocks: a full or
    /// closed outbox only fails that one delivery.
    pub fn publish(&self, tally: &Tally) -> DeliveryReport {
        let text = match ServerMessage::scores(tally).and_then(|m| m.to_text()) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialize tally");
                return DeliveryReport::default();
            }
        };
        self.broadcast(&text)
    }

    /// Deliver raw text to every connection.
    pub fn broadcast(&self, text: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for entry in self.subscribers.iter() {
            match try_deliver(&entry.value().tx, text.to_owned()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(connection_id = %entry.key(), error = %e, "delivery failed");
                }
            }
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast"
        );
        report
    }

    /// Send a message to one connection.
    pub fn send_to(&self, id: &ConnectionId, text: String) -> Result<(), DeliveryError> {
        let tx = self
            .subscribers
            .get(id)
            .map(|s| s.tx.clone())
            .ok_or(DeliveryError::UnknownConnection)?;
        try_deliver(&tx, text)
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Channels a connection has joined, sorted by name.
    pub fn channels_of(&self, id: &ConnectionId) -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = self
            .subscribers
            .get(id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Connections that joined `channel`.
    pub fn members(&self, channel: &ChannelName) -> Vec<ConnectionId> {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().channels.contains(channel))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of connected subscribers.
    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> HubStats {
        let mut channels = HashSet::new();
        let mut subscriptions = 0;
        for entry in self.subscribers.iter() {
            subscriptions += entry.value().channels.len();
            channels.extend(entry.value().channels.iter().cloned());
        }
        HubStats {
            connections: self.subscribers.len(),
            channels: channels.len(),
            subscriptions,
        }
    }
}

fn try_deliver(tx: &mpsc::Sender<String>, text: String) -> Result<(), DeliveryError> {
    tx.try_send(text).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
    })
}
