//! Relay counters for observability

use serde::{Deserialize, Serialize};

use crate::registry::Delivery;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Raw messages received from ports
    pub messages_received: u64,
    /// INIT messages accepted
    pub connections_opened: u64,
    /// UPDATE messages that became transactions
    pub updates_applied: u64,
    /// Messages dropped as malformed, undecodable or out of place
    pub messages_dropped: u64,
    /// Messages ignored as protocol noise
    pub messages_ignored: u64,
    /// Non-final chunks received
    pub chunks_buffered: u64,
    /// Outbound messages queued to subscribers
    pub broadcasts_sent: u64,
    /// Outbound messages a full or closed port could not take
    pub broadcasts_dropped: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivery(&mut self, delivery: Delivery) {
        self.broadcasts_sent += delivery.sent as u64;
        self.broadcasts_dropped += delivery.dropped as u64;
    }
}
