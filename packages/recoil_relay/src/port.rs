use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::protocol::{DEFAULT_CONNECTION_NAME, ServerMessage};

/// Unique identifier for a transport port (one per socket)
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u64);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// Identifier of an instrumented page (its tab id, 0 when unavailable)
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        ConnectionId(id)
    }
}

/// One end of a bidirectional transport, as seen by the relay.
///
/// Outbound delivery never waits: a full or closed channel drops the message
/// so a slow panel cannot stall the relay for everyone else.
#[derive(Clone, Debug)]
pub struct Port {
    pub id: PortId,
    name: Option<String>,
    tab_id: Option<u32>,
    tx: mpsc::Sender<ServerMessage>,
}

impl Port {
    pub fn new(
        id: PortId,
        name: Option<String>,
        tab_id: Option<u32>,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            name,
            tab_id,
            tx,
        }
    }

    /// Devtools panels have no tab, so they all map to connection 0.
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId(self.tab_id.unwrap_or(0))
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_string())
    }

    /// Queue a message for this port. Returns false if it was dropped.
    pub fn post(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(port = %self.id, "outbound channel full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(port = %self.id, "outbound channel closed, dropping message");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
