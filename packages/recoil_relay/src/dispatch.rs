//! Relay Dispatcher
//!
//! Routes each inbound message to the registry or the port's chunk
//! reassembler. The relay is a plain value with no interior locking: its
//! owner feeds it one event at a time, and each event's effects (store
//! update plus rebroadcast) complete before the call returns.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::chunk::{ChunkReassembler, DEFAULT_MAX_MESSAGE_BYTES};
use crate::error::RelayError;
use crate::port::{ConnectionId, Port, PortId};
use crate::protocol::{ConnectionStatus, InboundMessage, InitData};
use crate::registry::{ConnectionRegistry, DEFAULT_PERSISTENCE_LIMIT};
use crate::stats::RelayStats;
use crate::store::TxId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Persistence limit for pages whose INIT does not carry one
    pub default_persistence_limit: usize,
    /// Chunk bytes a port may buffer across all of its pending transfers
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_persistence_limit: DEFAULT_PERSISTENCE_LIMIT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// What became of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected(ConnectionId),
    Updated {
        connection_id: ConnectionId,
        transaction_id: TxId,
    },
    Subscribed,
    /// A chunk was stored; the message is not complete yet
    Buffered,
    /// Protocol noise
    Ignored,
    Dropped(RelayError),
}

/// Per-port state, torn down with the port
struct PortSession {
    port: Port,
    is_subscriber: bool,
    chunks: ChunkReassembler,
}

pub struct Relay {
    config: RelayConfig,
    registry: ConnectionRegistry,
    sessions: HashMap<PortId, PortSession>,
    stats: RelayStats,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.default_persistence_limit),
            sessions: HashMap::new(),
            stats: RelayStats::new(),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn open_ports(&self) -> usize {
        self.sessions.len()
    }

    /// Start accepting messages from `port`.
    pub fn open_port(&mut self, port: Port) {
        debug!(port = %port.id, connection = %port.connection_id(), "port opened");
        let session = PortSession {
            port,
            is_subscriber: false,
            chunks: ChunkReassembler::new(self.config.max_message_bytes),
        };
        if let Some(previous) = self.sessions.insert(session.port.id, session) {
            warn!(port = %previous.port.id, "port id reused, previous session discarded");
        }
    }

    /// Tear down `port`: a panel is unsubscribed, a page loses its connection.
    ///
    /// Pending chunk buffers go with the session. Returns false if the port
    /// was not open.
    pub fn close_port(&mut self, port_id: PortId) -> bool {
        let Some(session) = self.sessions.remove(&port_id) else {
            return false;
        };
        debug!(port = %port_id, pending_chunks = session.chunks.pending(), "port closed");

        if session.is_subscriber {
            self.registry.unsubscribe(port_id);
            return true;
        }

        let connection_id = session.port.connection_id();
        let owns_connection = self
            .registry
            .connection(connection_id)
            .is_some_and(|c| c.port == port_id);
        if owns_connection {
            if let Some(delivery) = self.registry.disconnect(connection_id) {
                self.stats.record_delivery(delivery);
            }
        }
        true
    }

    /// Lifecycle of whatever `port` is attached to.
    pub fn port_status(&self, port_id: PortId) -> ConnectionStatus {
        let Some(session) = self.sessions.get(&port_id) else {
            return ConnectionStatus::Disconnected;
        };
        match self.registry.connection(session.port.connection_id()) {
            Some(c) if c.port == port_id => ConnectionStatus::Active,
            _ => ConnectionStatus::Connecting,
        }
    }

    /// Entry point for raw text from a transport.
    pub fn handle_text(&mut self, port_id: PortId, text: &str) -> Outcome {
        self.stats.messages_received += 1;
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.handle_value(port_id, value),
            Err(e) => self.drop_message(port_id, RelayError::from(e)),
        }
    }

    /// Dispatch an already parsed message. Reassembled chunks re-enter here.
    pub fn handle_value(&mut self, port_id: PortId, value: Value) -> Outcome {
        if !self.sessions.contains_key(&port_id) {
            return self.drop_message(port_id, RelayError::UnknownPort(port_id));
        }
        let msg = match InboundMessage::decode(value) {
            Ok(msg) => msg,
            Err(e) => return self.drop_message(port_id, e),
        };
        match self.dispatch(port_id, msg) {
            Ok(outcome) => outcome,
            Err(e) => self.drop_message(port_id, e),
        }
    }

    fn dispatch(&mut self, port_id: PortId, msg: InboundMessage) -> Result<Outcome, RelayError> {
        match msg {
            InboundMessage::Init { data } => {
                let session = self.session(port_id)?;
                let connection_id = session.port.connection_id();
                let display_name = session.port.display_name();
                let InitData {
                    persistence_limit,
                    initial_values,
                    dev_mode,
                } = data.unwrap_or_default();

                let delivery = self.registry.connect(
                    connection_id,
                    persistence_limit,
                    initial_values.unwrap_or_default(),
                    display_name,
                    dev_mode.unwrap_or(false),
                    port_id,
                );
                self.stats.connections_opened += 1;
                self.stats.record_delivery(delivery);
                debug!(port = %port_id, connection = %connection_id, "CONNECT");
                Ok(Outcome::Connected(connection_id))
            }

            InboundMessage::Update { data } => {
                let connection_id = self.session(port_id)?.port.connection_id();
                let owned = self
                    .registry
                    .connection(connection_id)
                    .is_some_and(|c| c.port == port_id);
                if !owned {
                    return Err(RelayError::Protocol(format!(
                        "update from {} which does not own connection {}",
                        port_id, connection_id
                    )));
                }
                let (transaction_id, delivery) =
                    self.registry.process_message(connection_id, data)?;
                self.stats.updates_applied += 1;
                self.stats.record_delivery(delivery);
                Ok(Outcome::Updated {
                    connection_id,
                    transaction_id,
                })
            }

            InboundMessage::SubscribePopup => {
                let session = self.session_mut(port_id)?;
                session.is_subscriber = true;
                let port = session.port.clone();
                let delivery = self.registry.subscribe(port);
                self.stats.record_delivery(delivery);
                Ok(Outcome::Subscribed)
            }

            InboundMessage::UploadChunk {
                tx_id,
                chunk,
                is_final_chunk,
            } => {
                let session = self.session_mut(port_id)?;
                let assembled =
                    session
                        .chunks
                        .ingest(tx_id, chunk.as_deref().unwrap_or(""), is_final_chunk)?;
                match assembled {
                    Some(value) => Ok(self.handle_value(port_id, value)),
                    None => {
                        self.stats.chunks_buffered += 1;
                        Ok(Outcome::Buffered)
                    }
                }
            }

            InboundMessage::Unknown => {
                self.stats.messages_ignored += 1;
                Ok(Outcome::Ignored)
            }
        }
    }

    fn session(&self, port_id: PortId) -> Result<&PortSession, RelayError> {
        self.sessions
            .get(&port_id)
            .ok_or(RelayError::UnknownPort(port_id))
    }

    fn session_mut(&mut self, port_id: PortId) -> Result<&mut PortSession, RelayError> {
        self.sessions
            .get_mut(&port_id)
            .ok_or(RelayError::UnknownPort(port_id))
    }

    fn drop_message(&mut self, port_id: PortId, err: RelayError) -> Outcome {
        warn!(port = %port_id, code = err.error_code(), "Recoil DevTools: message dropped: {}", err);
        self.stats.messages_dropped += 1;
        Outcome::Dropped(err)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
