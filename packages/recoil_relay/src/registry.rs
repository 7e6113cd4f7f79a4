//! Connection Registry
//!
//! Owns every active page connection together with its transaction store,
//! and the set of panel ports subscribed to updates.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::port::{ConnectionId, Port, PortId};
use crate::protocol::{
    ConnectionStatus, ConnectionSummary, NodeDetails, NodeInfo, ServerMessage, UpdateData,
};
use crate::store::{Diff, Lookup, Snapshot, TransactionStore, TxId};

/// Transactions kept per connection when INIT does not say
pub const DEFAULT_PERSISTENCE_LIMIT: usize = 50;

/// How many subscribers took a broadcast and how many could not
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub dropped: usize,
}

impl Delivery {
    fn record(&mut self, delivered: bool) {
        if delivered {
            self.sent += 1;
        } else {
            self.dropped += 1;
        }
    }
}

impl std::ops::AddAssign for Delivery {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.dropped += rhs.dropped;
    }
}

/// One instrumented page
pub struct Connection {
    pub id: ConnectionId,
    pub display_name: String,
    pub dev_mode: bool,
    /// Port that sent INIT; only its closure ends the connection
    pub port: PortId,
    pub connected_at: DateTime<Utc>,
    store: TransactionStore,
    nodes: HashMap<String, NodeInfo>,
    dependencies: HashMap<String, Vec<String>>,
}

impl Connection {
    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn node(&self, key: &str) -> Option<&NodeInfo> {
        self.nodes.get(key)
    }

    pub fn dependencies(&self, key: &str) -> &[String] {
        self.dependencies
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            dev_mode: self.dev_mode,
            persistence_limit: self.store.persistence_limit(),
            status: ConnectionStatus::Active,
            port: self.port,
            current_transaction: self.store.current_id(),
            oldest_transaction: self.store.floor_id(),
            connected_at: self.connected_at,
        }
    }

    fn snapshot_message(&self) -> ServerMessage {
        ServerMessage::ConnectionSnapshot {
            connection: self.summary(),
            values: materialize(self.store.head().snapshot()),
            transactions: self.store.iter().map(|t| t.to_view()).collect(),
        }
    }
}

fn materialize(snapshot: &Snapshot) -> BTreeMap<String, Value> {
    snapshot
        .iter()
        .map(|(k, v)| (k.clone(), v.as_ref().clone()))
        .collect()
}

pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    subscribers: BTreeMap<PortId, Port>,
    default_persistence_limit: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PERSISTENCE_LIMIT)
    }
}

impl ConnectionRegistry {
    pub fn new(default_persistence_limit: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            default_persistence_limit,
        }
    }

    /// Create or fully replace a connection, seeding transaction 0.
    pub fn connect(
        &mut self,
        connection_id: ConnectionId,
        persistence_limit: Option<usize>,
        initial_values: BTreeMap<String, Value>,
        display_name: String,
        dev_mode: bool,
        port: PortId,
    ) -> Delivery {
        let limit = persistence_limit.unwrap_or(self.default_persistence_limit);
        let connection = Connection {
            id: connection_id,
            display_name,
            dev_mode,
            port,
            connected_at: Utc::now(),
            store: TransactionStore::new(initial_values, limit),
            nodes: HashMap::new(),
            dependencies: HashMap::new(),
        };
        let snapshot = connection.snapshot_message();

        if self.connections.insert(connection_id, connection).is_some() {
            info!(connection = %connection_id, %port, "connection re-initialized, history replaced");
        } else {
            info!(connection = %connection_id, %port, "connection initialized");
        }

        let mut delivery = self.broadcast(&snapshot);
        delivery += self.broadcast_connection_list();
        delivery
    }

    /// Remove a connection and its history. Returns `None` if it was not active.
    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Option<Delivery> {
        self.connections.remove(&connection_id)?;
        info!(connection = %connection_id, "connection closed");

        let mut delivery = self.broadcast(&ServerMessage::ConnectionClosed { connection_id });
        delivery += self.broadcast_connection_list();
        Some(delivery)
    }

    /// Record an UPDATE as the connection's next transaction and rebroadcast it.
    pub fn process_message(
        &mut self,
        connection_id: ConnectionId,
        update: UpdateData,
    ) -> Result<(TxId, Delivery), RelayError> {
        let connection = self.connections.get_mut(&connection_id).ok_or_else(|| {
            RelayError::Protocol(format!("update for inactive connection {}", connection_id))
        })?;

        let UpdateData {
            modified_values,
            nodes,
            deps,
        } = update;
        connection.nodes.extend(nodes);
        connection.dependencies.extend(deps);

        let transaction = connection.store.append(modified_values);
        let tx_id = transaction.id;
        let msg = ServerMessage::Transaction {
            connection_id,
            transaction: transaction.to_view(),
        };
        debug!(connection = %connection_id, tx = tx_id, "transaction recorded");

        Ok((tx_id, self.broadcast(&msg)))
    }

    /// Add a panel port and bring it up to date with every connection.
    pub fn subscribe(&mut self, port: Port) -> Delivery {
        let mut delivery = Delivery::default();
        delivery.record(port.post(ServerMessage::ConnectionList {
            connections: self.connections(),
        }));
        for connection in self.connections.values() {
            delivery.record(port.post(connection.snapshot_message()));
        }

        debug!(port = %port.id, "subscriber added");
        self.subscribers.insert(port.id, port);
        delivery
    }

    pub fn unsubscribe(&mut self, port: PortId) -> bool {
        let removed = self.subscribers.remove(&port).is_some();
        if removed {
            debug!(%port, "subscriber removed");
        }
        removed
    }

    pub fn is_subscribed(&self, port: PortId) -> bool {
        self.subscribers.contains_key(&port)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn broadcast(&self, msg: &ServerMessage) -> Delivery {
        let mut delivery = Delivery::default();
        for port in self.subscribers.values() {
            delivery.record(port.post(msg.clone()));
        }
        delivery
    }

    fn broadcast_connection_list(&self) -> Delivery {
        self.broadcast(&ServerMessage::ConnectionList {
            connections: self.connections(),
        })
    }

    // ── read API ────────────────────────────────────────────────────────

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.connections.values().map(Connection::summary).collect()
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// `None` if the connection is unknown
    pub fn get(&self, connection_id: ConnectionId, key: &str, tx: TxId) -> Option<Lookup> {
        self.connection(connection_id).map(|c| c.store.get(key, tx))
    }

    pub fn diff(&self, connection_id: ConnectionId, key: &str, tx: TxId) -> Option<Diff> {
        self.connection(connection_id).map(|c| c.store.diff(key, tx))
    }

    pub fn get_node(&self, connection_id: ConnectionId, key: &str) -> Option<NodeDetails> {
        self.connection(connection_id).map(|c| NodeDetails {
            key: key.to_string(),
            node: c.node(key).cloned(),
            dependencies: c.dependencies(key).to_vec(),
        })
    }

    pub fn dependencies(&self, connection_id: ConnectionId, key: &str) -> Option<&[String]> {
        self.connection(connection_id).map(|c| c.dependencies(key))
    }

    pub fn current_transaction(&self, connection_id: ConnectionId) -> Option<TxId> {
        self.connection(connection_id)
            .map(|c| c.store.current_id())
    }

    /// Materialized values at `tx`. The outer `None` means the connection is
    /// unknown, the inner one that `tx` has been evicted.
    pub fn snapshot(
        &self,
        connection_id: ConnectionId,
        tx: TxId,
    ) -> Option<Option<BTreeMap<String, Value>>> {
        self.connection(connection_id)
            .map(|c| c.store.snapshot(tx).map(materialize))
    }
}
