use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use recoil_relay::{
    ConnectionId, ConnectionSummary, Diff, Lookup, NodeDetails, Port, PortId, Relay, RelayStats,
    TxId,
};

/// Commands that can be sent to the relay actor
#[derive(Debug)]
pub enum RelayCommand {
    OpenPort {
        port: Port,
    },
    PortMessage {
        port: PortId,
        text: String,
    },
    ClosePort {
        port: PortId,
    },
    ListConnections {
        respond_to: oneshot::Sender<Vec<ConnectionSummary>>,
    },
    GetConnection {
        id: ConnectionId,
        respond_to: oneshot::Sender<Option<ConnectionSummary>>,
    },
    /// `tx: None` reads the current transaction
    GetValue {
        id: ConnectionId,
        key: String,
        tx: Option<TxId>,
        respond_to: oneshot::Sender<Option<Lookup>>,
    },
    GetDiff {
        id: ConnectionId,
        key: String,
        tx: Option<TxId>,
        respond_to: oneshot::Sender<Option<Diff>>,
    },
    GetNode {
        id: ConnectionId,
        key: String,
        respond_to: oneshot::Sender<Option<NodeDetails>>,
    },
    GetSnapshot {
        id: ConnectionId,
        tx: Option<TxId>,
        respond_to: oneshot::Sender<Option<Option<BTreeMap<String, Value>>>>,
    },
    GetHealth {
        respond_to: oneshot::Sender<RelayHealth>,
    },
}

/// Relay-side numbers for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub connections: usize,
    pub subscribers: usize,
    pub open_ports: usize,
    pub stats: RelayStats,
}

/// Handle to communicate with the relay actor
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<RelayCommand>,
    next_port: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Spawn the actor that owns `relay` and return its handle.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn(relay: Relay) -> Self {
        let (sender, receiver) = mpsc::channel(1024);
        let actor = RelayActor { relay, receiver };
        tokio::spawn(async move {
            actor.run().await;
        });
        Self {
            sender,
            next_port: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn allocate_port_id(&self) -> PortId {
        PortId(self.next_port.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn open_port(&self, port: Port) -> Result<()> {
        self.sender
            .send(RelayCommand::OpenPort { port })
            .await
            .map_err(|_| anyhow::anyhow!("Relay actor is gone"))
    }

    /// Queue raw text from a port. Ordering per port follows call order.
    pub async fn port_message(&self, port: PortId, text: String) -> Result<()> {
        self.sender
            .send(RelayCommand::PortMessage { port, text })
            .await
            .map_err(|_| anyhow::anyhow!("Relay actor is gone"))
    }

    pub async fn close_port(&self, port: PortId) -> Result<()> {
        self.sender
            .send(RelayCommand::ClosePort { port })
            .await
            .map_err(|_| anyhow::anyhow!("Relay actor is gone"))
    }

    pub async fn list_connections(&self) -> Result<Vec<ConnectionSummary>> {
        self.request(|respond_to| RelayCommand::ListConnections { respond_to })
            .await
    }

    pub async fn get_connection(&self, id: ConnectionId) -> Result<Option<ConnectionSummary>> {
        self.request(|respond_to| RelayCommand::GetConnection { id, respond_to })
            .await
    }

    pub async fn get_value(
        &self,
        id: ConnectionId,
        key: String,
        tx: Option<TxId>,
    ) -> Result<Option<Lookup>> {
        self.request(|respond_to| RelayCommand::GetValue {
            id,
            key,
            tx,
            respond_to,
        })
        .await
    }

    pub async fn get_diff(
        &self,
        id: ConnectionId,
        key: String,
        tx: Option<TxId>,
    ) -> Result<Option<Diff>> {
        self.request(|respond_to| RelayCommand::GetDiff {
            id,
            key,
            tx,
            respond_to,
        })
        .await
    }

    pub async fn get_node(&self, id: ConnectionId, key: String) -> Result<Option<NodeDetails>> {
        self.request(|respond_to| RelayCommand::GetNode {
            id,
            key,
            respond_to,
        })
        .await
    }

    pub async fn get_snapshot(
        &self,
        id: ConnectionId,
        tx: Option<TxId>,
    ) -> Result<Option<Option<BTreeMap<String, Value>>>> {
        self.request(|respond_to| RelayCommand::GetSnapshot { id, tx, respond_to })
            .await
    }

    pub async fn health(&self) -> Result<RelayHealth> {
        self.request(|respond_to| RelayCommand::GetHealth { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RelayCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("Relay actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Relay actor didn't respond"))
    }
}

/// The actor that owns the relay. One command runs to completion before the
/// next is received.
struct RelayActor {
    relay: Relay,
    receiver: mpsc::Receiver<RelayCommand>,
}

impl RelayActor {
    async fn run(mut self) {
        debug!("Relay actor started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle(cmd);
        }

        info!(
            "Relay actor stopped ({} connections dropped)",
            self.relay.registry().len()
        );
    }

    fn handle(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::OpenPort { port } => {
                self.relay.open_port(port);
            }

            RelayCommand::PortMessage { port, text } => {
                let outcome = self.relay.handle_text(port, &text);
                debug!(%port, ?outcome, "message handled");
            }

            RelayCommand::ClosePort { port } => {
                self.relay.close_port(port);
            }

            RelayCommand::ListConnections { respond_to } => {
                let _ = respond_to.send(self.relay.registry().connections());
            }

            RelayCommand::GetConnection { id, respond_to } => {
                let summary = self.relay.registry().connection(id).map(|c| c.summary());
                let _ = respond_to.send(summary);
            }

            RelayCommand::GetValue {
                id,
                key,
                tx,
                respond_to,
            } => {
                let registry = self.relay.registry();
                let result = self
                    .resolve_tx(id, tx)
                    .and_then(|tx| registry.get(id, &key, tx));
                let _ = respond_to.send(result);
            }

            RelayCommand::GetDiff {
                id,
                key,
                tx,
                respond_to,
            } => {
                let registry = self.relay.registry();
                let result = self
                    .resolve_tx(id, tx)
                    .and_then(|tx| registry.diff(id, &key, tx));
                let _ = respond_to.send(result);
            }

            RelayCommand::GetNode {
                id,
                key,
                respond_to,
            } => {
                let _ = respond_to.send(self.relay.registry().get_node(id, &key));
            }

            RelayCommand::GetSnapshot { id, tx, respond_to } => {
                let registry = self.relay.registry();
                let result = self
                    .resolve_tx(id, tx)
                    .and_then(|tx| registry.snapshot(id, tx));
                let _ = respond_to.send(result);
            }

            RelayCommand::GetHealth { respond_to } => {
                let registry = self.relay.registry();
                let _ = respond_to.send(RelayHealth {
                    connections: registry.len(),
                    subscribers: registry.subscriber_count(),
                    open_ports: self.relay.open_ports(),
                    stats: self.relay.stats().clone(),
                });
            }
        }
    }

    /// An explicit id wins; otherwise the connection's current transaction.
    fn resolve_tx(&self, id: ConnectionId, tx: Option<TxId>) -> Option<TxId> {
        tx.or_else(|| self.relay.registry().current_transaction(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recoil_relay::{RelayConfig, ServerMessage};
    use serde_json::json;

    async fn page(handle: &RelayHandle, tab_id: u32) -> (PortId, mpsc::Receiver<ServerMessage>) {
        let id = handle.allocate_port_id();
        let (tx, rx) = mpsc::channel(64);
        handle
            .open_port(Port::new(id, Some("test page".to_string()), Some(tab_id), tx))
            .await
            .unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_port_ids_are_unique() {
        let handle = RelayHandle::spawn(Relay::default());
        let a = handle.allocate_port_id();
        let b = handle.clone().allocate_port_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_messages_flow_through_actor() {
        let handle = RelayHandle::spawn(Relay::new(RelayConfig::default()));
        let (port, _rx) = page(&handle, 4).await;

        handle
            .port_message(
                port,
                json!({"action": "INIT", "data": {"initialValues": {"a": 1}}}).to_string(),
            )
            .await
            .unwrap();
        handle
            .port_message(
                port,
                json!({"action": "UPDATE", "data": {"modifiedValues": {"a": 2}}}).to_string(),
            )
            .await
            .unwrap();

        // Queries are ordered after the messages above
        let connections = handle.list_connections().await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].id, ConnectionId(4));
        assert_eq!(connections[0].current_transaction, 1);

        let current = handle
            .get_value(ConnectionId(4), "a".to_string(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.value(), Some(&json!(2)));

        let first = handle
            .get_value(ConnectionId(4), "a".to_string(), Some(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.value(), Some(&json!(1)));

        let diff = handle
            .get_diff(ConnectionId(4), "a".to_string(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.previous.value(), Some(&json!(1)));
        assert_eq!(diff.current.value(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_unknown_connection_reads_none() {
        let handle = RelayHandle::spawn(Relay::default());
        assert!(handle.get_connection(ConnectionId(1)).await.unwrap().is_none());
        assert!(
            handle
                .get_value(ConnectionId(1), "a".to_string(), None)
                .await
                .unwrap()
                .is_none()
        );
        assert!(handle.get_snapshot(ConnectionId(1), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_port_removes_connection() {
        let handle = RelayHandle::spawn(Relay::default());
        let (port, _rx) = page(&handle, 2).await;
        handle
            .port_message(port, json!({"action": "INIT"}).to_string())
            .await
            .unwrap();
        assert!(handle.get_connection(ConnectionId(2)).await.unwrap().is_some());

        handle.close_port(port).await.unwrap();
        assert!(handle.get_connection(ConnectionId(2)).await.unwrap().is_none());

        let health = handle.health().await.unwrap();
        assert_eq!(health.connections, 0);
        assert_eq!(health.open_ports, 0);
        assert_eq!(health.stats.connections_opened, 1);
    }

    #[tokio::test]
    async fn test_panel_receives_updates() {
        let handle = RelayHandle::spawn(Relay::default());
        let (page_port, _page_rx) = page(&handle, 1).await;
        handle
            .port_message(page_port, json!({"action": "INIT"}).to_string())
            .await
            .unwrap();

        let panel_port = handle.allocate_port_id();
        let (tx, mut panel_rx) = mpsc::channel(64);
        handle
            .open_port(Port::new(panel_port, None, None, tx))
            .await
            .unwrap();
        handle
            .port_message(panel_port, json!({"action": "SUBSCRIBE_POPUP"}).to_string())
            .await
            .unwrap();
        handle
            .port_message(
                page_port,
                json!({"action": "UPDATE", "data": {"modifiedValues": {"x": true}}}).to_string(),
            )
            .await
            .unwrap();

        assert!(matches!(
            panel_rx.recv().await.unwrap(),
            ServerMessage::ConnectionList { .. }
        ));
        assert!(matches!(
            panel_rx.recv().await.unwrap(),
            ServerMessage::ConnectionSnapshot { .. }
        ));
        match panel_rx.recv().await.unwrap() {
            ServerMessage::Transaction { transaction, .. } => {
                assert_eq!(transaction.id, 1);
                assert_eq!(transaction.modified_values["x"], json!(true));
            }
            other => panic!("Expected Transaction, got {:?}", other),
        }
    }
}
