//! Relay Protocol Types
//!
//! Inbound messages come from instrumented pages and devtools panels as JSON
//! objects carrying an `action` field. Outbound messages go to subscribed
//! panels and are tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::RelayError;
use crate::port::{ConnectionId, PortId};
use crate::store::TxId;

/// Display name used when a port does not announce one.
pub const DEFAULT_CONNECTION_NAME: &str = "Recoil Connection";

/// Messages sent FROM a page or panel TO the relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum InboundMessage {
    /// A page announces itself and its starting state
    #[serde(rename = "INIT")]
    Init {
        #[serde(default)]
        data: Option<InitData>,
    },
    /// A page reports changed values
    #[serde(rename = "UPDATE")]
    Update { data: UpdateData },
    /// A devtools panel asks for connection updates
    #[serde(rename = "SUBSCRIBE_POPUP")]
    SubscribePopup,
    /// One fragment of an oversized message
    #[serde(rename = "UPLOAD_CHUNK")]
    UploadChunk {
        #[serde(rename = "txID")]
        tx_id: u64,
        #[serde(default)]
        chunk: Option<String>,
        #[serde(default, rename = "isFinalChunk", deserialize_with = "truthy")]
        is_final_chunk: bool,
    },
    /// Traffic from unrelated senders
    #[serde(other)]
    Unknown,
}

/// Reads a flag the way the page's script tests it: `null`, `0`, `""` and
/// `false` are false, anything else is true.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

impl InboundMessage {
    /// Decode a message once at the boundary.
    ///
    /// A missing, null or non-string `action` is protocol noise and decodes to
    /// `Unknown`. A known action with a malformed payload is a protocol error.
    pub fn decode(value: Value) -> Result<Self, RelayError> {
        match value.get("action") {
            Some(Value::String(_)) => Ok(serde_json::from_value(value)?),
            _ => Ok(InboundMessage::Unknown),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            InboundMessage::Init { .. } => "INIT",
            InboundMessage::Update { .. } => "UPDATE",
            InboundMessage::SubscribePopup => "SUBSCRIBE_POPUP",
            InboundMessage::UploadChunk { .. } => "UPLOAD_CHUNK",
            InboundMessage::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    #[serde(default)]
    pub persistence_limit: Option<usize>,
    #[serde(default)]
    pub initial_values: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub dev_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub modified_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfo>,
    #[serde(default)]
    pub deps: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Atom,
    Selector,
}

/// Per-key metadata declared by the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Answer to a `getNode` query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeInfo>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub display_name: String,
    pub dev_mode: bool,
    pub persistence_limit: usize,
    pub status: ConnectionStatus,
    pub port: PortId,
    /// Newest transaction id
    pub current_transaction: TxId,
    /// Oldest transaction id still retained
    pub oldest_transaction: TxId,
    pub connected_at: DateTime<Utc>,
}

/// Wire form of one transaction: its delta, not the full snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TxId,
    pub timestamp: DateTime<Utc>,
    pub modified_values: BTreeMap<String, Value>,
}

/// Messages sent FROM the relay TO subscribed panels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Every active connection
    ConnectionList { connections: Vec<ConnectionSummary> },
    /// Full state of one connection (catch-up on subscribe, and on INIT)
    ConnectionSnapshot {
        connection: ConnectionSummary,
        values: BTreeMap<String, Value>,
        transactions: Vec<TransactionView>,
    },
    /// A newly accepted transaction
    Transaction {
        connection_id: ConnectionId,
        transaction: TransactionView,
    },
    /// A page went away
    ConnectionClosed { connection_id: ConnectionId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_init() {
        let msg = InboundMessage::decode(json!({
            "action": "INIT",
            "data": {"persistenceLimit": 5, "initialValues": {"a": 1}, "devMode": true}
        }))
        .unwrap();
        match msg {
            InboundMessage::Init { data: Some(data) } => {
                assert_eq!(data.persistence_limit, Some(5));
                assert_eq!(data.initial_values.unwrap()["a"], json!(1));
                assert_eq!(data.dev_mode, Some(true));
            }
            other => panic!("Expected Init, got {:?}", other),
        }
    }

    #[test]
    fn decode_init_without_data() {
        let msg = InboundMessage::decode(json!({"action": "INIT"})).unwrap();
        assert_eq!(msg, InboundMessage::Init { data: None });
        let msg = InboundMessage::decode(json!({"action": "INIT", "data": null})).unwrap();
        assert_eq!(msg, InboundMessage::Init { data: None });
    }

    #[test]
    fn decode_update_with_nodes_and_deps() {
        let msg = InboundMessage::decode(json!({
            "action": "UPDATE",
            "data": {
                "modifiedValues": {"total": 12},
                "nodes": {"total": {"type": "selector", "scope": "cart"}},
                "deps": {"total": ["items", "tax"]}
            }
        }))
        .unwrap();
        let InboundMessage::Update { data } = msg else {
            panic!("Expected Update");
        };
        assert_eq!(data.modified_values["total"], json!(12));
        let node = &data.nodes["total"];
        assert_eq!(node.kind, NodeKind::Selector);
        assert_eq!(node.metadata["scope"], json!("cart"));
        assert_eq!(data.deps["total"], vec!["items", "tax"]);
    }

    #[test]
    fn update_without_modified_values_is_malformed() {
        let err = InboundMessage::decode(json!({"action": "UPDATE", "data": {}})).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
        let err = InboundMessage::decode(json!({"action": "UPDATE"})).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn decode_chunk() {
        let msg = InboundMessage::decode(json!({
            "action": "UPLOAD_CHUNK",
            "txID": 4,
            "chunk": "{\"act",
        }))
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::UploadChunk {
                tx_id: 4,
                chunk: Some("{\"act".to_string()),
                is_final_chunk: false,
            }
        );
    }

    #[test]
    fn final_chunk_flag_is_loosely_typed() {
        let flag = |v: Value| {
            let msg = InboundMessage::decode(json!({
                "action": "UPLOAD_CHUNK",
                "txID": 1,
                "chunk": "",
                "isFinalChunk": v,
            }))
            .unwrap();
            match msg {
                InboundMessage::UploadChunk { is_final_chunk, .. } => is_final_chunk,
                other => panic!("Expected UploadChunk, got {:?}", other),
            }
        };
        assert!(!flag(json!(null)));
        assert!(!flag(json!(0)));
        assert!(!flag(json!("")));
        assert!(!flag(json!(false)));
        assert!(flag(json!(1)));
        assert!(flag(json!("yes")));
        assert!(flag(json!(true)));
    }

    #[test]
    fn subscribe_ignores_extra_fields() {
        let msg =
            InboundMessage::decode(json!({"action": "SUBSCRIBE_POPUP", "tab": 3})).unwrap();
        assert_eq!(msg, InboundMessage::SubscribePopup);
    }

    #[test]
    fn noise_decodes_to_unknown() {
        for value in [
            json!({"action": "SOMETHING_ELSE", "payload": 1}),
            json!({"action": null}),
            json!({"action": 7}),
            json!({"hello": "world"}),
            json!([1, 2, 3]),
            json!("INIT"),
            Value::Null,
        ] {
            assert_eq!(
                InboundMessage::decode(value.clone()).unwrap(),
                InboundMessage::Unknown,
                "{value}"
            );
        }
    }

    #[test]
    fn server_message_is_tagged_by_type() {
        let msg = ServerMessage::ConnectionClosed {
            connection_id: ConnectionId(3),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({"type": "ConnectionClosed", "connection_id": 3}));
    }
}
