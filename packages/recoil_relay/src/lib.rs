//! Recoil Relay - background message relay for the Recoil devtools panel
//!
//! This crate holds the state-synchronization core that sits between
//! instrumented pages and devtools panels. It has no HTTP dependencies:
//! transports hand it [`Port`]s and raw message text, and it answers with
//! [`ServerMessage`]s pushed into each port's channel.
//!
//! # Example
//!
//! ```
//! use recoil_relay::{ConnectionId, Outcome, Port, PortId, Relay, RelayConfig};
//! use tokio::sync::mpsc;
//!
//! let mut relay = Relay::new(RelayConfig::default());
//!
//! let (tx, _rx) = mpsc::channel(16);
//! relay.open_port(Port::new(PortId(1), None, Some(1), tx));
//!
//! relay.handle_text(
//!     PortId(1),
//!     r#"{"action":"INIT","data":{"persistenceLimit":2,"initialValues":{"a":1}}}"#,
//! );
//! let outcome = relay.handle_text(
//!     PortId(1),
//!     r#"{"action":"UPDATE","data":{"modifiedValues":{"b":2}}}"#,
//! );
//! assert!(matches!(outcome, Outcome::Updated { transaction_id: 1, .. }));
//!
//! let lookup = relay.registry().get(ConnectionId(1), "a", 1).unwrap();
//! assert_eq!(lookup.value(), Some(&serde_json::json!(1)));
//! ```

mod chunk;
mod dispatch;
mod error;
mod port;
pub mod protocol;
mod registry;
mod stats;
pub mod store;

pub use chunk::{ChunkReassembler, DEFAULT_MAX_MESSAGE_BYTES};
pub use dispatch::{Outcome, Relay, RelayConfig};
pub use error::RelayError;
pub use port::{ConnectionId, Port, PortId};
pub use protocol::{
    ConnectionStatus, ConnectionSummary, InboundMessage, NodeDetails, NodeInfo, NodeKind,
    ServerMessage, TransactionView,
};
pub use registry::{Connection, ConnectionRegistry, DEFAULT_PERSISTENCE_LIMIT, Delivery};
pub use stats::RelayStats;
pub use store::{Diff, Lookup, Transaction, TransactionStore, TxId};
