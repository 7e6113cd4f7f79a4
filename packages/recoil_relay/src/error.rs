//! Error taxonomy for the relay.
//!
//! Every variant is contained by the dispatcher: it is logged and the
//! offending message is dropped. Lookups below the eviction floor are not
//! errors at all; they resolve to [`crate::Lookup::Unavailable`].

use crate::port::PortId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Malformed payload for a known action, or an action that is not valid
    /// in the port's current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A reassembled chunked message could not be decoded.
    #[error("failed to decode chunked message {transfer_id}: {reason}")]
    Decode { transfer_id: u64, reason: String },

    /// Event for a port that was never opened or has already been torn down.
    #[error("unknown port: {0}")]
    UnknownPort(PortId),
}

impl RelayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::Decode { .. } => "decode_error",
            Self::UnknownPort(_) => "unknown_port",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}
