//! Reassembly of messages that pages split into `UPLOAD_CHUNK` fragments.
//!
//! A reassembler belongs to a single port. Buffers are keyed by the sender's
//! transfer id and released when the final chunk arrives, whether or not the
//! result parses. A sender that never delivers its final chunk leaves its
//! buffer in place until the port is torn down.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::RelayError;

/// Upper bound on chunk bytes one port may hold across its transfers (16 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

pub struct ChunkReassembler {
    buffers: HashMap<u64, String>,
    max_message_bytes: usize,
}

impl ChunkReassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_message_bytes,
        }
    }

    /// Feed one chunk.
    ///
    /// Returns the decoded message once `is_final` is set, `None` while more
    /// chunks are expected. The size cap covers every pending transfer
    /// together; the transfer that crosses it is released with an error.
    pub fn ingest(
        &mut self,
        transfer_id: u64,
        chunk: &str,
        is_final: bool,
    ) -> Result<Option<Value>, RelayError> {
        self.buffers
            .entry(transfer_id)
            .or_default()
            .push_str(chunk);

        let total = self.buffered_bytes();
        if total > self.max_message_bytes {
            self.buffers.remove(&transfer_id);
            return Err(RelayError::Decode {
                transfer_id,
                reason: format!(
                    "buffered chunks too large: {} bytes (max {})",
                    total, self.max_message_bytes
                ),
            });
        }

        if !is_final {
            return Ok(None);
        }

        // Taken out of the map before parsing so a failure still frees it
        let text = self.buffers.remove(&transfer_id).unwrap_or_default();
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| RelayError::Decode {
                transfer_id,
                reason: e.to_string(),
            })
    }

    /// Number of transfers waiting for their final chunk
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffers.values().map(String::len).sum()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}
