//! Raw, unparsed exporter-framed byte buffer (spec §3 "Raw message").

use crate::session::SessionKey;

/// Maximum size of a single exporter message on the wire (spec §3, §6).
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// A raw message as it arrives off the wire: an exporter-framed byte buffer
/// plus the scope it was received on.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub key: SessionKey,
    pub bytes: Vec<u8>,
}

impl RawMessage {
    pub fn new(key: SessionKey, bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() <= MAX_MESSAGE_SIZE, "exporter message exceeds the 65535-byte maximum");
        RawMessage { key, bytes }
    }
}
