//! Parsed IPFIX message: a raw buffer plus the Set and Data-Record indices
//! computed over it (spec §3 "Parsed IPFIX message").

use std::sync::Arc;

use crate::session::SessionKey;
use crate::template::{Snapshot, Template};

/// Reference to one Set within the message's buffer.
#[derive(Debug, Clone, Copy)]
pub struct SetRef {
    pub set_id: u16,
    pub offset: usize,
    pub length: usize,
}

/// Reference to one Data Record within the message's buffer, together with
/// the Template and Snapshot it was decoded against. The `Arc` clones here
/// are exactly what the spec calls "shared (refcount or equivalent) with
/// the template manager": the snapshot stays alive for as long as any
/// `DataRecordRef` still points at it, even after the manager itself has
/// moved on to a newer one.
#[derive(Debug, Clone)]
pub struct DataRecordRef {
    pub offset: usize,
    pub size: usize,
    pub template: Arc<Template>,
    pub snapshot: Arc<Snapshot>,
}

/// A fully parsed IPFIX message (spec §3, §4.4). Exclusively owns its raw
/// buffer; `sets` and `records` are pure indices into it.
#[derive(Debug, Clone)]
pub struct ParsedIpfixMessage {
    pub key: SessionKey,
    pub export_time: u32,
    pub sequence_number: u32,
    pub buffer: Vec<u8>,
    pub sets: Vec<SetRef>,
    pub records: Vec<DataRecordRef>,
}

impl ParsedIpfixMessage {
    pub fn new(key: SessionKey, export_time: u32, sequence_number: u32, buffer: Vec<u8>) -> Self {
        ParsedIpfixMessage { key, export_time, sequence_number, buffer, sets: Vec::new(), records: Vec::new() }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Raw bytes of one data record, for callers that want to decode it
    /// against its own template (e.g. `Template::read_record` a second
    /// time, or a modifier rewriting it).
    pub fn record_bytes(&self, record: &DataRecordRef) -> &[u8] {
        &self.buffer[record.offset..record.offset + record.size]
    }
}
