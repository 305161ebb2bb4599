//! Outgoing IPFIX message assembly (spec §4.8, first half).
//!
//! The growable buffer here is a plain `Vec<u8>`. The spec's "maintain
//! per-offset arrays so the indices can be rebased after reallocation"
//! requirement is about a hand-rolled buffer where a `realloc` can move the
//! backing storage out from under raw pointers; `Set`/`DataRecord` indices
//! in this crate are byte offsets (`usize`), not pointers, so a `Vec`
//! growing its allocation never invalidates them — there is nothing to
//! rebase. `ensure_capacity` below still reproduces the spec's allocation
//! *policy* ("start at a hint, double on need, capped at 65535"), just
//! expressed through `Vec::reserve` instead of `realloc`.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::{DataRecordRef, ParsedIpfixMessage, SetRef, MAX_MESSAGE_SIZE};
use crate::session::SessionKey;
use crate::template::{Snapshot, Template};

const MESSAGE_HEADER_SIZE: usize = 16;
const SET_HEADER_SIZE: usize = 4;

/// Default capacity hint when the caller has no better estimate.
pub const DEFAULT_CAPACITY_HINT: usize = 1024;

/// Assembles one outgoing IPFIX message: a copied header, followed by Sets
/// of Data Records, growing the backing buffer as needed up to the
/// 65535-byte wire maximum (spec §4.8).
pub struct MessageBuilder {
    buffer: Vec<u8>,
    sets: Vec<SetRef>,
    records: Vec<DataRecordRef>,
    current_set_offset: Option<usize>,
    current_set_id: u16,
}

impl MessageBuilder {
    /// Starts a new builder, the buffer pre-sized to `capacity_hint` bytes
    /// (clamped to the header size and the wire maximum) with the
    /// 16-byte header already reserved.
    pub fn new(capacity_hint: usize) -> Self {
        let hint = capacity_hint.clamp(MESSAGE_HEADER_SIZE, MAX_MESSAGE_SIZE);
        let mut buffer = Vec::with_capacity(hint);
        buffer.resize(MESSAGE_HEADER_SIZE, 0);
        MessageBuilder { buffer, sets: Vec::new(), records: Vec::new(), current_set_offset: None, current_set_id: 0 }
    }

    fn ensure_capacity(&mut self, additional: usize) -> Result<()> {
        let needed = self.buffer.len() + additional;
        if needed > MAX_MESSAGE_SIZE {
            return Err(Error::Limit(format!("message would grow to {} bytes, exceeding the {}-byte maximum", needed, MAX_MESSAGE_SIZE)));
        }
        if self.buffer.capacity() < needed {
            let mut new_cap = self.buffer.capacity().max(1);
            while new_cap < needed {
                new_cap = (new_cap * 2).min(MAX_MESSAGE_SIZE);
            }
            self.buffer.reserve(new_cap - self.buffer.len());
        }
        Ok(())
    }

    /// Closes the currently open Set, if any, patching its length field now
    /// that its final size is known.
    fn finish_current_set(&mut self) {
        if let Some(set_offset) = self.current_set_offset.take() {
            let length = self.buffer.len() - set_offset;
            self.buffer[set_offset + 2..set_offset + 4].copy_from_slice(&(length as u16).to_be_bytes());
            self.sets.push(SetRef { set_id: self.current_set_id, offset: set_offset, length });
        }
    }

    /// Opens a new Set, closing whatever Set was previously open.
    pub fn begin_set(&mut self, set_id: u16) -> Result<()> {
        self.finish_current_set();
        self.ensure_capacity(SET_HEADER_SIZE)?;
        self.current_set_offset = Some(self.buffer.len());
        self.current_set_id = set_id;
        self.buffer.extend_from_slice(&set_id.to_be_bytes());
        self.buffer.extend_from_slice(&[0, 0]);
        Ok(())
    }

    /// Appends one Data Record's already-encoded bytes into the currently
    /// open Set, recording the index entry the spec's "Parsed IPFIX
    /// message" carries for it.
    pub fn append_data_record(&mut self, template: Arc<Template>, snapshot: Arc<Snapshot>, bytes: &[u8]) -> Result<()> {
        if self.current_set_offset.is_none() {
            return Err(Error::Arg("append_data_record called with no Set open".into()));
        }
        self.ensure_capacity(bytes.len())?;
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        self.records.push(DataRecordRef { offset, size: bytes.len(), template, snapshot });
        Ok(())
    }

    /// True if no Data Record has been appended since construction (a
    /// caller may choose to discard the builder rather than emit an empty
    /// message).
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finalizes the message: closes any open Set, writes the Message
    /// Header, and returns the Parsed IPFIX message with indices already
    /// pointing at the final buffer.
    pub fn finish(mut self, key: SessionKey, export_time: u32, sequence_number: u32) -> ParsedIpfixMessage {
        self.finish_current_set();

        self.buffer[0..2].copy_from_slice(&crate::parser::IPFIX_VERSION.to_be_bytes());
        let total_len = self.buffer.len() as u16;
        self.buffer[2..4].copy_from_slice(&total_len.to_be_bytes());
        self.buffer[4..8].copy_from_slice(&export_time.to_be_bytes());
        self.buffer[8..12].copy_from_slice(&sequence_number.to_be_bytes());
        self.buffer[12..16].copy_from_slice(&key.odid.to_be_bytes());

        ParsedIpfixMessage { key, export_time, sequence_number, buffer: self.buffer, sets: self.sets, records: self.records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::template::field::Field;
    use crate::template::template::{Template as Tmpl, TemplateKind};

    fn key() -> SessionKey {
        SessionKey::new(SessionId::new(), 7, 0)
    }

    #[test]
    fn header_and_single_record_round_trip_through_the_parser() {
        let template = Arc::new(Tmpl::new(256, TemplateKind::Template, vec![Field::standard(8, 4)]).unwrap());
        let snapshot = Arc::new(Snapshot::empty(0).with_upsert(0, Arc::clone(&template)));

        let mut builder = MessageBuilder::new(DEFAULT_CAPACITY_HINT);
        builder.begin_set(256).unwrap();
        builder.append_data_record(Arc::clone(&template), Arc::clone(&snapshot), &[10, 0, 0, 1]).unwrap();
        let msg = builder.finish(key(), 1000, 5);

        assert_eq!(msg.buffer.len(), 16 + 4 + 4);
        assert_eq!(&msg.buffer[0..2], &10u16.to_be_bytes());
        assert_eq!(&msg.buffer[4..8], &1000u32.to_be_bytes());
        assert_eq!(&msg.buffer[8..12], &5u32.to_be_bytes());
        assert_eq!(&msg.buffer[12..16], &7u32.to_be_bytes());
        assert_eq!(msg.sets.len(), 1);
        assert_eq!(msg.sets[0].set_id, 256);
        assert_eq!(msg.records.len(), 1);
        assert_eq!(msg.record_bytes(&msg.records[0]), &[10, 0, 0, 1]);
    }

    #[test]
    fn multiple_sets_each_get_their_own_length() {
        let template = Arc::new(Tmpl::new(256, TemplateKind::Template, vec![Field::standard(8, 4)]).unwrap());
        let snapshot = Arc::new(Snapshot::empty(0));

        let mut builder = MessageBuilder::new(16);
        builder.begin_set(256).unwrap();
        builder.append_data_record(Arc::clone(&template), Arc::clone(&snapshot), &[1, 2, 3, 4]).unwrap();
        builder.begin_set(257).unwrap();
        builder.append_data_record(Arc::clone(&template), Arc::clone(&snapshot), &[5, 6, 7, 8]).unwrap();
        let msg = builder.finish(key(), 0, 0);

        assert_eq!(msg.sets.len(), 2);
        assert_eq!(msg.sets[0].length, 8);
        assert_eq!(msg.sets[1].length, 8);
    }

    #[test]
    fn exceeding_the_wire_maximum_is_rejected() {
        let template = Arc::new(Tmpl::new(256, TemplateKind::Template, vec![Field::standard(8, 4)]).unwrap());
        let snapshot = Arc::new(Snapshot::empty(0));
        let mut builder = MessageBuilder::new(DEFAULT_CAPACITY_HINT);
        builder.begin_set(256).unwrap();
        let big = vec![0u8; MAX_MESSAGE_SIZE];
        let err = builder.append_data_record(template, snapshot, &big).unwrap_err();
        assert!(matches!(err, Error::Limit(_)));
    }

    #[test]
    fn append_without_open_set_is_an_invariant_violation() {
        let template = Arc::new(Tmpl::new(256, TemplateKind::Template, vec![Field::standard(8, 4)]).unwrap());
        let snapshot = Arc::new(Snapshot::empty(0));
        let mut builder = MessageBuilder::new(DEFAULT_CAPACITY_HINT);
        let err = builder.append_data_record(template, snapshot, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::Arg(_)));
    }
}
