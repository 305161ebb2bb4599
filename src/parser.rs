//! IPFIX Message parser and per-(Session, ODID, Stream) dispatch (spec §4.4).
//!
//! Stateless as an algorithm; all state lives in the [`Parser`]'s map of
//! [`TemplateManager`]s, one per [`SessionKey`]. Grounded in the wire-level
//! field reads of `examples/cdeconinck-ipfix/src/flow/ipfix.rs` (explicit
//! `from_be_bytes`, not `bincode`, since the Data Set layout is
//! template-driven and must be symmetric with the message builder's write
//! path — see DESIGN.md).

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{Component, Error, Result};
use crate::flow_log;
use crate::message::{DataRecordRef, GarbageMessage, ParsedIpfixMessage, SetRef};
use crate::session::{SessionKey, SessionType};
use crate::template::{Field, Template, TemplateKind, TemplateManager, TimeOutcome, MIN_TEMPLATE_ID, WITHDRAW_ALL_OPTIONS_TEMPLATES, WITHDRAW_ALL_TEMPLATES};

pub const IPFIX_VERSION: u16 = 10;
pub const MESSAGE_HEADER_SIZE: usize = 16;
const SET_HEADER_SIZE: usize = 4;
const TEMPLATE_RECORD_HEADER_SIZE: usize = 4;
const OPTIONS_TEMPLATE_RECORD_HEADER_SIZE: usize = 6;
const FIELD_SPECIFIER_SIZE: usize = 4;
const ENTERPRISE_NUMBER_SIZE: usize = 4;
const ENTERPRISE_BIT: u16 = 0x8000;

pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
pub const MIN_DATA_SET_ID: u16 = 256;

/// Decoded IPFIX Message Header (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub sequence_number: u32,
    pub odid: u32,
}

impl MessageHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Format(format!("message shorter than the {}-byte IPFIX header", MESSAGE_HEADER_SIZE)));
        }
        let version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let length = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let export_time = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let sequence_number = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let odid = u32::from_be_bytes(buf[12..16].try_into().unwrap());

        if version != IPFIX_VERSION {
            return Err(Error::Format(format!("unexpected IPFIX version {}", version)));
        }
        if length < MESSAGE_HEADER_SIZE as u16 {
            return Err(Error::Format(format!("message length {} shorter than the header", length)));
        }
        Ok(MessageHeader { version, length, export_time, sequence_number, odid })
    }
}

/// Outcome of parsing one raw message.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    /// `None` if the message's records were entirely dropped (e.g. a UDP
    /// message whose Export Time fell outside the reordering window) but no
    /// error occurred.
    pub message: Option<ParsedIpfixMessage>,
    /// Expired snapshots to be wrapped in `Message::Garbage` and forwarded
    /// downstream by the caller (spec §4.4 "Snapshot and garbage").
    pub garbage: Vec<GarbageMessage>,
}

/// Per-(Session, ODID, Stream) parsing state: the Template manager plus the
/// sequence-number tracking described in spec §4.4 step 3.
struct SessionState {
    manager: TemplateManager,
    expected_seq: Option<u32>,
}

/// The IPFIX parser: owns every (Session, ODID, Stream) Template manager a
/// single parser stage is responsible for (spec §5: "touched by exactly one
/// parser thread").
#[derive(Default)]
pub struct Parser {
    sessions: HashMap<SessionKey, SessionState>,
}

impl Parser {
    pub fn new() -> Self {
        Parser { sessions: HashMap::new() }
    }

    /// Drops all per-session state for `key`, returning its live snapshots
    /// as garbage so the caller can forward them downstream. Called when a
    /// session closes or (via the IE dictionary refresh protocol, spec §5)
    /// when every manager must start over.
    pub fn drop_session(&mut self, key: SessionKey) -> Vec<GarbageMessage> {
        match self.sessions.remove(&key) {
            Some(mut state) => state.manager.drain_all_snapshots().into_iter().map(GarbageMessage::new).collect(),
            None => Vec::new(),
        }
    }

    pub fn is_blocked(&self, key: SessionKey) -> bool {
        self.sessions.get(&key).map(|s| s.manager.blocked).unwrap_or(false)
    }

    fn state_mut(&mut self, key: SessionKey, session_type: SessionType, template_lifetime_secs: u32, options_template_lifetime_secs: u32) -> &mut SessionState {
        self.sessions.entry(key).or_insert_with(|| SessionState {
            manager: TemplateManager::new(key, session_type, template_lifetime_secs, options_template_lifetime_secs),
            expected_seq: None,
        })
    }

    /// Runs the full algorithm of spec §4.4 against one raw message.
    pub fn parse(
        &mut self,
        key: SessionKey,
        session_type: SessionType,
        template_lifetime_secs: u32,
        options_template_lifetime_secs: u32,
        buf: &[u8],
    ) -> Result<ParseOutcome> {
        let header = MessageHeader::read(buf)?;
        if header.length as usize != buf.len() {
            return Err(Error::Format(format!(
                "header declares length {} but buffer holds {} bytes",
                header.length,
                buf.len()
            )));
        }

        if self.sessions.get(&key).map(|s| s.manager.blocked).unwrap_or(false) {
            return Err(Error::Format(format!("session {} is blocked on a prior format error", key)));
        }

        let state = self.state_mut(key, session_type, template_lifetime_secs, options_template_lifetime_secs);
        let time_outcome = match state.manager.set_export_time(header.export_time) {
            Ok(outcome) => outcome,
            Err(e) => {
                flow_log!(log::Level::Warn, Component::Parser, key.session, Some(key.odid), "export time rejected: {}", e);
                return Err(e);
            }
        };

        if time_outcome == TimeOutcome::TooOld {
            flow_log!(log::Level::Info, Component::Parser, key.session, Some(key.odid), "export time {} outside reordering window, dropping data records", header.export_time);
            return Ok(ParseOutcome::default());
        }

        let in_sequence = match state.expected_seq {
            None => true,
            Some(expected) => expected == header.sequence_number,
        };
        if !in_sequence {
            flow_log!(
                log::Level::Warn,
                Component::Parser,
                key.session,
                Some(key.odid),
                "out-of-sequence message: expected {:?}, observed {}",
                state.expected_seq,
                header.sequence_number
            );
        }

        let mut garbage = Vec::new();
        let mut message = ParsedIpfixMessage::new(key, header.export_time, header.sequence_number, buf.to_vec());

        let result = self.parse_sets(key, &mut message, &mut garbage);
        if let Err(e) = result {
            let state = self.sessions.get_mut(&key).expect("state inserted above");
            state.manager.blocked = true;
            return Err(e);
        }

        let state = self.sessions.get_mut(&key).expect("state inserted above");
        if in_sequence {
            let record_count = message.record_count() as u32;
            let base = state.expected_seq.unwrap_or(header.sequence_number);
            let advanced = if seq_lt(base, header.sequence_number) { header.sequence_number } else { base };
            state.expected_seq = Some(advanced.wrapping_add(record_count));
        }

        Ok(ParseOutcome { message: Some(message), garbage })
    }

    fn parse_sets(&mut self, key: SessionKey, message: &mut ParsedIpfixMessage, garbage: &mut Vec<GarbageMessage>) -> Result<()> {
        let buf = message.buffer.clone();
        let mut offset = MESSAGE_HEADER_SIZE;

        while offset + SET_HEADER_SIZE <= buf.len() {
            let set_id = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap());
            let set_length = u16::from_be_bytes(buf[offset + 2..offset + 4].try_into().unwrap()) as usize;
            if set_length < SET_HEADER_SIZE || offset + set_length > buf.len() {
                return Err(Error::Format(format!("set at offset {} declares invalid length {}", offset, set_length)));
            }

            let content_start = offset + SET_HEADER_SIZE;
            let content_end = offset + set_length;
            let content = &buf[content_start..content_end];

            message.sets.push(SetRef { set_id, offset, length: set_length });

            match set_id {
                TEMPLATE_SET_ID => self.parse_template_set(key, content, false, garbage)?,
                OPTIONS_TEMPLATE_SET_ID => self.parse_template_set(key, content, true, garbage)?,
                id if id >= MIN_DATA_SET_ID => self.parse_data_set(key, id, content_start, content, message)?,
                id => {
                    flow_log!(log::Level::Info, Component::Parser, key.session, Some(key.odid), "skipping reserved set id {}", id);
                }
            }

            offset = content_end;
        }

        Ok(())
    }

    fn parse_template_set(&mut self, key: SessionKey, content: &[u8], options: bool, garbage: &mut Vec<GarbageMessage>) -> Result<()> {
        let state = self.sessions.get_mut(&key).expect("state inserted by caller");
        let mut offset = 0usize;

        while offset + TEMPLATE_RECORD_HEADER_SIZE <= content.len() {
            let id = u16::from_be_bytes(content[offset..offset + 2].try_into().unwrap());
            let field_count = u16::from_be_bytes(content[offset + 2..offset + 4].try_into().unwrap());

            if field_count == 0 {
                // Withdrawal (spec §4.4 step 4). A withdrawal with ID 2/3
                // withdraws all templates of that kind.
                offset += TEMPLATE_RECORD_HEADER_SIZE;
                match state.manager.withdraw(id, options) {
                    Ok(Some(old)) => garbage.push(GarbageMessage::new(old)),
                    Ok(None) => {}
                    Err(Error::Notfound(msg)) => {
                        flow_log!(log::Level::Warn, Component::Parser, key.session, Some(key.odid), "{}", msg);
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let (fields, scope_field_count, consumed) = if options {
                if offset + OPTIONS_TEMPLATE_RECORD_HEADER_SIZE > content.len() {
                    return Err(Error::Format("truncated options template record header".into()));
                }
                let scope_count = u16::from_be_bytes(content[offset + 4..offset + 6].try_into().unwrap());
                let (fields, consumed) = read_field_specifiers(&content[offset + OPTIONS_TEMPLATE_RECORD_HEADER_SIZE..], field_count)?;
                (fields, scope_count, OPTIONS_TEMPLATE_RECORD_HEADER_SIZE + consumed)
            } else {
                let (fields, consumed) = read_field_specifiers(&content[offset + TEMPLATE_RECORD_HEADER_SIZE..], field_count)?;
                (fields, 0, TEMPLATE_RECORD_HEADER_SIZE + consumed)
            };

            let kind = if options { TemplateKind::OptionsTemplate { scope_field_count } } else { TemplateKind::Template };
            let template = Template::new(id, kind, fields)?;

            match state.manager.insert_template(template) {
                Ok(Some(old)) => garbage.push(GarbageMessage::new(old)),
                Ok(None) => {}
                Err(e) => return Err(e.denied_as_format()),
            }

            offset += consumed;
        }

        Ok(())
    }

    fn parse_data_set(&mut self, key: SessionKey, set_id: u16, content_offset: usize, content: &[u8], message: &mut ParsedIpfixMessage) -> Result<()> {
        let state = self.sessions.get_mut(&key).expect("state inserted by caller");
        let snapshot = state.manager.snapshot_for(message.export_time);
        let template = match snapshot.get(set_id) {
            Some(t) => Arc::clone(t),
            None => {
                flow_log!(log::Level::Warn, Component::Parser, key.session, Some(key.odid), "no template for data set id {}, skipping", set_id);
                return Ok(());
            }
        };

        let mut offset = 0usize;
        if let Some(fixed_len) = template.fixed_record_length() {
            if fixed_len == 0 {
                return Ok(());
            }
            while offset + fixed_len <= content.len() {
                message.records.push(DataRecordRef {
                    offset: content_offset + offset,
                    size: fixed_len,
                    template: Arc::clone(&template),
                    snapshot: Arc::clone(&snapshot),
                });
                offset += fixed_len;
            }
        } else {
            while offset < content.len() {
                let (_fields, size) = template.read_record(&content[offset..])?;
                message.records.push(DataRecordRef {
                    offset: content_offset + offset,
                    size,
                    template: Arc::clone(&template),
                    snapshot: Arc::clone(&snapshot),
                });
                offset += size;
            }
        }

        Ok(())
    }
}

/// Reads `count` Field Specifiers, each `⟨enterprise?, id, length⟩` with the
/// high bit of `id` indicating a following 4-byte Enterprise Number (spec
/// §6).
fn read_field_specifiers(buf: &[u8], count: u16) -> Result<(Vec<Field>, usize)> {
    let mut offset = 0usize;
    let mut fields = Vec::with_capacity(count as usize);

    for _ in 0..count {
        if offset + FIELD_SPECIFIER_SIZE > buf.len() {
            return Err(Error::Format("truncated field specifier".into()));
        }
        let raw_id = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap());
        let length = u16::from_be_bytes(buf[offset + 2..offset + 4].try_into().unwrap());
        offset += FIELD_SPECIFIER_SIZE;

        let (enterprise, id) = if raw_id & ENTERPRISE_BIT != 0 {
            if offset + ENTERPRISE_NUMBER_SIZE > buf.len() {
                return Err(Error::Format("truncated enterprise number".into()));
            }
            let en = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
            offset += ENTERPRISE_NUMBER_SIZE;
            (en, raw_id & !ENTERPRISE_BIT)
        } else {
            (0, raw_id)
        };

        fields.push(Field::new(enterprise, id, length));
    }

    Ok((fields, offset))
}

/// Sequence-number wraparound comparator (spec §4.4 step 3, §9): `a < b` iff
/// `(a - b)` has its high bit set. Re-exported here under the parser's own
/// name since it governs sequence numbers, while `template::manager::seq_lt`
/// governs Export Time — same arithmetic, different domain.
pub fn seq_lt(a: u32, b: u32) -> bool {
    crate::template::manager::seq_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use hex_literal::hex;

    fn key() -> SessionKey {
        SessionKey::new(SessionId::new(), 1, 0)
    }

    fn template_set(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (fid, flen) in fields {
            body.extend_from_slice(&fid.to_be_bytes());
            body.extend_from_slice(&flen.to_be_bytes());
        }
        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&((body.len() + SET_HEADER_SIZE) as u16).to_be_bytes());
        set.extend(body);
        set
    }

    fn data_set(template_id: u16, records: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for r in records {
            body.extend_from_slice(r);
        }
        let mut set = Vec::new();
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&((body.len() + SET_HEADER_SIZE) as u16).to_be_bytes());
        set.extend(body);
        set
    }

    fn message(export_time: u32, seq: u32, odid: u32, sets: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        let total_len: usize = MESSAGE_HEADER_SIZE + sets.iter().map(|s| s.len()).sum::<usize>();
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&export_time.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&odid.to_be_bytes());
        for s in sets {
            buf.extend(s);
        }
        buf
    }

    #[test]
    fn ipfix_happy_path() {
        // spec §8 scenario 1
        let tmpl = template_set(256, &[(8, 4), (12, 4), (1, 8)]);
        let record = |a: u32, b: u32, c: u64| -> Vec<u8> {
            let mut v = Vec::new();
            v.extend_from_slice(&a.to_be_bytes());
            v.extend_from_slice(&b.to_be_bytes());
            v.extend_from_slice(&c.to_be_bytes());
            v
        };
        let records = vec![record(1, 2, 3), record(4, 5, 6)];
        let data = data_set(256, &records);

        let msg1 = message(100, 0, 1, &[tmpl]);
        let msg2 = message(100, 0, 1, &[data]);

        let mut parser = Parser::new();
        let k = key();
        parser.parse(k, SessionType::Tcp, 1800, 1800, &msg1).unwrap();
        let outcome = parser.parse(k, SessionType::Tcp, 1800, 1800, &msg2).unwrap();

        let parsed = outcome.message.unwrap();
        assert_eq!(parsed.records.len(), 2);
    }

    #[test]
    fn udp_template_replacement_emits_garbage() {
        let tmpl1 = template_set(256, &[(8, 4)]);
        let tmpl2 = template_set(256, &[(8, 4), (12, 4)]);

        let mut parser = Parser::new();
        let k = key();
        parser.parse(k, SessionType::Udp, 1800, 1800, &message(10, 0, 1, &[tmpl1])).unwrap();
        let outcome = parser.parse(k, SessionType::Udp, 1800, 1800, &message(11, 0, 1, &[tmpl2])).unwrap();
        assert_eq!(outcome.garbage.len(), 1);
    }

    #[test]
    fn tcp_redefinition_without_withdrawal_blocks_session() {
        let tmpl1 = template_set(256, &[(8, 4)]);
        let tmpl2 = template_set(256, &[(8, 4), (12, 4)]);

        let mut parser = Parser::new();
        let k = key();
        parser.parse(k, SessionType::Tcp, 1800, 1800, &message(10, 0, 1, &[tmpl1])).unwrap();
        let err = parser.parse(k, SessionType::Tcp, 1800, 1800, &message(11, 0, 1, &[tmpl2])).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(parser.is_blocked(k));

        let tmpl3 = template_set(300, &[(8, 4)]);
        let err2 = parser.parse(k, SessionType::Tcp, 1800, 1800, &message(12, 0, 1, &[tmpl3])).unwrap_err();
        assert!(matches!(err2, Error::Format(_)));
    }

    #[test]
    fn unknown_data_set_template_is_skipped_not_errored() {
        let data = data_set(300, &[vec![1, 2, 3, 4]]);
        let mut parser = Parser::new();
        let outcome = parser.parse(key(), SessionType::Tcp, 1800, 1800, &message(10, 0, 1, &[data])).unwrap();
        assert_eq!(outcome.message.unwrap().records.len(), 0);
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut parser = Parser::new();
        let err = parser.parse(key(), SessionType::Tcp, 1800, 1800, &hex!("000a")).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut parser = Parser::new();
        let mut msg = message(10, 0, 1, &[]);
        msg[0] = 0;
        msg[1] = 9;
        let err = parser.parse(key(), SessionType::Tcp, 1800, 1800, &msg).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn sequence_number_out_of_order_is_processed_but_not_advanced() {
        let tmpl = template_set(256, &[(8, 4)]);
        let mut parser = Parser::new();
        let k = key();
        parser.parse(k, SessionType::Tcp, 1800, 1800, &message(10, 0, 1, &[tmpl])).unwrap();

        let record = vec![9, 9, 9, 9];
        let data1 = data_set(256, &[record.clone()]);
        // sequence jumps ahead unexpectedly
        parser.parse(k, SessionType::Tcp, 1800, 1800, &message(10, 5, 1, &[data1])).unwrap();

        // the next in-order message (seq 0, matching what was expected
        // before the jump) is still processed without error
        let data2 = data_set(256, &[record]);
        let outcome = parser.parse(k, SessionType::Tcp, 1800, 1800, &message(10, 0, 1, &[data2])).unwrap();
        assert_eq!(outcome.message.unwrap().records.len(), 1);
    }
}
