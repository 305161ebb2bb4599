//! NetFlow v9 → IPFIX converter (spec §4.6).
//!
//! The most involved converter in the crate: v9 introduces Templates (like
//! IPFIX) but with a field-ID space and Options Template framing that don't
//! line up with IPFIX's, so every (Options) Template a session defines must
//! be translated once and then replayed, record by record, against a fixed
//! instruction list. The two-level 256×256 sparse table is grounded in
//! `examples/original_source/src/core/netflow2ipfix/netflow9_templates.h`'s
//! `tmplts_l1_table`/`tmplts_l2_table`; the field remap and scope table
//! mirror `netflow9.c`'s `conv_data_map`/`conv_opts_map` in shape, though the
//! exact ID arithmetic follows spec §4.6 and §8's literal test vectors,
//! which diverge in one respect from the historical C source (see
//! DESIGN.md).

use std::convert::TryInto;

use log::warn;

use crate::error::{Error, Result};
use crate::ie;
use crate::template::field::Field;

pub const VERSION: u16 = 9;
const HEADER_SIZE: usize = 20;
const FLOWSET_HEADER_SIZE: usize = 4;
const TEMPLATE_RECORD_HEADER_SIZE: usize = 4;
const OPTIONS_TEMPLATE_RECORD_HEADER_SIZE: usize = 6;

const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
const MIN_DATA_FLOWSET_ID: u16 = 256;

/// Largest a single converted record may be: the 65535-byte wire maximum
/// minus the 16-byte IPFIX Message Header and the 4-byte Set Header the
/// record will be wrapped in (spec §4.6: "> 65535 - headers -> FORMAT").
const MAX_CONVERTED_RECORD_LEN: usize = crate::message::MAX_MESSAGE_SIZE - crate::parser::MESSAGE_HEADER_SIZE - FLOWSET_HEADER_SIZE;

const ENTERPRISE_BIT: u16 = 0x8000;
/// IPFIX Enterprise Number used for NetFlow field IDs 128..32767 (spec
/// §4.6).
const INCOMPATIBLE_EN_LOW: u32 = 4_294_967_294;
/// IPFIX Enterprise Number used for NetFlow field IDs 32768..65535.
const INCOMPATIBLE_EN_HIGH: u32 = 4_294_967_295;

/// NetFlow v9 field IDs for the relative-uptime timestamps this converter
/// rewrites to absolute IPFIX milliseconds (spec §4.6).
const FIRST_SWITCHED: u16 = 22;
const LAST_SWITCHED: u16 = 21;

/// Remaps a field id per spec §4.6: IDs ≤127 unchanged; 128..32767 gain the
/// high bit and Enterprise Number 4294967294; 32768..65535 become
/// `(id - 32768) | 0x8000` with Enterprise Number 4294967295.
fn remap_field_id(old: u16) -> (u16, u32) {
    if old <= 127 {
        (old, 0)
    } else if old <= 32767 {
        (old | ENTERPRISE_BIT, INCOMPATIBLE_EN_LOW)
    } else {
        ((old.wrapping_sub(32768)) | ENTERPRISE_BIT, INCOMPATIBLE_EN_HIGH)
    }
}

/// One data-record conversion step (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instruction {
    /// Copy `n` bytes verbatim from the NetFlow record to the IPFIX record.
    Copy(usize),
    /// Convert a 4-byte relative uptime timestamp to an 8-byte absolute
    /// millisecond timestamp.
    ConvertTs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Convert,
    /// Options Template with no recognized scope, or a field whose
    /// conversion can't be expressed; every Data Record under this
    /// Template ID is dropped (spec §4.6).
    Drop,
}

/// One entry of the sparse Template table: original and converted template
/// bytes plus the per-record instruction list (spec §4.6).
#[derive(Debug, Clone)]
struct TemplateEntry {
    action: Action,
    is_options: bool,
    /// The original `(id, length)` field list, kept only to detect
    /// byte-identical redefinitions (spec: "duplicates ... reuse the
    /// existing entry").
    raw_fields: Vec<(u16, u16)>,
    raw_scope_count: u16,
    ipfix_fields: Vec<Field>,
    instructions: Vec<Instruction>,
    nf9_record_len: usize,
    ipfix_record_len: usize,
}

/// Two-level 256×256 sparse array of Template entries (spec §4.6, §9),
/// lazily allocating each L2 page on first use.
#[derive(Default)]
struct SparseTemplateTable {
    l1: Vec<Option<Box<[Option<TemplateEntry>; 256]>>>,
}

fn split_id(id: u16) -> (usize, usize) {
    ((id >> 8) as usize, (id & 0xFF) as usize)
}

impl SparseTemplateTable {
    fn new() -> Self {
        SparseTemplateTable { l1: (0..256).map(|_| None).collect() }
    }

    fn get(&self, id: u16) -> Option<&TemplateEntry> {
        let (hi, lo) = split_id(id);
        self.l1[hi].as_ref().and_then(|l2| l2[lo].as_ref())
    }

    fn insert(&mut self, id: u16, entry: TemplateEntry) {
        let (hi, lo) = split_id(id);
        let l2 = self.l1[hi].get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        l2[lo] = Some(entry);
    }
}

/// Builds a [`TemplateEntry`] from a raw NetFlow v9 (Options) Template's
/// field list, applying field remap, scope remap, and timestamp conversion
/// (spec §4.6).
fn build_entry(is_options: bool, scope_count: u16, fields: &[(u16, u16)]) -> TemplateEntry {
    if is_options && scope_count == 0 {
        return TemplateEntry {
            action: Action::Drop,
            is_options,
            raw_fields: fields.to_vec(),
            raw_scope_count: scope_count,
            ipfix_fields: Vec::new(),
            instructions: Vec::new(),
            nf9_record_len: fields.iter().map(|(_, l)| *l as usize).sum(),
            ipfix_record_len: 0,
        };
    }

    let mut ipfix_fields = Vec::with_capacity(fields.len());
    let mut instructions = Vec::new();
    let mut copy_run = 0usize;
    let mut nf9_len = 0usize;
    let mut ipx_len = 0usize;

    for (i, (id, len)) in fields.iter().enumerate() {
        nf9_len += *len as usize;

        if i < scope_count as usize {
            match ie::v9_scope_to_ie(*id) {
                Some((en, ie_id)) => {
                    ipfix_fields.push(Field::new(en, ie_id, *len));
                    ipx_len += *len as usize;
                    copy_run += *len as usize;
                }
                None => {
                    return TemplateEntry {
                        action: Action::Drop,
                        is_options,
                        raw_fields: fields.to_vec(),
                        raw_scope_count: scope_count,
                        ipfix_fields: Vec::new(),
                        instructions: Vec::new(),
                        nf9_record_len: fields.iter().map(|(_, l)| *l as usize).sum(),
                        ipfix_record_len: 0,
                    };
                }
            }
            continue;
        }

        if *id == FIRST_SWITCHED || *id == LAST_SWITCHED {
            if copy_run > 0 {
                instructions.push(Instruction::Copy(copy_run));
                copy_run = 0;
            }
            instructions.push(Instruction::ConvertTs);
            let new_ie = if *id == FIRST_SWITCHED { ie::FLOW_START_MILLISECONDS } else { ie::FLOW_END_MILLISECONDS };
            ipfix_fields.push(Field::new(new_ie.0, new_ie.1, 8));
            ipx_len += 8;
            continue;
        }

        let (new_id, enterprise) = remap_field_id(*id);
        ipfix_fields.push(Field::new(enterprise, new_id, *len));
        ipx_len += *len as usize;
        copy_run += *len as usize;
    }

    if copy_run > 0 {
        instructions.push(Instruction::Copy(copy_run));
    }

    TemplateEntry {
        action: Action::Convert,
        is_options,
        raw_fields: fields.to_vec(),
        raw_scope_count: scope_count,
        ipfix_fields,
        instructions,
        nf9_record_len: nf9_len,
        ipfix_record_len: ipx_len,
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    count: u16,
    sys_uptime_ms: u32,
    unix_secs: u32,
    sequence: u32,
}

impl Header {
    fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Format(format!("netflow v9 message shorter than the {}-byte header", HEADER_SIZE)));
        }
        let version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Format(format!("unexpected netflow version {}, expected 9", version)));
        }
        Ok(Header {
            count: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            sys_uptime_ms: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            unix_secs: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            sequence: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    fn abs_millis(&self, relative_ms: u32) -> i64 {
        let export_ms = self.unix_secs as i64 * 1000;
        export_ms - (self.sys_uptime_ms as i64 - relative_ms as i64)
    }
}

/// Per-(Session, ODID) NetFlow v9 conversion state (spec §4.6).
pub struct Converter {
    table: SparseTemplateTable,
    expected_next_nf_seq: Option<u32>,
    next_ipfix_seq: u32,
}

impl Converter {
    pub fn new() -> Self {
        Converter { table: SparseTemplateTable::new(), expected_next_nf_seq: None, next_ipfix_seq: 0 }
    }

    /// Converts one NetFlow v9 packet into one synthesized IPFIX message.
    /// Returns `Ok(None)` if the packet carried only Template FlowSets and
    /// no Data (a valid, if empty, result).
    pub fn convert(&mut self, buf: &[u8], odid: u32) -> Result<Vec<u8>> {
        let header = Header::read(buf)?;

        match self.expected_next_nf_seq {
            None => {}
            Some(expected) if expected == header.sequence => {}
            Some(expected) => {
                warn!("netflow v9 sequence out of order: expected {}, observed {}", expected, header.sequence);
                if crate::parser::seq_lt(expected, header.sequence) {
                    self.expected_next_nf_seq = Some(header.sequence);
                }
            }
        }
        if self.expected_next_nf_seq.is_none() {
            self.expected_next_nf_seq = Some(header.sequence);
        }

        let mut out = Vec::with_capacity(buf.len());
        out.extend_from_slice(&[0u8; 16]);
        out[0..2].copy_from_slice(&crate::parser::IPFIX_VERSION.to_be_bytes());
        out[4..8].copy_from_slice(&header.unix_secs.to_be_bytes());
        out[12..16].copy_from_slice(&odid.to_be_bytes());

        let mut converted_records = 0u32;
        let mut offset = HEADER_SIZE;
        let mut recs_processed = 0u32;

        while offset + FLOWSET_HEADER_SIZE <= buf.len() {
            let flowset_id = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap());
            let flowset_len = u16::from_be_bytes(buf[offset + 2..offset + 4].try_into().unwrap()) as usize;
            if flowset_len < FLOWSET_HEADER_SIZE || offset + flowset_len > buf.len() {
                return Err(Error::Format(format!("flowset at offset {} declares invalid length {}", offset, flowset_len)));
            }
            let content = &buf[offset + FLOWSET_HEADER_SIZE..offset + flowset_len];

            match flowset_id {
                TEMPLATE_FLOWSET_ID => {
                    self.convert_template_flowset(content, false, &mut out)?;
                }
                OPTIONS_TEMPLATE_FLOWSET_ID => {
                    self.convert_template_flowset(content, true, &mut out)?;
                }
                id if id >= MIN_DATA_FLOWSET_ID => {
                    let n = self.convert_data_flowset(id, content, &mut out, &header)?;
                    converted_records += n;
                    recs_processed += n;
                }
                id => {
                    warn!("skipping reserved netflow v9 flowset id {}", id);
                }
            }

            offset += flowset_len;
        }

        if recs_processed != header.count as u32 {
            // spec §9 open question: the reference implementation only
            // warns here and never escalates to an error; this crate
            // follows that choice (see DESIGN.md).
            warn!("netflow v9 header declared {} records but {} were processed", header.count, recs_processed);
        }

        out[8..12].copy_from_slice(&self.next_ipfix_seq.to_be_bytes());
        let total_len = out.len() as u16;
        out[2..4].copy_from_slice(&total_len.to_be_bytes());

        self.next_ipfix_seq = self.next_ipfix_seq.wrapping_add(converted_records);
        self.expected_next_nf_seq = Some(header.sequence.wrapping_add(1));

        Ok(out)
    }

    fn convert_template_flowset(&mut self, content: &[u8], options: bool, out: &mut Vec<u8>) -> Result<()> {
        let mut offset = 0usize;
        let mut body = Vec::new();

        while offset + TEMPLATE_RECORD_HEADER_SIZE <= content.len() {
            let template_id = u16::from_be_bytes(content[offset..offset + 2].try_into().unwrap());

            let (fields, scope_count, consumed) = if options {
                if offset + OPTIONS_TEMPLATE_RECORD_HEADER_SIZE > content.len() {
                    return Err(Error::Format("truncated netflow v9 options template record".into()));
                }
                let scope_len = u16::from_be_bytes(content[offset + 2..offset + 4].try_into().unwrap()) as usize;
                let option_len = u16::from_be_bytes(content[offset + 4..offset + 6].try_into().unwrap()) as usize;
                let field_bytes = scope_len + option_len;
                let start = offset + OPTIONS_TEMPLATE_RECORD_HEADER_SIZE;
                if start + field_bytes > content.len() {
                    return Err(Error::Format("truncated netflow v9 options template field list".into()));
                }
                let fields = read_v9_fields(&content[start..start + field_bytes])?;
                ((fields), (scope_len / 4) as u16, OPTIONS_TEMPLATE_RECORD_HEADER_SIZE + field_bytes)
            } else {
                let field_count = u16::from_be_bytes(content[offset + 2..offset + 4].try_into().unwrap()) as usize;
                let start = offset + TEMPLATE_RECORD_HEADER_SIZE;
                let field_bytes = field_count * 4;
                if start + field_bytes > content.len() {
                    return Err(Error::Format("truncated netflow v9 template field list".into()));
                }
                let fields = read_v9_fields(&content[start..start + field_bytes])?;
                (fields, 0, TEMPLATE_RECORD_HEADER_SIZE + field_bytes)
            };

            let reuse = self.table.get(template_id).map(|e| e.raw_fields == fields && e.raw_scope_count == scope_count && e.is_options == options).unwrap_or(false);

            let entry = if reuse {
                self.table.get(template_id).cloned().expect("checked by `reuse`")
            } else {
                let entry = build_entry(options, scope_count, &fields);
                self.table.insert(template_id, entry.clone());
                entry
            };

            if entry.action == Action::Convert {
                encode_ipfix_template_record(template_id, &entry, &mut body);
            }

            offset += consumed;
        }

        if !body.is_empty() {
            let set_id = if options { crate::parser::OPTIONS_TEMPLATE_SET_ID } else { crate::parser::TEMPLATE_SET_ID };
            out.extend_from_slice(&set_id.to_be_bytes());
            out.extend_from_slice(&((body.len() + FLOWSET_HEADER_SIZE) as u16).to_be_bytes());
            out.extend(body);
        }

        Ok(())
    }

    fn convert_data_flowset(&mut self, template_id: u16, content: &[u8], out: &mut Vec<u8>, header: &Header) -> Result<u32> {
        let entry = match self.table.get(template_id) {
            Some(e) => e.clone(),
            None => {
                warn!("no netflow v9 template {} known, dropping data flowset", template_id);
                return Ok(0);
            }
        };

        if entry.action == Action::Drop {
            warn!("netflow v9 template {} marked drop, discarding its data records", template_id);
            return Ok(0);
        }

        if entry.nf9_record_len == 0 {
            return Ok(0);
        }

        let mut body = Vec::new();
        let mut count = 0u32;
        let mut offset = 0usize;
        while offset + entry.nf9_record_len <= content.len() {
            let record = &content[offset..offset + entry.nf9_record_len];
            let converted_len = convert_record(record, &entry.instructions, header, &mut body)?;
            if converted_len > MAX_CONVERTED_RECORD_LEN {
                return Err(Error::Format(format!(
                    "converted netflow v9 record is {} bytes, exceeding the {}-byte limit once ipfix headers are accounted for",
                    converted_len, MAX_CONVERTED_RECORD_LEN
                )));
            }
            count += 1;
            offset += entry.nf9_record_len;
        }

        if !body.is_empty() {
            out.extend_from_slice(&template_id.to_be_bytes());
            out.extend_from_slice(&((body.len() + FLOWSET_HEADER_SIZE) as u16).to_be_bytes());
            out.extend(body);
        }

        Ok(count)
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

fn read_v9_fields(buf: &[u8]) -> Result<Vec<(u16, u16)>> {
    if buf.len() % 4 != 0 {
        return Err(Error::Format("netflow v9 field list is not a multiple of 4 bytes".into()));
    }
    Ok(buf.chunks_exact(4).map(|c| (u16::from_be_bytes([c[0], c[1]]), u16::from_be_bytes([c[2], c[3]]))).collect())
}

fn encode_ipfix_template_record(template_id: u16, entry: &TemplateEntry, out: &mut Vec<u8>) {
    if entry.is_options {
        out.extend_from_slice(&template_id.to_be_bytes());
        out.extend_from_slice(&(entry.ipfix_fields.len() as u16).to_be_bytes());
        out.extend_from_slice(&entry.raw_scope_count.to_be_bytes());
    } else {
        out.extend_from_slice(&template_id.to_be_bytes());
        out.extend_from_slice(&(entry.ipfix_fields.len() as u16).to_be_bytes());
    }
    for f in &entry.ipfix_fields {
        if f.enterprise != 0 {
            out.extend_from_slice(&(f.id | ENTERPRISE_BIT).to_be_bytes());
            out.extend_from_slice(&f.length.to_be_bytes());
            out.extend_from_slice(&f.enterprise.to_be_bytes());
        } else {
            out.extend_from_slice(&f.id.to_be_bytes());
            out.extend_from_slice(&f.length.to_be_bytes());
        }
    }
}

/// Applies one record's instruction list, converting relative-uptime
/// timestamps to absolute IPFIX milliseconds and copying everything else
/// (spec §4.6). Returns the number of bytes appended.
fn convert_record(record: &[u8], instructions: &[Instruction], header: &Header, out: &mut Vec<u8>) -> Result<usize> {
    let start_len = out.len();
    let mut offset = 0usize;
    for instr in instructions {
        match instr {
            Instruction::Copy(n) => {
                if offset + n > record.len() {
                    return Err(Error::Format("netflow v9 record shorter than its template declares".into()));
                }
                out.extend_from_slice(&record[offset..offset + n]);
                offset += n;
            }
            Instruction::ConvertTs => {
                if offset + 4 > record.len() {
                    return Err(Error::Format("netflow v9 record truncated at a timestamp field".into()));
                }
                let relative = u32::from_be_bytes(record[offset..offset + 4].try_into().unwrap());
                offset += 4;
                out.extend_from_slice(&header.abs_millis(relative).to_be_bytes());
            }
        }
    }
    Ok(out.len() - start_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_remap_matches_spec_vectors() {
        // spec §8: field id 130 -> 130|0x8000, enterprise 4294967294
        assert_eq!(remap_field_id(130), (130 | 0x8000, INCOMPATIBLE_EN_LOW));
        // field id 40000 -> (40000-32768)|0x8000 = 7232|0x8000, enterprise 4294967295
        assert_eq!(remap_field_id(40000), (7232 | 0x8000, INCOMPATIBLE_EN_HIGH));
    }

    #[test]
    fn low_ids_pass_through_unchanged() {
        assert_eq!(remap_field_id(4), (4, 0));
        assert_eq!(remap_field_id(127), (127, 0));
    }

    #[test]
    fn sparse_table_round_trips() {
        let mut table = SparseTemplateTable::new();
        let entry = build_entry(false, 0, &[(4, 1), (8, 4)]);
        table.insert(256, entry.clone());
        assert_eq!(table.get(256).unwrap().nf9_record_len, entry.nf9_record_len);
        assert!(table.get(257).is_none());
    }

    #[test]
    fn unknown_scope_marks_template_drop() {
        let entry = build_entry(true, 1, &[(99, 4), (8, 4)]);
        assert_eq!(entry.action, Action::Drop);
    }

    #[test]
    fn known_scope_remaps_to_ipfix_ie() {
        let entry = build_entry(true, 1, &[(1, 4), (8, 4)]);
        assert_eq!(entry.action, Action::Convert);
        assert_eq!(entry.ipfix_fields[0].ie_id(), ie::EXPORTING_PROCESS_ID);
    }

    #[test]
    fn options_template_without_scope_fields_is_dropped() {
        let entry = build_entry(true, 0, &[(8, 4)]);
        assert_eq!(entry.action, Action::Drop);
    }

    #[test]
    fn converted_record_past_the_header_adjusted_limit_is_rejected() {
        // one field whose length alone clears MAX_CONVERTED_RECORD_LEN but
        // not the full 65535-byte wire maximum, so this only catches
        // oversize records once the ipfix headers are accounted for.
        let record_len = MAX_CONVERTED_RECORD_LEN + 1;
        let entry = build_entry(false, 0, &[(4, record_len as u16)]);

        let mut converter = Converter::new();
        converter.table.insert(256, entry);

        let header = Header { count: 1, sys_uptime_ms: 0, unix_secs: 0, sequence: 0 };
        let content = vec![0u8; record_len];
        let mut out = Vec::new();
        let err = converter.convert_data_flowset(256, &content, &mut out, &header).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
