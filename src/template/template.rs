//! Template / Options Template records (spec §3).

use std::fmt;

use crate::error::{Error, Result};
use crate::template::field::{Field, VARIABLE_LENGTH};

/// Minimum valid Template ID (spec §3: "Identified by a 16-bit Template ID
/// ≥ 256").
pub const MIN_TEMPLATE_ID: u16 = 256;

/// Reserved Template IDs used by Set ID 2/3 withdrawal records to mean
/// "withdraw all Templates"/"withdraw all Options Templates" (spec §4.4,
/// RFC 7011 §8.1).
pub const WITHDRAW_ALL_TEMPLATES: u16 = 2;
pub const WITHDRAW_ALL_OPTIONS_TEMPLATES: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Template,
    OptionsTemplate { scope_field_count: u16 },
}

/// A Template is immutable after acceptance (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub kind: TemplateKind,
    pub fields: Vec<Field>,
}

impl Template {
    /// Validates and constructs a Template record (spec §4.4 acceptance
    /// rules: "field count > 0; scope-field count > 0 for Options
    /// Templates; fields fit").
    pub fn new(id: u16, kind: TemplateKind, fields: Vec<Field>) -> Result<Self> {
        if id < MIN_TEMPLATE_ID {
            return Err(Error::Format(format!("template id {} is below the minimum of {}", id, MIN_TEMPLATE_ID)));
        }
        if fields.is_empty() {
            return Err(Error::Format(format!("template {} has zero fields", id)));
        }
        if let TemplateKind::OptionsTemplate { scope_field_count } = kind {
            if scope_field_count == 0 {
                return Err(Error::Format(format!("options template {} has zero scope fields", id)));
            }
            if scope_field_count as usize > fields.len() {
                return Err(Error::Format(format!(
                    "options template {} declares {} scope fields but only has {} fields total",
                    id,
                    scope_field_count,
                    fields.len()
                )));
            }
        }
        Ok(Template { id, kind, fields })
    }

    pub fn is_options(&self) -> bool {
        matches!(self.kind, TemplateKind::OptionsTemplate { .. })
    }

    pub fn scope_field_count(&self) -> u16 {
        match self.kind {
            TemplateKind::OptionsTemplate { scope_field_count } => scope_field_count,
            TemplateKind::Template => 0,
        }
    }

    /// Sum of the fixed-length fields' sizes, plus one byte per
    /// variable-length field (its minimum possible wire encoding) — used as
    /// the lower bound a Data Set's content must satisfy to hold at least
    /// one record.
    pub fn min_record_length(&self) -> usize {
        self.fields
            .iter()
            .map(|f| if f.is_variable_length() { 1 } else { f.length as usize })
            .sum()
    }

    /// `Some(len)` if every field has a fixed length (the common case);
    /// `None` if any field is variable-length, in which case records must be
    /// walked one at a time via [`Template::iter_record`].
    pub fn fixed_record_length(&self) -> Option<usize> {
        if self.fields.iter().any(Field::is_variable_length) {
            None
        } else {
            Some(self.fields.iter().map(|f| f.length as usize).sum())
        }
    }

    /// Walks one Data Record at the start of `buf`, yielding
    /// `(field, value_bytes)` pairs and returning the record's total size in
    /// bytes. Handles the 1-/3-byte variable-length prefix (spec §6).
    pub fn read_record<'a>(&self, buf: &'a [u8]) -> Result<(Vec<(Field, &'a [u8])>, usize)> {
        let mut offset = 0usize;
        let mut out = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let len = if field.is_variable_length() {
                if offset >= buf.len() {
                    return Err(Error::Format("truncated data record: missing variable-length prefix".into()));
                }
                let first = buf[offset] as usize;
                if first < 255 {
                    offset += 1;
                    first
                } else {
                    if offset + 3 > buf.len() {
                        return Err(Error::Format("truncated data record: missing extended variable-length prefix".into()));
                    }
                    let len = u16::from_be_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
                    offset += 3;
                    len
                }
            } else {
                field.length as usize
            };

            if offset + len > buf.len() {
                return Err(Error::Format(format!(
                    "truncated data record: field {} needs {} bytes but only {} remain",
                    field, len, buf.len() - offset
                )));
            }

            out.push((*field, &buf[offset..offset + len]));
            offset += len;
        }

        Ok((out, offset))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TemplateKind::Template => write!(f, "Template[{}]", self.id)?,
            TemplateKind::OptionsTemplate { scope_field_count } => {
                write!(f, "OptionsTemplate[{}, scope={}]", self.id, scope_field_count)?
            }
        }
        for field in &self.fields {
            write!(f, " {}", field)?;
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn assert_variable_length_sentinel_is(_v: u16) {
    debug_assert_eq!(VARIABLE_LENGTH, 0xFFFF);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::field::Field;

    #[test]
    fn rejects_id_below_256() {
        let err = Template::new(5, TemplateKind::Template, vec![Field::standard(1, 4)]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn rejects_zero_fields() {
        let err = Template::new(256, TemplateKind::Template, vec![]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn rejects_options_template_without_scope_fields() {
        let err = Template::new(
            256,
            TemplateKind::OptionsTemplate { scope_field_count: 0 },
            vec![Field::standard(1, 4)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn fixed_record_length_sums_fields() {
        let t = Template::new(
            256,
            TemplateKind::Template,
            vec![Field::standard(8, 4), Field::standard(12, 4), Field::standard(1, 8)],
        )
        .unwrap();
        assert_eq!(t.fixed_record_length(), Some(16));
    }

    #[test]
    fn variable_length_record_has_no_fixed_length() {
        let t = Template::new(256, TemplateKind::Template, vec![Field::standard(1, VARIABLE_LENGTH)]).unwrap();
        assert_eq!(t.fixed_record_length(), None);
    }

    #[test]
    fn reads_short_variable_length_prefix() {
        let t = Template::new(256, TemplateKind::Template, vec![Field::standard(1, VARIABLE_LENGTH)]).unwrap();
        let buf = [3u8, b'a', b'b', b'c', 0xAA];
        let (fields, size) = t.read_record(&buf).unwrap();
        assert_eq!(size, 4);
        assert_eq!(fields[0].1, b"abc");
    }

    #[test]
    fn reads_extended_variable_length_prefix() {
        let t = Template::new(256, TemplateKind::Template, vec![Field::standard(1, VARIABLE_LENGTH)]).unwrap();
        let mut buf = vec![255u8, 0x01, 0x00]; // length = 256
        buf.extend(std::iter::repeat(b'x').take(256));
        let (fields, size) = t.read_record(&buf).unwrap();
        assert_eq!(size, 3 + 256);
        assert_eq!(fields[0].1.len(), 256);
    }
}
