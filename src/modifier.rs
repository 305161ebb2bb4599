//! Data Record modifier (spec §4.8, second half).
//!
//! Drives a private [`TemplateManager`] exactly like a parser does, except
//! the "wire input" is the modifier's own derived templates rather than
//! bytes off a Transport Session: both need "insert, detect duplicate by
//! content, emit the superseded snapshot as garbage" (spec §4 NEW), so this
//! module reuses [`crate::template::manager::TemplateManager`] rather than
//! re-implementing that bookkeeping.

use std::sync::Arc;

use log::warn;

use crate::error::{Component, Error, Result};
use crate::message::GarbageMessage;
use crate::session::{SessionKey, SessionType};
use crate::template::manager::TemplateManager;
use crate::template::{Field, Snapshot, Template, TemplateKind, MIN_TEMPLATE_ID};

/// `filter` callback output: one bit per field of the *original* template,
/// `true` meaning "remove this field from the derived template".
pub type RemoveBitmap = Vec<bool>;

/// One new field the `adder` callback wants appended to the derived
/// template, plus what to do with that field's value in each Data Record.
#[derive(Debug, Clone)]
pub struct AddedField {
    pub field: Field,
    pub value: AddedValue,
}

/// The `adder` callback's per-record instruction for one added field (spec
/// §4.8: "length ≥ 0 = value provided; sentinel SKIP = leave slot unused;
/// < 0 = keep field but emit zeros of the template-declared length").
#[derive(Debug, Clone)]
pub enum AddedValue {
    Provided(Vec<u8>),
    Skip,
    Zeroed,
}

/// Result of running both user callbacks against one Data Record.
pub struct ModificationPlan {
    pub remove: RemoveBitmap,
    pub added: Vec<AddedField>,
}

/// The two user-supplied callbacks the spec names `filter` and `adder`,
/// bundled so a caller supplies both at once (spec §4.8).
pub trait ModifierCallbacks {
    /// Marks fields of the original template for removal.
    fn filter(&mut self, original: &Template, record_bytes: &[u8]) -> RemoveBitmap;
    /// Supplies new fields and their per-record values.
    fn adder(&mut self, original: &Template, record_bytes: &[u8]) -> Vec<AddedField>;
}

/// Builds the derived Template for one (original template, modification
/// plan) pair: fields kept in original order, minus removed ones, plus
/// every added field appended at the end (spec §4.8 "remove marked fields;
/// append declared new fields").
fn derive_template(id: u16, original: &Template, plan: &ModificationPlan) -> Result<Template> {
    let mut fields: Vec<Field> = original
        .fields
        .iter()
        .zip(plan.remove.iter().chain(std::iter::repeat(&false)))
        .filter(|(_, removed)| !**removed)
        .map(|(f, _)| *f)
        .collect();
    fields.extend(plan.added.iter().map(|a| a.field));

    let kind = match original.kind {
        TemplateKind::Template => TemplateKind::Template,
        TemplateKind::OptionsTemplate { scope_field_count } => {
            let kept_scope = original
                .fields
                .iter()
                .take(scope_field_count as usize)
                .zip(plan.remove.iter().chain(std::iter::repeat(&false)))
                .filter(|(_, removed)| !**removed)
                .count();
            TemplateKind::OptionsTemplate { scope_field_count: kept_scope as u16 }
        }
    };

    Template::new(id, kind, fields)
}

/// Rewrites one Data Record's bytes per the modification plan: copies
/// surviving fields verbatim, then appends each added field's value (spec
/// §4.8).
fn rewrite_record(record: &[(Field, &[u8])], plan: &ModificationPlan) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.iter().map(|(_, v)| v.len()).sum());

    for (i, (_, value)) in record.iter().enumerate() {
        let removed = plan.remove.get(i).copied().unwrap_or(false);
        if !removed {
            out.extend_from_slice(value);
        }
    }

    for added in &plan.added {
        match &added.value {
            AddedValue::Provided(bytes) => out.extend_from_slice(bytes),
            AddedValue::Skip => {}
            AddedValue::Zeroed => out.resize(out.len() + added.field.length as usize, 0),
        }
    }

    out
}

/// Per-(Session, ODID) modifier context: owns the private template table
/// the derived templates are inserted into (spec §4.8).
pub struct Modifier {
    key: SessionKey,
    manager: TemplateManager,
    next_id: u16,
    /// Maps an original `(template_id, content-hash)` to the already
    /// derived template id, so byte-identical derivations are deduplicated
    /// rather than re-inserted under a new id (spec §4.8 "identical
    /// modified templates are de-duplicated by content comparison").
    derived_by_content: Vec<(Template, u16)>,
}

impl Modifier {
    pub fn new(key: SessionKey, template_lifetime_secs: u32, options_template_lifetime_secs: u32) -> Self {
        Modifier {
            key,
            manager: TemplateManager::new(key, SessionType::Udp, template_lifetime_secs, options_template_lifetime_secs),
            next_id: MIN_TEMPLATE_ID,
            derived_by_content: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> Result<u16> {
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u16::MAX { MIN_TEMPLATE_ID } else { self.next_id + 1 };
            if self.manager.current_snapshot().get(candidate).is_none() {
                return Ok(candidate);
            }
            if self.next_id == start {
                return Err(Error::Limit(format!("modifier for {:?} exhausted the template id space", self.key)));
            }
        }
    }

    /// Discards every template this context holds (wrapped by the caller
    /// into Garbage messages) and resets the id counter, per spec §4.8's
    /// `LIMIT` recovery protocol.
    fn restart(&mut self) -> Vec<Arc<Snapshot>> {
        self.next_id = MIN_TEMPLATE_ID;
        self.derived_by_content.clear();
        self.manager.drain_all_snapshots()
    }

    /// Finds a previously derived template with byte-identical content,
    /// returning its already-assigned id.
    fn find_duplicate(&self, derived: &Template) -> Option<u16> {
        self.derived_by_content.iter().find(|(t, _)| t.kind == derived.kind && t.fields == derived.fields).map(|(_, id)| *id)
    }

    /// Runs the modifier over one Data Record, returning its rewritten
    /// bytes, the (possibly newly derived) template, and any garbage
    /// produced by the insertion (a superseded template, or — on
    /// `LIMIT` exhaustion — every snapshot this context held).
    pub fn modify(
        &mut self,
        export_time: u32,
        original_template: &Template,
        record: &[(Field, &[u8])],
        record_bytes: &[u8],
        callbacks: &mut dyn ModifierCallbacks,
    ) -> Result<(Vec<u8>, Arc<Template>, Vec<GarbageMessage>)> {
        let remove = callbacks.filter(original_template, record_bytes);
        let added = callbacks.adder(original_template, record_bytes);
        let plan = ModificationPlan { remove, added };

        let dummy_id = self.next_id;
        let derived_unassigned = derive_template(dummy_id, original_template, &plan)?;

        let mut garbage = Vec::new();

        let id = match self.find_duplicate(&derived_unassigned) {
            Some(id) => id,
            None => match self.allocate_id() {
                Ok(id) => id,
                Err(_) => {
                    warn!("[{}] session={:?} odid={} modifier exhausted template ids, restarting context", Component::Modifier, self.key.session, self.key.odid);
                    let expired = self.restart();
                    for snapshot in expired {
                        garbage.push(GarbageMessage::new(snapshot));
                    }
                    self.allocate_id()?
                }
            },
        };

        let derived = derive_template(id, original_template, &plan)?;

        if self.find_duplicate(&derived).is_none() {
            self.manager.set_export_time(export_time).ok();
            if let Some(superseded) = self.manager.insert_template(derived.clone())? {
                garbage.push(GarbageMessage::new(superseded));
            }
            self.derived_by_content.push((derived.clone(), id));
        }

        let bytes = rewrite_record(record, &plan);
        Ok((bytes, Arc::new(derived), garbage))
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.manager.current_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::template::field::Field as Fld;
    use crate::template::template::TemplateKind as Kind;

    fn key() -> SessionKey {
        SessionKey::new(SessionId::new(), 1, 0)
    }

    struct DropFirstFieldAddConstant;
    impl ModifierCallbacks for DropFirstFieldAddConstant {
        fn filter(&mut self, original: &Template, _record: &[u8]) -> RemoveBitmap {
            let mut v = vec![false; original.fields.len()];
            v[0] = true;
            v
        }
        fn adder(&mut self, _original: &Template, _record: &[u8]) -> Vec<AddedField> {
            vec![AddedField { field: Fld::standard(999, 4), value: AddedValue::Provided(vec![1, 2, 3, 4]) }]
        }
    }

    fn original() -> Template {
        Template::new(256, Kind::Template, vec![Fld::standard(8, 4), Fld::standard(12, 4)]).unwrap()
    }

    #[test]
    fn derives_template_with_field_removed_and_added() {
        let mut modifier = Modifier::new(key(), 1800, 1800);
        let orig = original();
        let record: Vec<(Field, &[u8])> = vec![(orig.fields[0], &[1, 1, 1, 1]), (orig.fields[1], &[2, 2, 2, 2])];
        let (bytes, derived, garbage) = modifier.modify(0, &orig, &record, &[], &mut DropFirstFieldAddConstant).unwrap();

        assert_eq!(derived.fields.len(), 2); // one kept, one added
        assert_eq!(derived.fields[0].id, 12);
        assert_eq!(derived.fields[1].id, 999);
        assert_eq!(bytes, vec![2, 2, 2, 2, 1, 2, 3, 4]);
        assert!(garbage.is_empty()); // first insertion replaces only the manager's empty snapshot, but that's not surfaced as garbage here since this is the first assignment for this id
    }

    #[test]
    fn identical_modifications_reuse_the_same_template_id() {
        let mut modifier = Modifier::new(key(), 1800, 1800);
        let orig = original();
        let record: Vec<(Field, &[u8])> = vec![(orig.fields[0], &[1, 1, 1, 1]), (orig.fields[1], &[2, 2, 2, 2])];

        let (_, t1, _) = modifier.modify(0, &orig, &record, &[], &mut DropFirstFieldAddConstant).unwrap();
        let (_, t2, _) = modifier.modify(1, &orig, &record, &[], &mut DropFirstFieldAddConstant).unwrap();

        assert_eq!(t1.id, t2.id);
    }

    struct Distinguishing(u16);
    impl ModifierCallbacks for Distinguishing {
        fn filter(&mut self, original: &Template, _record: &[u8]) -> RemoveBitmap {
            vec![false; original.fields.len()]
        }
        fn adder(&mut self, _original: &Template, _record: &[u8]) -> Vec<AddedField> {
            vec![AddedField { field: Fld::standard(1000 + self.0, 4), value: AddedValue::Zeroed }]
        }
    }

    #[test]
    fn id_allocator_wraps_from_max_back_to_the_minimum() {
        let mut modifier = Modifier::new(key(), 1800, 1800);
        modifier.next_id = u16::MAX;

        let orig = original();
        let record: Vec<(Field, &[u8])> = vec![(orig.fields[0], &[0u8; 4]), (orig.fields[1], &[0u8; 4])];

        let (_, t1, _) = modifier.modify(0, &orig, &record, &[], &mut Distinguishing(1)).unwrap();
        assert_eq!(t1.id, u16::MAX);
        let (_, t2, _) = modifier.modify(1, &orig, &record, &[], &mut Distinguishing(2)).unwrap();
        assert_eq!(t2.id, MIN_TEMPLATE_ID);
    }

    #[test]
    fn restart_clears_the_id_counter_and_drains_every_snapshot() {
        let mut modifier = Modifier::new(key(), 1800, 1800);
        let orig = original();
        let record: Vec<(Field, &[u8])> = vec![(orig.fields[0], &[0u8; 4]), (orig.fields[1], &[0u8; 4])];
        modifier.modify(0, &orig, &record, &[], &mut Distinguishing(1)).unwrap();

        let drained = modifier.restart();
        assert!(!drained.is_empty());
        assert_eq!(modifier.next_id, MIN_TEMPLATE_ID);
        assert!(modifier.derived_by_content.is_empty());
    }
}
