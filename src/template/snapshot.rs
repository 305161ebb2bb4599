//! Template snapshot: the full set of templates valid at a given Export Time
//! within one (Session, ODID) scope (spec §3).
//!
//! Snapshots are immutable and reference-counted (`Arc`); a new snapshot is
//! produced on every template insertion or withdrawal via
//! copy-on-write (§9: "re-architect as reference-counted immutable
//! snapshots"). Rust's `Arc` does the liveness bookkeeping the original's
//! hand-rolled refcounts did by hand: a snapshot is freed the moment its
//! last `Arc` clone — held by a parsed message, a `Garbage` message, or the
//! manager itself — is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::template::template::{Template, TemplateKind};

/// An immutable set of templates, valid at one Export Time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub export_time: u32,
    templates: HashMap<u16, Arc<Template>>,
}

impl Snapshot {
    pub fn empty(export_time: u32) -> Self {
        Snapshot { export_time, templates: HashMap::new() }
    }

    pub fn get(&self, id: u16) -> Option<&Arc<Template>> {
        self.templates.get(&id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.templates.keys().copied()
    }

    /// Returns a new snapshot with `template` inserted/replaced, at
    /// `export_time`.
    pub fn with_upsert(&self, export_time: u32, template: Arc<Template>) -> Snapshot {
        let mut templates = self.templates.clone();
        templates.insert(template.id, template);
        Snapshot { export_time, templates }
    }

    /// Returns a new snapshot with `id` removed, at `export_time`.
    pub fn with_removed(&self, export_time: u32, id: u16) -> Snapshot {
        let mut templates = self.templates.clone();
        templates.remove(&id);
        Snapshot { export_time, templates }
    }

    /// Returns a new snapshot with every Template (or every Options
    /// Template) removed, per the "withdraw all" reserved IDs (spec §4.4).
    pub fn with_removed_all(&self, export_time: u32, options: bool) -> Snapshot {
        let templates = self
            .templates
            .iter()
            .filter(|(_, t)| t.is_options() != options)
            .map(|(id, t)| (*id, Arc::clone(t)))
            .collect();
        Snapshot { export_time, templates }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::field::Field;

    fn tmpl(id: u16) -> Arc<Template> {
        Arc::new(Template::new(id, TemplateKind::Template, vec![Field::standard(1, 4)]).unwrap())
    }

    #[test]
    fn upsert_is_copy_on_write() {
        let s0 = Snapshot::empty(0);
        let s1 = s0.with_upsert(1, tmpl(256));
        assert_eq!(s0.len(), 0);
        assert_eq!(s1.len(), 1);
        assert!(s1.get(256).is_some());
    }

    #[test]
    fn withdraw_all_only_removes_matching_kind() {
        let s0 = Snapshot::empty(0).with_upsert(1, tmpl(256));
        let opts = Arc::new(
            Template::new(257, TemplateKind::OptionsTemplate { scope_field_count: 1 }, vec![Field::standard(1, 4), Field::standard(2, 4)])
                .unwrap(),
        );
        let s1 = s0.with_upsert(1, opts);
        let s2 = s1.with_removed_all(2, false);
        assert!(s2.get(256).is_none());
        assert!(s2.get(257).is_some());
    }
}
