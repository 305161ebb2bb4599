//! Per (Transport Session, ODID[, Stream]) Template manager (spec §3, §4.4).
//!
//! Touched by exactly one parser thread (spec §5), so no internal locking is
//! needed; the only cross-thread sharing is the `Arc<Snapshot>` handed out to
//! parsed messages and garbage messages.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::session::{SessionKey, SessionType};
use crate::template::snapshot::Snapshot;
use crate::template::template::{Template, TemplateKind, WITHDRAW_ALL_OPTIONS_TEMPLATES, WITHDRAW_ALL_TEMPLATES};

/// What a parser should do with the Sets of a message, after telling the
/// manager the message's Export Time (spec §4.4 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOutcome {
    /// Proceed: Sets should be parsed against the returned snapshot.
    Proceed,
    /// UDP only: the Export Time is out of the manager's reordering window.
    /// Drop the message's data records (and, matching the reference
    /// implementation, skip parsing the rest of the message too); this is
    /// not an error.
    TooOld,
}

struct HistoryEntry {
    valid_from: u32,
    snapshot: Arc<Snapshot>,
}

/// Per-(Session, ODID, Stream) template store (spec §3 "Template manager").
pub struct TemplateManager {
    pub key: SessionKey,
    session_type: SessionType,
    current: Arc<Snapshot>,
    current_valid_from: u32,
    /// Only populated for UDP; TCP/SCTP/FILE never need history because
    /// Export Time only moves forward for them.
    history: Vec<HistoryEntry>,
    seen_time: bool,
    template_lifetime_secs: u32,
    options_template_lifetime_secs: u32,
    /// Set on a FORMAT error; the owning stage is expected to close/block
    /// the session once this is true (spec §4.4 "State machine").
    pub blocked: bool,
}

impl TemplateManager {
    pub fn new(key: SessionKey, session_type: SessionType, template_lifetime_secs: u32, options_template_lifetime_secs: u32) -> Self {
        TemplateManager {
            key,
            session_type,
            current: Arc::new(Snapshot::empty(0)),
            current_valid_from: 0,
            history: Vec::new(),
            seen_time: false,
            template_lifetime_secs,
            options_template_lifetime_secs,
            blocked: false,
        }
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current)
    }

    /// Sets the manager's Export Time for the message currently being
    /// parsed (spec §4.4 step 2).
    pub fn set_export_time(&mut self, export_time: u32) -> Result<TimeOutcome> {
        if self.session_type.is_ordered_stream() {
            if self.seen_time && seq_lt(export_time, self.current_valid_from) {
                self.blocked = true;
                return Err(Error::Format(format!(
                    "export time went backwards ({} -> {}) on an ordered-stream session",
                    self.current_valid_from, export_time
                )));
            }
            self.seen_time = true;
            if !seq_lt(export_time, self.current_valid_from) {
                self.current_valid_from = export_time;
            }
            Ok(TimeOutcome::Proceed)
        } else {
            if self.seen_time && export_time < self.current_valid_from {
                let age = self.current_valid_from - export_time;
                let lifetime = self.template_lifetime_secs.max(self.options_template_lifetime_secs);
                if age > lifetime {
                    return Ok(TimeOutcome::TooOld);
                }
                if self.lookup_historical(export_time).is_none() {
                    return Ok(TimeOutcome::TooOld);
                }
                return Ok(TimeOutcome::Proceed);
            }

            let first_message = !self.seen_time;
            self.seen_time = true;
            if first_message || export_time >= self.current_valid_from {
                self.current_valid_from = export_time;
            }
            self.prune_history();
            Ok(TimeOutcome::Proceed)
        }
    }

    /// Returns the snapshot that should be used to decode a message whose
    /// Export Time was already accepted by [`TemplateManager::set_export_time`].
    pub fn snapshot_for(&self, export_time: u32) -> Arc<Snapshot> {
        if !self.session_type.is_ordered_stream() && export_time < self.current_valid_from {
            if let Some(s) = self.lookup_historical(export_time) {
                return s;
            }
        }
        Arc::clone(&self.current)
    }

    fn lookup_historical(&self, export_time: u32) -> Option<Arc<Snapshot>> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.valid_from <= export_time)
            .map(|entry| Arc::clone(&entry.snapshot))
    }

    fn prune_history(&mut self) {
        let newest = self.current_valid_from;
        let lifetime = self.template_lifetime_secs.max(self.options_template_lifetime_secs);
        self.history.retain(|entry| newest.saturating_sub(entry.valid_from) <= lifetime);
    }

    fn supersede(&mut self, new_snapshot: Snapshot) -> Arc<Snapshot> {
        let old = Arc::clone(&self.current);
        if !self.session_type.is_ordered_stream() {
            self.history.push(HistoryEntry { valid_from: self.current_valid_from, snapshot: Arc::clone(&self.current) });
            self.prune_history();
        }
        self.current = Arc::new(new_snapshot);
        old
    }

    /// Inserts a validated Template. Returns the superseded snapshot (to be
    /// wrapped in a Garbage message by the caller) if one existed and is no
    /// longer the current snapshot, per spec §4.4's acceptance rules:
    /// - TCP/SCTP/FILE: redefining an existing ID without withdrawal fails
    ///   with `DENIED`.
    /// - UDP: redefinition implicitly replaces.
    pub fn insert_template(&mut self, template: Template) -> Result<Option<Arc<Snapshot>>> {
        let id = template.id;
        if let Some(existing) = self.current.get(id) {
            if existing.as_ref() == &template {
                // Identical redefinition: a no-op, not a new snapshot.
                return Ok(None);
            }
            if self.session_type.is_ordered_stream() {
                self.blocked = true;
                return Err(Error::Denied(format!(
                    "template {} redefined without withdrawal on a {} session",
                    id, self.session_type
                )));
            }
        }

        let new_snapshot = self.current.with_upsert(self.current_valid_from, Arc::new(template));
        Ok(Some(self.supersede(new_snapshot)))
    }

    /// Withdraws one template, or (if `id` is the reserved "withdraw all"
    /// value for its Set) every template of that kind. Withdrawals over UDP
    /// are ignored (spec §4.4).
    pub fn withdraw(&mut self, id: u16, is_options_set: bool) -> Result<Option<Arc<Snapshot>>> {
        if !self.session_type.is_ordered_stream() {
            return Ok(None);
        }

        let reserved_all = (is_options_set && id == WITHDRAW_ALL_OPTIONS_TEMPLATES) || (!is_options_set && id == WITHDRAW_ALL_TEMPLATES);

        if reserved_all {
            if self.current.is_empty() {
                return Ok(None);
            }
            let new_snapshot = self.current.with_removed_all(self.current_valid_from, is_options_set);
            return Ok(Some(self.supersede(new_snapshot)));
        }

        if self.current.get(id).is_none() {
            return Err(Error::Notfound(format!("withdraw of unknown template {}", id)));
        }

        let new_snapshot = self.current.with_removed(self.current_valid_from, id);
        Ok(Some(self.supersede(new_snapshot)))
    }

    /// Discards every snapshot (current and historical) this manager holds,
    /// returning them so the caller can wrap each in a Garbage message. Used
    /// when the IE dictionary is swapped (spec §5).
    pub fn drain_all_snapshots(&mut self) -> Vec<Arc<Snapshot>> {
        let mut all: Vec<Arc<Snapshot>> = self.history.drain(..).map(|h| h.snapshot).collect();
        all.push(std::mem::replace(&mut self.current, Arc::new(Snapshot::empty(self.current_valid_from))));
        all
    }
}

/// Sequence-number-style wraparound comparator, reused here for Export Time
/// ordering on ordered-stream sessions (spec §4.4 step 3 / §9): `a < b` iff
/// `(a - b)` has its high bit set.
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) & 0x8000_0000) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::field::Field;

    fn key() -> SessionKey {
        SessionKey::new(crate::session::SessionId::new(), 1, 0)
    }

    fn tmpl(id: u16, marker: u16) -> Template {
        Template::new(id, TemplateKind::Template, vec![Field::standard(marker, 4)]).unwrap()
    }

    #[test]
    fn tcp_redefinition_without_withdrawal_is_denied() {
        let mut mgr = TemplateManager::new(key(), SessionType::Tcp, 1800, 1800);
        mgr.set_export_time(10).unwrap();
        mgr.insert_template(tmpl(256, 1)).unwrap();
        let err = mgr.insert_template(tmpl(256, 2)).unwrap_err();
        assert!(matches!(err, Error::Denied(_)));
        assert!(mgr.blocked);
    }

    #[test]
    fn udp_redefinition_replaces_and_emits_garbage() {
        let mut mgr = TemplateManager::new(key(), SessionType::Udp, 1800, 1800);
        mgr.set_export_time(10).unwrap();
        let garbage1 = mgr.insert_template(tmpl(256, 1)).unwrap();
        assert!(garbage1.is_some()); // superseded the initial empty snapshot

        mgr.set_export_time(11).unwrap();
        let garbage2 = mgr.insert_template(tmpl(256, 2)).unwrap();
        let old = garbage2.unwrap();
        assert!(old.get(256).is_some());
        assert_eq!(mgr.current_snapshot().get(256).unwrap().fields[0].id, 2);
    }

    #[test]
    fn tcp_export_time_must_not_go_backwards() {
        let mut mgr = TemplateManager::new(key(), SessionType::Tcp, 1800, 1800);
        mgr.set_export_time(100).unwrap();
        let err = mgr.set_export_time(50).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn udp_allows_reordering_within_lifetime() {
        let mut mgr = TemplateManager::new(key(), SessionType::Udp, 60, 60);
        mgr.set_export_time(100).unwrap();
        mgr.insert_template(tmpl(256, 1)).unwrap();
        mgr.set_export_time(110).unwrap();
        mgr.insert_template(tmpl(256, 2)).unwrap();

        // A late, older packet still within the lifetime window.
        let outcome = mgr.set_export_time(105).unwrap();
        assert_eq!(outcome, TimeOutcome::Proceed);
        let snap = mgr.snapshot_for(105);
        assert_eq!(snap.get(256).unwrap().fields[0].id, 1);
    }

    #[test]
    fn udp_drops_too_old_messages() {
        let mut mgr = TemplateManager::new(key(), SessionType::Udp, 5, 5);
        mgr.set_export_time(100).unwrap();
        mgr.insert_template(tmpl(256, 1)).unwrap();

        let outcome = mgr.set_export_time(50).unwrap();
        assert_eq!(outcome, TimeOutcome::TooOld);
    }

    #[test]
    fn udp_withdrawals_are_ignored() {
        let mut mgr = TemplateManager::new(key(), SessionType::Udp, 1800, 1800);
        mgr.set_export_time(10).unwrap();
        mgr.insert_template(tmpl(256, 1)).unwrap();
        let result = mgr.withdraw(256, false).unwrap();
        assert!(result.is_none());
        assert!(mgr.current_snapshot().get(256).is_some());
    }

    #[test]
    fn withdraw_all_removes_only_matching_kind() {
        let mut mgr = TemplateManager::new(key(), SessionType::Tcp, 1800, 1800);
        mgr.set_export_time(10).unwrap();
        mgr.insert_template(tmpl(256, 1)).unwrap();
        let opts = Template::new(257, TemplateKind::OptionsTemplate { scope_field_count: 1 }, vec![Field::standard(1, 4), Field::standard(2, 4)])
            .unwrap();
        mgr.insert_template(opts).unwrap();

        mgr.withdraw(WITHDRAW_ALL_TEMPLATES, false).unwrap();
        assert!(mgr.current_snapshot().get(256).is_none());
        assert!(mgr.current_snapshot().get(257).is_some());
    }

    #[test]
    fn seq_lt_matches_modular_distance() {
        assert!(seq_lt(0, 1));
        assert!(!seq_lt(1, 0));
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
        assert!(!seq_lt(5, 5));
    }
}
