//! Template records, snapshots, and per-session Template managers (spec §3,
//! §4.4).

pub mod field;
pub mod manager;
pub mod snapshot;
pub mod template;

pub use field::Field;
pub use manager::{TemplateManager, TimeOutcome};
pub use snapshot::Snapshot;
pub use template::{Template, TemplateKind, MIN_TEMPLATE_ID, WITHDRAW_ALL_OPTIONS_TEMPLATES, WITHDRAW_ALL_TEMPLATES};
