//! NetFlow v5/v9 → IPFIX converters (spec §4.5, §4.6).

pub mod v5;
pub mod v9;
