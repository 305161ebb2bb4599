//! IPFIX/NetFlow v5/v9 flow-export collector core: a ring-buffered,
//! multi-stage pipeline that turns exporter wire traffic into parsed IPFIX
//! messages and fans them out to configured outputs.

pub mod builder;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod feedback;
pub mod ie;
pub mod logging;
pub mod message;
pub mod modifier;
pub mod netflow;
pub mod odid_range;
pub mod output_manager;
pub mod parser;
pub mod ring;
pub mod session;
pub mod stage;
pub mod template;
