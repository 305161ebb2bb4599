//! Ambient configuration surface (spec §6, §7 NEW).
//!
//! Covers only the part of the external configurator this crate owns: ring
//! sizing, UDP template lifetimes, NetFlow refresh intervals, and output
//! ODID filter expressions. The XML instance topology itself (which plugin
//! runs where) stays an external, unimplemented concern per spec §6.
//!
//! Uses the `config` crate the same way `cdeconinck-ipfix`'s
//! `settings.rs`/`utils.rs` did: merge an optional file over built-in
//! defaults, then deserialize into a typed struct via `serde`.

use std::path::Path;

use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::ring;
use crate::session::{DEFAULT_UDP_OPTIONS_TEMPLATE_LIFETIME, DEFAULT_UDP_TEMPLATE_LIFETIME};

/// One configured output destination (spec §4.7): a name for logging and an
/// ODID filter expression in `odid_range`'s textual form (e.g.
/// `"only:1-100"`, `"except:13"`, `"none"`).
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub odid_filter: String,
}

/// Per-session-type template bookkeeping (spec §3, §4.4), seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_template_lifetime_secs")]
    pub udp_template_lifetime_secs: u32,
    #[serde(default = "default_options_template_lifetime_secs")]
    pub udp_options_template_lifetime_secs: u32,
}

fn default_template_lifetime_secs() -> u32 {
    DEFAULT_UDP_TEMPLATE_LIFETIME.as_secs() as u32
}

fn default_options_template_lifetime_secs() -> u32 {
    DEFAULT_UDP_OPTIONS_TEMPLATE_LIFETIME.as_secs() as u32
}

/// Ring sizing (spec §2, §4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_ring_capacity")]
    pub capacity: usize,
}

fn default_ring_capacity() -> usize {
    ring::DEFAULT_CAPACITY
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig { capacity: default_ring_capacity() }
    }
}

/// NetFlow v5/v9 converter refresh intervals (spec §4.5, §4.6), seconds
/// between re-emitting the synthesized Template Set.
#[derive(Debug, Clone, Deserialize)]
pub struct NetflowConfig {
    #[serde(default = "default_v5_refresh_secs")]
    pub v5_template_refresh_secs: u32,
}

fn default_v5_refresh_secs() -> u32 {
    300
}

impl Default for NetflowConfig {
    fn default() -> Self {
        NetflowConfig { v5_template_refresh_secs: default_v5_refresh_secs() }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            udp_template_lifetime_secs: default_template_lifetime_secs(),
            udp_options_template_lifetime_secs: default_options_template_lifetime_secs(),
        }
    }
}

/// The full configuration surface this crate owns.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub netflow: NetflowConfig,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings { ring: RingConfig::default(), template: TemplateConfig::default(), netflow: NetflowConfig::default(), outputs: Vec::new() }
    }
}

impl Settings {
    /// Loads settings from an optional file, falling back to built-in
    /// defaults for anything the file doesn't set (spec §6).
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }
        let config = builder.build()?;

        match config_file {
            Some(_) => config.try_deserialize(),
            None => Ok(Settings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_used_with_no_config_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.ring.capacity, ring::DEFAULT_CAPACITY);
        assert_eq!(settings.template.udp_template_lifetime_secs, 1800);
        assert!(settings.outputs.is_empty());
    }
}
