//! Core error kinds shared by every component of the pipeline (spec §7).
//!
//! `OK` from the specification is simply `Result::Ok` here; every other kind
//! gets its own variant so call sites can match on exactly the failure modes
//! the spec distinguishes.

use std::fmt;

use thiserror::Error;

/// Error surfaced by core APIs (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation failure. The calling stage must initiate fast termination.
    #[error("memory allocation failed: {0}")]
    Nomem(String),

    /// Malformed message or template. The parser closes or blocks the
    /// offending Transport Session but the pipeline keeps running.
    #[error("malformed message: {0}")]
    Format(String),

    /// Protocol rule violation (e.g. template redefinition without
    /// withdrawal over TCP). Always handled identically to `Format`.
    #[error("protocol rule violated: {0}")]
    Denied(String),

    /// Lookup miss for a requested session or template.
    #[error("not found: {0}")]
    Notfound(String),

    /// Internal invariant violation. Treated as fatal.
    #[error("internal invariant violated: {0}")]
    Arg(String),

    /// Modifier Template-ID exhaustion; recovered by restarting the
    /// per-context template table.
    #[error("template id space exhausted: {0}")]
    Limit(String),
}

impl Error {
    /// True for the two kinds the spec says a parser should treat
    /// identically: close/block the session, don't tear down the pipeline.
    pub fn is_session_local(&self) -> bool {
        matches!(self, Error::Format(_) | Error::Denied(_))
    }

    /// `DENIED` is "handled as FORMAT" per spec §7. This is the single
    /// explicit conversion site; nothing else folds the two together.
    pub fn denied_as_format(self) -> Self {
        match self {
            Error::Denied(msg) => Error::Format(msg),
            other => other,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Component tag used in log lines (spec §7: "log lines tagged by component
/// name, Session identifier, and ODID").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Listener,
    Parser,
    NetflowV5,
    NetflowV9,
    TemplateManager,
    OutputManager,
    Builder,
    Modifier,
    Stage,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Listener => "listener",
            Component::Parser => "parser",
            Component::NetflowV5 => "netflow5",
            Component::NetflowV9 => "netflow9",
            Component::TemplateManager => "tmgr",
            Component::OutputManager => "outmgr",
            Component::Builder => "builder",
            Component::Modifier => "modifier",
            Component::Stage => "stage",
        };
        f.write_str(name)
    }
}
