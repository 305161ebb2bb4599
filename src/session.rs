//! Transport Session identity (spec §3).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transport used by an exporter connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    Tcp,
    Udp,
    Sctp,
    File,
}

impl SessionType {
    /// TCP/SCTP/FILE share the "ordered stream" template rules; UDP is the
    /// odd one out (reordering window, implicit redefinition, withdrawals
    /// ignored). Spec §3, §4.4.
    pub fn is_ordered_stream(&self) -> bool {
        !matches!(self, SessionType::Udp)
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionType::Tcp => "tcp",
            SessionType::Udp => "udp",
            SessionType::Sctp => "sctp",
            SessionType::File => "file",
        };
        f.write_str(s)
    }
}

/// Process-unique handle for a Transport Session. Sessions are created by an
/// input stage on first packet and destroyed only after every downstream
/// stage has observed their close event (spec §3) — the id lets every stage
/// refer to the same session without sharing the `TransportSession` value
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn new() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default lifetimes for UDP template / options-template snapshots, in
/// seconds. These are the historical ipfixcol2 defaults (spec §3 NEW).
pub const DEFAULT_UDP_TEMPLATE_LIFETIME: Duration = Duration::from_secs(1800);
pub const DEFAULT_UDP_OPTIONS_TEMPLATE_LIFETIME: Duration = Duration::from_secs(1800);

/// Identity of a remote exporter endpoint (spec §3).
#[derive(Debug, Clone)]
pub struct TransportSession {
    pub id: SessionId,
    pub session_type: SessionType,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    /// Only meaningful for UDP; ignored otherwise.
    pub template_lifetime: Duration,
    pub options_template_lifetime: Duration,
    /// Descriptive label used only for logging.
    pub label: String,
}

impl TransportSession {
    pub fn new(session_type: SessionType, source: SocketAddr, destination: SocketAddr) -> Self {
        let id = SessionId::new();
        TransportSession {
            id,
            session_type,
            source,
            destination,
            template_lifetime: DEFAULT_UDP_TEMPLATE_LIFETIME,
            options_template_lifetime: DEFAULT_UDP_OPTIONS_TEMPLATE_LIFETIME,
            label: format!("{}:{}->{}", session_type, source, destination),
        }
    }
}

impl fmt::Display for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// The (Session, ODID, Stream-ID) scoping unit for templates (spec §3).
/// Stream-ID is nonzero only for SCTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session: SessionId,
    pub odid: u32,
    pub stream: u16,
}

impl SessionKey {
    pub fn new(session: SessionId, odid: u32, stream: u16) -> Self {
        SessionKey { session, odid, stream }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream == 0 {
            write!(f, "session={} odid={}", self.session, self.odid)
        } else {
            write!(f, "session={} odid={} stream={}", self.session, self.odid, self.stream)
        }
    }
}
