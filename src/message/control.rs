//! Session-control and termination messages (spec §3).

use crate::session::{SessionId, TransportSession};

/// Announces a Transport Session's creation or close to every downstream
/// stage (spec §3 "Session-control message").
#[derive(Debug, Clone)]
pub enum SessionControl {
    Open(TransportSession),
    Close(SessionId),
}

impl SessionControl {
    pub fn session(&self) -> SessionId {
        match self {
            SessionControl::Open(s) => s.id,
            SessionControl::Close(id) => *id,
        }
    }
}

/// Fast or graceful (spec §4.3 "Termination protocol").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    Graceful,
    Fast,
}

/// What is being torn down: the whole pipeline instance, or one session's
/// worth of per-session state (spec §3 "Termination message").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationScope {
    Instance,
    Session(SessionId),
}

#[derive(Debug, Clone, Copy)]
pub struct Termination {
    pub kind: TerminationKind,
    pub scope: TerminationScope,
}

impl Termination {
    pub fn graceful_instance() -> Self {
        Termination { kind: TerminationKind::Graceful, scope: TerminationScope::Instance }
    }

    pub fn fast_instance() -> Self {
        Termination { kind: TerminationKind::Fast, scope: TerminationScope::Instance }
    }

    pub fn graceful_session(session: SessionId) -> Self {
        Termination { kind: TerminationKind::Graceful, scope: TerminationScope::Session(session) }
    }

    pub fn is_fast(&self) -> bool {
        self.kind == TerminationKind::Fast
    }
}
