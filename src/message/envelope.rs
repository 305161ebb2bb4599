//! The top-level pipeline envelope and reference-counted fan-out (spec §3,
//! §4.7).
//!
//! Every ring carries `Arc<Message>`. That single choice *is* the fan-out
//! reference-counting scheme the spec describes by hand ("set the message's
//! reference count to k ... the last decrementer frees"): the output
//! manager clones the `Arc` once per matching output instead of maintaining
//! its own counter, and Rust's `Arc` drop glue performs the decrement/free
//! for us, including the zero-destinations case (dropping the only `Arc`
//! frees immediately, matching spec §9's "free immediately if k=0").

use std::sync::Arc;

use crate::message::control::{SessionControl, Termination};
use crate::message::ipfix::ParsedIpfixMessage;
use crate::message::raw::RawMessage;

/// An opaque payload plus a destructor, run when the payload is actually
/// dropped rather than when the Garbage message is merely forwarded (spec
/// §3 "Garbage message"). Used to carry expired `Arc<Snapshot>`s (and
/// similar shared per-session state) through the pipeline so they outlive
/// every data record that might still reference them.
pub struct GarbageMessage {
    payload: Box<dyn std::any::Any + Send>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl GarbageMessage {
    pub fn new<T: Send + 'static>(payload: T) -> Self {
        GarbageMessage { payload: Box::new(payload), on_drop: None }
    }

    /// Attaches a callback run exactly once, when this garbage is finally
    /// dropped (i.e. the last `Arc<Message>` wrapping it goes away).
    pub fn with_destructor<T: Send + 'static>(payload: T, on_drop: impl FnOnce() + Send + 'static) -> Self {
        GarbageMessage { payload: Box::new(payload), on_drop: Some(Box::new(on_drop)) }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for GarbageMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageMessage").finish_non_exhaustive()
    }
}

impl Drop for GarbageMessage {
    fn drop(&mut self) {
        if let Some(cb) = self.on_drop.take() {
            cb();
        }
    }
}

/// The single envelope type carried by every ring and feedback pipe in the
/// pipeline (spec §2 "message pointers").
#[derive(Debug)]
pub enum Message {
    /// Unparsed exporter bytes, as handed from an input stage to the
    /// parser (spec §3 "Raw message"). Every other variant already carries
    /// its own structured payload; this is the one hop where the envelope
    /// carries bytes instead.
    Raw(RawMessage),
    Data(ParsedIpfixMessage),
    Control(SessionControl),
    Terminate(Termination),
    Garbage(GarbageMessage),
}

impl Message {
    pub fn as_raw(&self) -> Option<&RawMessage> {
        match self {
            Message::Raw(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&ParsedIpfixMessage> {
        match self {
            Message::Data(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_terminate(&self) -> Option<&Termination> {
        match self {
            Message::Terminate(t) => Some(t),
            _ => None,
        }
    }

    pub fn odid(&self) -> Option<u32> {
        match self {
            Message::Data(m) => Some(m.key.odid),
            _ => None,
        }
    }
}

/// Fan-out unit actually pushed onto rings. Cloning an `Envelope` clones the
/// `Arc`, not the message; `k` clones is the message's reference count.
pub type Envelope = Arc<Message>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn garbage_destructor_runs_on_last_drop_only() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_clone = Arc::clone(&freed);
        let garbage = GarbageMessage::with_destructor((), move || {
            freed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let envelope: Envelope = Arc::new(Message::Garbage(garbage));

        let fanned_out = vec![Arc::clone(&envelope), Arc::clone(&envelope), Arc::clone(&envelope)];
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        drop(envelope);
        for e in fanned_out {
            drop(e);
        }
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_destinations_frees_immediately() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_clone = Arc::clone(&freed);
        let garbage = GarbageMessage::with_destructor((), move || {
            freed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let envelope: Envelope = Arc::new(Message::Garbage(garbage));
        // no clones pushed anywhere: the only Arc is this local binding
        drop(envelope);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
