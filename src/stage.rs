//! Stage runtime: the generic host loop that drives any plugin, plus the
//! termination-reference-counting protocol (spec §4.3) and the `Plugin`
//! capability traits external collaborators implement (spec §6).
//!
//! The collapsed-hierarchy redesign from spec §9 applies here: instead of
//! one bespoke host per concrete plugin (as `cdeconinck-ipfix`'s
//! `threads::listener`/`threads::exporter` were), one generic run loop per
//! stage *kind* drives any plugin satisfying that kind's capability trait.
//! Threads are named `std::thread::Builder` threads, matching the "parallel
//! OS threads, one per stage" model of spec §5 and the teacher's own
//! thread-per-stage `main.rs`.

use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::error::{Component, Result};
use crate::feedback::FeedbackRx;
use crate::message::{Envelope, Message, RawMessage, SessionControl, Termination, TerminationScope};
use crate::ring::{Consumer, Producer};
use crate::session::SessionId;

/// One event an [`InputPlugin`] yields from its transport (spec §6:
/// `get(private) -> raw_msg`, generalized to also carry Session-control
/// events since in practice an input stage is what *detects* session
/// open/close). `Idle` lets a plugin built on a transport with a read
/// timeout (the only way a blocking `recv` can be interleaved with polling
/// the feedback pipe on a plain OS thread, spec §5 "typically polled
/// concurrently with transport") hand control back without claiming
/// end-of-data.
pub enum InputEvent {
    Message(RawMessage),
    Control(SessionControl),
    Idle,
}

/// The external collaborator driving an input stage (spec §6).
pub trait InputPlugin: Send {
    /// Blocks (up to the plugin's own timeout, if any) until the next event
    /// is available, returns [`InputEvent::Idle`] if the wait timed out with
    /// nothing ready, or returns `None` at a clean end of data (the
    /// plugin's transport closed on its own, with no error).
    fn get(&mut self) -> Option<InputEvent>;

    /// Run once for every Transport Session this plugin's transport closes,
    /// so it can release any per-session transport state (spec §6).
    fn session_close(&mut self, _session: SessionId) {}
}

/// The external collaborator driving an intermediate stage (spec §6:
/// `process(private, msg) -> status`). Returns the messages to forward
/// downstream; an empty `Vec` consumes the input without producing output
/// (e.g. the parser swallowing a UDP message it judged `TooOld`).
pub trait IntermediatePlugin: Send {
    fn process(&mut self, message: Envelope) -> Result<Vec<Envelope>>;
}

/// The external collaborator driving an output stage (spec §6). Terminal:
/// nothing is forwarded further.
pub trait OutputPlugin: Send {
    fn process(&mut self, message: Envelope) -> Result<()>;
}

/// Forwards one envelope to every output ring of a stage, logging (not
/// failing) on a closed downstream ring — matching `output_manager`'s
/// dispatch behavior for the common "one output" case of input/intermediate
/// stages.
fn forward_all(outputs: &[Producer<Envelope>], envelope: Envelope, component: Component) {
    for out in outputs {
        if let Err(e) = out.send(Arc::clone(&envelope)) {
            warn!("[{}] downstream ring closed, dropping message: {}", component, e);
        }
    }
}

/// Hosts an [`InputPlugin`]: polls it for raw messages and session-control
/// events, wraps each in the pipeline's [`Message`] envelope, and forwards
/// to every configured downstream ring. Ends its own run loop at clean
/// end-of-data by forwarding one graceful [`Termination`] (spec §4.3), or
/// when instructed to by the configurator over its [`FeedbackRx`] (spec §2
/// "Feedback pipe ... used to deliver termination requests and per-session
/// close requests back to input stages").
pub struct InputStage<P: InputPlugin> {
    name: String,
    plugin: P,
    outputs: Vec<Producer<Envelope>>,
    feedback: Option<FeedbackRx<Termination>>,
}

impl<P: InputPlugin> InputStage<P> {
    pub fn new(name: impl Into<String>, plugin: P, outputs: Vec<Producer<Envelope>>) -> Self {
        InputStage { name: name.into(), plugin, outputs, feedback: None }
    }

    /// Gives this stage a feedback pipe to poll between transport reads.
    /// Only an input stage whose [`InputPlugin`] implements
    /// [`InputPlugin::session_close`] needs one in practice (spec §4.2 "an
    /// input stage that does not implement session-close handling is never
    /// given the handle by its upstream parser"); wiring it is left to the
    /// caller.
    pub fn with_feedback(mut self, feedback: FeedbackRx<Termination>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new().name(self.name.clone()).spawn(move || self.run()).expect("failed to spawn input stage thread")
    }

    /// Drains every pending feedback request. Returns `Some(kind)` if an
    /// instance-scoped termination was requested and the run loop should
    /// exit after forwarding it; session-scoped requests are applied
    /// immediately (the plugin releases that session's transport state) and
    /// do not end the loop.
    fn drain_feedback(&mut self) -> Option<Termination> {
        let Some(feedback) = &self.feedback else { return None };
        for request in feedback.drain() {
            match request.scope {
                TerminationScope::Instance => return Some(request),
                TerminationScope::Session(session) => {
                    info!("[{}] {} releasing session {} on feedback request", Component::Listener, self.name, session);
                    self.plugin.session_close(session);
                }
            }
        }
        None
    }

    fn run(mut self) {
        loop {
            if let Some(term) = self.drain_feedback() {
                info!("[{}] {} terminating on feedback request ({:?})", Component::Listener, self.name, term.kind);
                forward_all(&self.outputs, Arc::new(Message::Terminate(term)), Component::Listener);
                break;
            }

            match self.plugin.get() {
                Some(InputEvent::Message(raw)) => {
                    forward_all(&self.outputs, Arc::new(Message::Raw(raw)), Component::Listener);
                }
                Some(InputEvent::Control(control)) => {
                    if let SessionControl::Close(session) = control {
                        self.plugin.session_close(session);
                    }
                    forward_all(&self.outputs, Arc::new(Message::Control(control)), Component::Listener);
                }
                Some(InputEvent::Idle) => continue,
                None => {
                    info!("[{}] {} reached end of data, sending graceful termination", Component::Listener, self.name);
                    forward_all(&self.outputs, Arc::new(Message::Terminate(Termination::graceful_instance())), Component::Listener);
                    break;
                }
            }
        }
    }
}

/// Counts down the number of upstream producers whose graceful
/// [`Termination`] have been observed, matching `instance_intermediate.cpp`'s
/// `term_cnt` (spec §4.3). A fast termination skips the count entirely:
/// once observed it is forwarded and the stage exits immediately,
/// discarding whatever else is still queued ("fast termination discards
/// untouched input", spec §5).
struct TerminationTracker {
    remaining: usize,
}

impl TerminationTracker {
    fn new(producer_count: usize) -> Self {
        TerminationTracker { remaining: producer_count.max(1) }
    }

    /// Returns `true` if this termination should be forwarded and the
    /// stage should exit now.
    fn observe(&mut self, term: &Termination) -> bool {
        if term.is_fast() {
            return true;
        }
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

/// Hosts an [`IntermediatePlugin`] (e.g. the IPFIX parser, or a modifier):
/// pulls from one input ring, runs the plugin, forwards whatever it
/// returns to every output ring (spec §4.3).
pub struct IntermediateStage<P: IntermediatePlugin> {
    name: String,
    plugin: P,
    input: Consumer<Envelope>,
    outputs: Vec<Producer<Envelope>>,
    terminations: TerminationTracker,
}

impl<P: IntermediatePlugin> IntermediateStage<P> {
    pub fn new(name: impl Into<String>, plugin: P, input: Consumer<Envelope>, outputs: Vec<Producer<Envelope>>, upstream_producers: usize) -> Self {
        IntermediateStage { name: name.into(), plugin, input, outputs, terminations: TerminationTracker::new(upstream_producers) }
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new().name(self.name.clone()).spawn(move || self.run()).expect("failed to spawn intermediate stage thread")
    }

    fn run(mut self) {
        loop {
            let envelope = match self.input.recv() {
                Ok(e) => e,
                Err(_) => break,
            };

            match envelope.as_ref() {
                Message::Terminate(term) => {
                    if self.terminations.observe(term) {
                        forward_all(&self.outputs, Arc::clone(&envelope), Component::Stage);
                        break;
                    }
                }
                _ => match self.plugin.process(Arc::clone(&envelope)) {
                    Ok(produced) => {
                        for out_envelope in produced {
                            forward_all(&self.outputs, out_envelope, Component::Stage);
                        }
                    }
                    Err(e) => warn!("[{}] {} plugin returned an error, message dropped: {}", Component::Stage, self.name, e),
                },
            }
        }
    }
}

/// Hosts an [`OutputPlugin`]: pulls from one input ring and runs the plugin
/// on every message, with no further forwarding (spec §4.3).
pub struct OutputStage<P: OutputPlugin> {
    name: String,
    plugin: P,
    input: Consumer<Envelope>,
    terminations: TerminationTracker,
}

impl<P: OutputPlugin> OutputStage<P> {
    pub fn new(name: impl Into<String>, plugin: P, input: Consumer<Envelope>, upstream_producers: usize) -> Self {
        OutputStage { name: name.into(), plugin, input, terminations: TerminationTracker::new(upstream_producers) }
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new().name(self.name.clone()).spawn(move || self.run()).expect("failed to spawn output stage thread")
    }

    fn run(mut self) {
        loop {
            let envelope = match self.input.recv() {
                Ok(e) => e,
                Err(_) => break,
            };

            match envelope.as_ref() {
                Message::Terminate(term) => {
                    if self.terminations.observe(term) {
                        break;
                    }
                }
                _ => {
                    if let Err(e) = self.plugin.process(Arc::clone(&envelope)) {
                        warn!("[{}] {} plugin returned an error, message dropped: {}", Component::Stage, self.name, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ParsedIpfixMessage;
    use crate::ring;
    use crate::session::SessionKey;
    use parking_lot::Mutex;

    struct QueueInput {
        events: std::vec::IntoIter<InputEvent>,
    }

    impl QueueInput {
        fn new(events: Vec<InputEvent>) -> Self {
            QueueInput { events: events.into_iter() }
        }
    }

    impl InputPlugin for QueueInput {
        fn get(&mut self) -> Option<InputEvent> {
            self.events.next()
        }
    }

    struct CollectingOutput {
        sink: Arc<Mutex<Vec<Envelope>>>,
    }

    impl OutputPlugin for CollectingOutput {
        fn process(&mut self, message: Envelope) -> Result<()> {
            self.sink.lock().push(message);
            Ok(())
        }
    }

    struct CountingOutput {
        count: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl OutputPlugin for CountingOutput {
        fn process(&mut self, _message: Envelope) -> Result<()> {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct PassThroughIntermediate;
    impl IntermediatePlugin for PassThroughIntermediate {
        fn process(&mut self, message: Envelope) -> Result<Vec<Envelope>> {
            Ok(vec![message])
        }
    }

    fn data_envelope(odid: u32) -> Envelope {
        let key = SessionKey::new(crate::session::SessionId::new(), odid, 0);
        Arc::new(Message::Data(ParsedIpfixMessage::new(key, 0, 0, Vec::new())))
    }

    struct IdleThenSignaled {
        get_calls: Arc<std::sync::atomic::AtomicUsize>,
        closed_sessions: Arc<Mutex<Vec<SessionId>>>,
    }

    impl InputPlugin for IdleThenSignaled {
        fn get(&mut self) -> Option<InputEvent> {
            self.get_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(InputEvent::Idle)
        }

        fn session_close(&mut self, session: SessionId) {
            self.closed_sessions.lock().push(session);
        }
    }

    #[test]
    fn feedback_session_close_request_reaches_the_plugin_without_ending_the_stage() {
        let (out_tx, out_rx) = ring::new::<Envelope>(128, 1);
        let (fb_tx, fb_rx) = crate::feedback::new::<Termination>();
        let closed = Arc::new(Mutex::new(Vec::new()));
        let session = crate::session::SessionId::new();

        fb_tx.send(Termination::graceful_session(session));

        let plugin = IdleThenSignaled { get_calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)), closed_sessions: Arc::clone(&closed) };
        let stage = InputStage::new("test-input", plugin, vec![out_tx]).with_feedback(fb_rx);
        let handle = stage.spawn();

        // Give the plugin's Idle loop a moment to observe the session-close
        // request, then end the stage with a second feedback message (this
        // plugin never reaches end-of-data on its own).
        std::thread::sleep(std::time::Duration::from_millis(20));
        fb_tx.send(Termination::fast_instance());
        handle.join().unwrap();

        assert_eq!(closed.lock().as_slice(), &[session]);
        let term = out_rx.recv().unwrap();
        assert!(matches!(term.as_terminate(), Some(t) if t.is_fast()));
    }

    #[test]
    fn feedback_instance_termination_ends_the_stage_before_any_transport_read() {
        let (out_tx, out_rx) = ring::new::<Envelope>(128, 1);
        let (fb_tx, fb_rx) = crate::feedback::new::<Termination>();
        fb_tx.send(Termination::graceful_instance());

        let get_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let plugin = IdleThenSignaled { get_calls: Arc::clone(&get_calls), closed_sessions: Arc::new(Mutex::new(Vec::new())) };
        let stage = InputStage::new("test-input", plugin, vec![out_tx]).with_feedback(fb_rx);
        stage.spawn().join().unwrap();

        assert_eq!(get_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        let term = out_rx.recv().unwrap();
        assert!(matches!(term.as_terminate(), Some(t) if !t.is_fast()));
    }

    #[test]
    fn input_stage_forwards_messages_then_a_graceful_termination_at_end_of_data() {
        let (out_tx, out_rx) = ring::new::<Envelope>(128, 1);
        let raw = RawMessage::new(SessionKey::new(crate::session::SessionId::new(), 1, 0), vec![1, 2, 3]);
        let plugin = QueueInput::new(vec![InputEvent::Message(raw)]);
        let stage = InputStage::new("test-input", plugin, vec![out_tx]);
        stage.spawn().join().unwrap();

        let first = out_rx.recv().unwrap();
        assert!(first.as_raw().is_some());
        let second = out_rx.recv().unwrap();
        assert!(second.as_terminate().is_some());
    }

    #[test]
    fn intermediate_stage_waits_for_every_upstream_termination() {
        let (in_tx, in_rx) = ring::new::<Envelope>(128, 2);
        let (out_tx, out_rx) = ring::new::<Envelope>(128, 1);
        let stage = IntermediateStage::new("test-intermediate", PassThroughIntermediate, in_rx, vec![out_tx], 2);
        let handle = stage.spawn();

        in_tx.send(data_envelope(1)).unwrap();
        in_tx.send(Arc::new(Message::Terminate(Termination::graceful_instance()))).unwrap();
        assert!(out_rx.recv().unwrap().as_data().is_some());

        // Only one of two upstream producers has terminated; the stage must
        // still be running, so the termination has not reached the output.
        assert!(out_rx.try_recv().is_err());

        in_tx.send(Arc::new(Message::Terminate(Termination::graceful_instance()))).unwrap();
        assert!(out_rx.recv().unwrap().as_terminate().is_some());
        handle.join().unwrap();
    }

    #[test]
    fn fast_termination_bypasses_the_refcount() {
        let (in_tx, in_rx) = ring::new::<Envelope>(128, 5);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stage = OutputStage::new("test-output", CountingOutput { count: Arc::clone(&count) }, in_rx, 5);
        let handle = stage.spawn();

        in_tx.send(data_envelope(1)).unwrap();
        in_tx.send(Arc::new(Message::Terminate(Termination::fast_instance()))).unwrap();
        handle.join().unwrap();

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn output_stage_collects_every_data_message() {
        let (in_tx, in_rx) = ring::new::<Envelope>(128, 1);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let stage = OutputStage::new("test-output", CollectingOutput { sink: Arc::clone(&sink) }, in_rx, 1);
        let handle = stage.spawn();

        in_tx.send(data_envelope(1)).unwrap();
        in_tx.send(data_envelope(2)).unwrap();
        in_tx.send(Arc::new(Message::Terminate(Termination::graceful_instance()))).unwrap();
        handle.join().unwrap();

        assert_eq!(sink.lock().len(), 2);
    }
}
