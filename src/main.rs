//! Demonstration binary: wires the built-in stages together into one fixed
//! topology the way `cdeconinck-ipfix`'s original `main.rs` wired
//! `listener` -> `exporter`. This is illustrative, not the external
//! configurator of spec §6 — the topology (UDP input -> IPFIX parser ->
//! output manager -> a logging output) is hard-coded rather than read from
//! an XML instance list.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use structopt::StructOpt;

use ipfix_collector::config::Settings;
use ipfix_collector::error::{Component, Result};
use ipfix_collector::message::{Envelope, Message, RawMessage, SessionControl, MAX_MESSAGE_SIZE};
use ipfix_collector::netflow;
use ipfix_collector::odid_range::{FilterType, OdidFilter, OdidRange};
use ipfix_collector::output_manager::{OutputManager, OutputRoute};
use ipfix_collector::parser::{MessageHeader, Parser as IpfixParser};
use ipfix_collector::ring;
use ipfix_collector::session::{SessionId, SessionKey, SessionType, TransportSession};
use ipfix_collector::stage::{InputEvent, InputPlugin, InputStage, IntermediatePlugin, IntermediateStage, OutputPlugin, OutputStage};

#[derive(Debug, StructOpt)]
struct Opts {
    /// Log level to use
    #[structopt(long = "log", default_value = "info")]
    log_level: String,

    /// IP:port to listen for UDP exporter traffic on
    #[structopt(short = "l", long = "listener", default_value = "0.0.0.0:9999")]
    listener: SocketAddr,

    /// Optional config file (ring sizing, template lifetimes, output filters)
    #[structopt(short = "c", long = "config")]
    config: Option<PathBuf>,
}

/// Parses a configured output's ODID filter expression (`"none"`,
/// `"only:<range>"`, `"except:<range>"`, spec §4.7).
fn parse_output_filter(expr: &str) -> std::result::Result<OdidFilter, String> {
    match expr.split_once(':') {
        Some(("only", range)) => OdidRange::parse(range).map(OdidFilter::only).map_err(|e| e.to_string()),
        Some(("except", range)) => OdidRange::parse(range).map(OdidFilter::except).map_err(|e| e.to_string()),
        _ if expr == "none" => Ok(OdidFilter::none()),
        _ => Err(format!("unrecognized output filter expression: {:?}", expr)),
    }
}

/// Polls one UDP socket, tracking one Transport Session per peer address
/// (spec §3). A single socket read sometimes yields two logical events (a
/// new session's `Open` followed by its first message); the second is
/// buffered in `pending` until the next [`InputPlugin::get`] call.
struct UdpInputPlugin {
    socket: UdpSocket,
    local_addr: SocketAddr,
    sessions: HashMap<SocketAddr, SessionId>,
    pending: VecDeque<InputEvent>,
    buf: Vec<u8>,
}

/// How often [`UdpInputPlugin::get`] gives up waiting and returns
/// [`InputEvent::Idle`], so the owning [`InputStage`] gets a chance to drain
/// its feedback pipe between reads (spec §5 "feedback.read ... typically
/// polled concurrently with transport").
const FEEDBACK_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

impl UdpInputPlugin {
    fn new(socket: UdpSocket) -> Self {
        let local_addr = socket.local_addr().expect("bound udp socket has a local address");
        socket.set_read_timeout(Some(FEEDBACK_POLL_INTERVAL)).expect("setting a udp read timeout should always succeed");
        UdpInputPlugin { socket, local_addr, sessions: HashMap::new(), pending: VecDeque::new(), buf: vec![0u8; MAX_MESSAGE_SIZE] }
    }
}

impl InputPlugin for UdpInputPlugin {
    fn get(&mut self) -> Option<InputEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        match self.socket.recv_from(&mut self.buf) {
            Ok((n, peer)) => {
                let is_new = !self.sessions.contains_key(&peer);
                let session_id = *self.sessions.entry(peer).or_insert_with(SessionId::new);
                let key = SessionKey::new(session_id, 0, 0);
                let raw = RawMessage::new(key, self.buf[..n].to_vec());

                if is_new {
                    let transport = TransportSession {
                        id: session_id,
                        session_type: SessionType::Udp,
                        source: peer,
                        destination: self.local_addr,
                        template_lifetime: ipfix_collector::session::DEFAULT_UDP_TEMPLATE_LIFETIME,
                        options_template_lifetime: ipfix_collector::session::DEFAULT_UDP_OPTIONS_TEMPLATE_LIFETIME,
                        label: format!("udp:{}->{}", peer, self.local_addr),
                    };
                    self.pending.push_back(InputEvent::Message(raw));
                    return Some(InputEvent::Control(SessionControl::Open(transport)));
                }

                Some(InputEvent::Message(raw))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Some(InputEvent::Idle),
            Err(e) => {
                warn!("[{}] udp recv failed, ending input stage: {}", Component::Listener, e);
                None
            }
        }
    }

    fn session_close(&mut self, session: SessionId) {
        self.sessions.retain(|_, v| *v != session);
    }
}

/// Drives the IPFIX parser as an intermediate stage (spec §4.4). The ODID a
/// message belongs to is only known once its header is read, so this plugin
/// reads the header itself to build the full `SessionKey` the parser keys
/// its per-(Session, ODID) state on; `Parser::parse` reads the header a
/// second time internally to decode the rest of the message.
///
/// Before that, the stage peeks the message's version word (spec §2 item 4):
/// a NetFlow v5 or v9 stream is first run through a per-session
/// `netflow::v5`/`netflow::v9` `Converter` to synthesize IPFIX bytes, which
/// are then fed into the same `Parser::parse` path as native IPFIX traffic.
struct ParserPlugin {
    parser: IpfixParser,
    template_lifetime_secs: u32,
    options_template_lifetime_secs: u32,
    v5_refresh_secs: u32,
    v5_converters: HashMap<SessionKey, netflow::v5::Converter>,
    v9_converters: HashMap<SessionKey, netflow::v9::Converter>,
}

impl ParserPlugin {
    fn finish_parse(&mut self, key: SessionKey, bytes: &[u8]) -> Result<Vec<Envelope>> {
        let outcome = self.parser.parse(key, SessionType::Udp, self.template_lifetime_secs, self.options_template_lifetime_secs, bytes)?;

        let mut out = Vec::new();
        if let Some(parsed) = outcome.message {
            out.push(Arc::new(Message::Data(parsed)));
        }
        out.extend(outcome.garbage.into_iter().map(|g| Arc::new(Message::Garbage(g))));
        Ok(out)
    }
}

impl IntermediatePlugin for ParserPlugin {
    fn process(&mut self, message: Envelope) -> Result<Vec<Envelope>> {
        match message.as_ref() {
            Message::Raw(raw) => {
                if raw.bytes.len() < 2 {
                    return Err(ipfix_collector::error::Error::Format("message shorter than the version field".to_string()));
                }
                let version = u16::from_be_bytes([raw.bytes[0], raw.bytes[1]]);

                match version {
                    netflow::v5::VERSION => {
                        let key = SessionKey::new(raw.key.session, raw.key.odid, raw.key.stream);
                        if self.parser.is_blocked(key) {
                            return Ok(Vec::new());
                        }
                        let converter = self.v5_converters.entry(key).or_insert_with(|| netflow::v5::Converter::new(self.v5_refresh_secs));
                        match converter.convert(&raw.bytes, key.odid) {
                            Ok(converted) => self.finish_parse(key, &converted),
                            Err(e) => {
                                warn!("[{}] failed to convert netflow v5 message: {}", Component::NetflowV5, e);
                                Ok(Vec::new())
                            }
                        }
                    }
                    netflow::v9::VERSION => {
                        let key = SessionKey::new(raw.key.session, raw.key.odid, raw.key.stream);
                        if self.parser.is_blocked(key) {
                            return Ok(Vec::new());
                        }
                        let converter = self.v9_converters.entry(key).or_insert_with(netflow::v9::Converter::new);
                        match converter.convert(&raw.bytes, key.odid) {
                            Ok(converted) => self.finish_parse(key, &converted),
                            Err(e) => {
                                warn!("[{}] failed to convert netflow v9 message: {}", Component::NetflowV9, e);
                                Ok(Vec::new())
                            }
                        }
                    }
                    _ => {
                        let header = MessageHeader::read(&raw.bytes)?;
                        let key = SessionKey::new(raw.key.session, header.odid, raw.key.stream);

                        if self.parser.is_blocked(key) {
                            return Ok(Vec::new());
                        }

                        self.finish_parse(key, &raw.bytes)
                    }
                }
            }
            Message::Control(control) => {
                let mut out = Vec::new();
                if let SessionControl::Close(session) = control {
                    // Demo simplification: a real configurator would track
                    // every ODID a session has touched and drop each one;
                    // here only the default ODID 0 is dropped.
                    let garbage = self.parser.drop_session(SessionKey::new(*session, 0, 0));
                    out.extend(garbage.into_iter().map(|g| Arc::new(Message::Garbage(g))));
                }
                out.push(Arc::new(Message::Control(control.clone())));
                Ok(out)
            }
            _ => Ok(vec![Arc::clone(&message)]),
        }
    }
}

/// Adapts [`OutputManager`]'s `dispatch` to the `OutputPlugin` contract.
struct OutputManagerPlugin {
    manager: OutputManager,
}

impl OutputPlugin for OutputManagerPlugin {
    fn process(&mut self, message: Envelope) -> Result<()> {
        self.manager.dispatch(message).map(|_| ())
    }
}

/// The simplest possible output: logs each Data message's record count.
struct LoggingOutputPlugin;

impl OutputPlugin for LoggingOutputPlugin {
    fn process(&mut self, message: Envelope) -> Result<()> {
        if let Message::Data(parsed) = message.as_ref() {
            info!(
                "[{}] session={} odid={} seq={} records={}",
                Component::OutputManager,
                parsed.key.session,
                parsed.key.odid,
                parsed.sequence_number,
                parsed.record_count()
            );
        }
        Ok(())
    }
}

fn main() {
    let opts = Opts::from_args();
    ipfix_collector::logging::init(&opts.log_level);
    info!("starting ipfix collector");

    let settings = match Settings::load(opts.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to load config ({}), using built-in defaults", e);
            Settings::default()
        }
    };

    let (to_parser, from_input) = ring::new::<Envelope>(settings.ring.capacity, 1);
    let (to_output_manager, from_parser) = ring::new::<Envelope>(settings.ring.capacity, 1);
    let (to_logging, from_output_manager) = ring::new::<Envelope>(settings.ring.capacity, 1);

    let routes = if settings.outputs.is_empty() {
        vec![OutputRoute { name: "logging".to_string(), filter: OdidFilter::none(), ring: to_logging }]
    } else {
        settings
            .outputs
            .iter()
            .map(|o| {
                let filter = parse_output_filter(&o.odid_filter).unwrap_or_else(|e| {
                    warn!("output {:?} has an invalid odid_filter ({}), defaulting to none", o.name, e);
                    OdidFilter { filter_type: FilterType::None, range: Default::default() }
                });
                OutputRoute { name: o.name.clone(), filter, ring: to_logging.clone() }
            })
            .collect()
    };

    let socket = UdpSocket::bind(opts.listener).unwrap_or_else(|e| panic!("failed to bind udp listener on {}: {}", opts.listener, e));
    info!("listening for udp exporter traffic on {}", opts.listener);

    // Stands in for the external configurator's role in spec §4.3: "the
    // configurator sends one graceful terminate to each input's feedback
    // pipe". A real XML-driven configurator would also relay per-session
    // close requests here; this demo only exercises the instance-wide path.
    let (feedback_tx, feedback_rx) = ipfix_collector::feedback::new();
    ctrlc::set_handler(move || {
        info!("received interrupt, requesting graceful shutdown");
        feedback_tx.send(ipfix_collector::message::Termination::graceful_instance());
    })
    .expect("failed to install the interrupt handler");

    let input_stage = InputStage::new("input-udp", UdpInputPlugin::new(socket), vec![to_parser]).with_feedback(feedback_rx);
    let parser_stage = IntermediateStage::new(
        "parser",
        ParserPlugin {
            parser: IpfixParser::new(),
            template_lifetime_secs: settings.template.udp_template_lifetime_secs,
            options_template_lifetime_secs: settings.template.udp_options_template_lifetime_secs,
            v5_refresh_secs: settings.netflow.v5_template_refresh_secs,
            v5_converters: HashMap::new(),
            v9_converters: HashMap::new(),
        },
        from_input,
        vec![to_output_manager],
        1,
    );
    let output_manager_stage = OutputStage::new("output-manager", OutputManagerPlugin { manager: OutputManager::new(routes) }, from_parser, 1);
    let logging_stage = OutputStage::new("output-logging", LoggingOutputPlugin, from_output_manager, 1);

    let handles = vec![input_stage.spawn(), parser_stage.spawn(), output_manager_stage.spawn(), logging_stage.spawn()];

    for handle in handles {
        let _ = handle.join();
    }

    info!("ipfix collector shut down");
}
