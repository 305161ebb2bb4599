//! Output manager: fan-out engine and ODID filter application (spec §4.7).
//!
//! Presented to upstream intermediates as an ordinary stage — it owns one
//! input ring like any other — but internally it is the one place that
//! writes to more than one downstream ring. Each output ring is opened in
//! multi-producer mode (spec §5 "multi-writer mode enabled") since the
//! manager is the ring's sole logical producer but, in the rare case an
//! output is also reachable from elsewhere, the ring machinery doesn't
//! care.

use log::{info, warn};

use crate::error::{Component, Result};
use crate::message::{Envelope, Message};
use crate::odid_range::OdidFilter;
use crate::ring::Producer;

/// One configured output destination: its downstream ring and the filter
/// deciding which messages it receives.
pub struct OutputRoute {
    pub name: String,
    pub filter: OdidFilter,
    pub ring: Producer<Envelope>,
}

/// Fans out messages to every matching output (spec §4.7).
pub struct OutputManager {
    routes: Vec<OutputRoute>,
}

impl OutputManager {
    pub fn new(routes: Vec<OutputRoute>) -> Self {
        OutputManager { routes }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Delivers one message, evaluating every route's filter against the
    /// message's ODID (spec §4.7). Session-control, Terminate, and Garbage
    /// messages carry no ODID and are always delivered to every route
    /// (`k = count(outputs)`); only `Data` messages are filtered.
    ///
    /// Returns the number of routes the message was actually pushed to.
    /// Because each push clones the `Arc<Message>` ([`Envelope`]), pushing
    /// to `k` routes *is* setting the reference count to `k`: if `k == 0`
    /// the local `envelope` binding is the only `Arc`, and it is freed the
    /// instant this function returns, matching spec §9's "free immediately
    /// if k = 0".
    pub fn dispatch(&self, envelope: Envelope) -> Result<usize> {
        let matches: Vec<&OutputRoute> = match envelope.odid() {
            Some(odid) => self.routes.iter().filter(|r| r.filter.matches(odid)).collect(),
            None => self.routes.iter().collect(),
        };

        for route in &matches {
            if let Err(e) = route.ring.send(std::sync::Arc::clone(&envelope)) {
                warn!("[{}] output {} ring closed, dropping message: {}", Component::OutputManager, route.name, e);
            }
        }

        if matches.is_empty() {
            match envelope.as_ref() {
                Message::Data(m) => info!("[{}] message for odid={:?} matched no output, discarded", Component::OutputManager, m.key.odid),
                _ => info!("[{}] message matched no output, discarded", Component::OutputManager),
            }
        }

        Ok(matches.len())
    }
}
