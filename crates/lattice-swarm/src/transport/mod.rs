//! Transport boundary for connection variants.
//!
//! The swarm core never talks to a connection library directly; a
//! [`Transport`] is created per connection attempt and reports back over a
//! plain event channel. Two implementations ship with the crate: a
//! memory-signaled transport that negotiates through the swarm's signaling
//! path, and a loopback transport that pairs two in-process peers without
//! any signaling round trip.

use std::sync::Arc;

use tokio::sync::mpsc;

use lattice_core::{PeerId, SessionId, SwarmError, Topic};

pub mod loopback;
pub mod memory;

/// Events a transport reports to its owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link to the remote peer is up.
    Connected,
    /// A payload frame from the remote peer.
    Data(Vec<u8>),
    /// A transport-level failure. The connection treats this as a path to
    /// closed, never as something to throw.
    Error(String),
    /// The link went away (remote hangup or local close).
    Closed,
}

/// Outbound negotiation path back into the swarm's signaling collaborator.
///
/// Sending is fire-and-forget from the transport's point of view; delivery
/// failures are reported on the swarm's error sink.
#[derive(Clone)]
pub struct SignalSender {
    send: Arc<dyn Fn(serde_json::Value) + Send + Sync>,
}

impl SignalSender {
    pub fn new(send: impl Fn(serde_json::Value) + Send + Sync + 'static) -> Self {
        Self {
            send: Arc::new(send),
        }
    }

    /// A sender that drops everything. Used by transports that never
    /// signal, and by tests.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn send(&self, payload: serde_json::Value) {
        (self.send)(payload);
    }
}

/// Everything a factory needs to build a transport for one attempt.
#[derive(Clone)]
pub struct TransportContext {
    pub topic: Topic,
    pub own_id: PeerId,
    pub remote_id: PeerId,
    pub session_id: SessionId,
    /// Outbound negotiation payloads (routed to the remote peer's
    /// connection for the same session).
    pub signals: SignalSender,
    /// Where the transport reports its events.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// One transport-level link to exactly one remote peer for one attempt.
///
/// All methods are non-blocking; progress is reported through the event
/// channel handed over in [`TransportContext`].
pub trait Transport: Send + Sync {
    /// Start connecting. `initiator` tells the transport which side of the
    /// negotiation it drives.
    fn connect(&self, initiator: bool) -> Result<(), SwarmError>;

    /// Feed inbound negotiation data from the remote side.
    fn signal(&self, payload: serde_json::Value) -> Result<(), SwarmError>;

    /// Send a payload frame. Only valid once connected.
    fn send(&self, data: Vec<u8>) -> Result<(), SwarmError>;

    /// Release the link. Idempotent.
    fn close(&self) -> Result<(), SwarmError>;
}

/// Builds one transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self, ctx: TransportContext) -> Arc<dyn Transport>;
}
