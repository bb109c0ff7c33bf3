//! Connection state machine.
//!
//! One `Connection` represents one transport-level link to one remote
//! peer for one attempt. The state machine is shared by every transport
//! variant:
//!
//! ```text
//! WaitingForAnswer ──connect(initiator)──▶ InitiatingConnection ──▶ Connected ──▶ Closed
//! WaitingForAnswer ──connect(responder)──▶ WaitingForConnection ──▶ Connected ──▶ Closed
//! ```
//!
//! `Closed` is terminal and reached at most once; the `Closed` event is
//! emitted exactly once, after which the owning swarm evicts the table
//! entry (guarded by session id).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lattice_core::{PeerId, SessionId, SignalMessage, SwarmError, Topic};

use crate::transport::{SignalSender, Transport, TransportContext, TransportEvent, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed but not yet told to connect.
    WaitingForAnswer,
    /// We originated and are driving the negotiation.
    InitiatingConnection,
    /// The remote originated; we accepted and wait for its negotiation.
    WaitingForConnection,
    Connected,
    /// Terminal.
    Closed,
}

/// Notifications from a connection to its owning swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        peer: PeerId,
        session: SessionId,
    },
    Closed {
        peer: PeerId,
        session: SessionId,
        /// Whether the connection had reached `Connected` before closing.
        was_connected: bool,
    },
}

pub struct Connection {
    topic: Topic,
    own_id: PeerId,
    remote_id: PeerId,
    session_id: SessionId,
    initiator: bool,
    state: Mutex<ConnectionState>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    data_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    connected_emitted: AtomicBool,
    closed_emitted: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: Topic,
        own_id: PeerId,
        remote_id: PeerId,
        session_id: SessionId,
        initiator: bool,
        factory: &dyn TransportFactory,
        signals: SignalSender,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(TransportContext {
            topic,
            own_id,
            remote_id,
            session_id,
            signals,
            events: transport_tx,
        });

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            topic,
            own_id,
            remote_id,
            session_id,
            initiator,
            state: Mutex::new(ConnectionState::WaitingForAnswer),
            transport,
            events,
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            connected_emitted: AtomicBool::new(false),
            closed_emitted: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::pump_events(Arc::downgrade(&conn), transport_rx));
        *conn.pump.lock().unwrap() = Some(handle);
        conn
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Take the inbound payload stream. Yields frames once per connection.
    pub fn take_data(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.data_rx.lock().unwrap().take()
    }

    /// Leave `WaitingForAnswer` and start the transport.
    pub fn connect(&self) -> Result<(), SwarmError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::WaitingForAnswer => {
                    *state = if self.initiator {
                        ConnectionState::InitiatingConnection
                    } else {
                        ConnectionState::WaitingForConnection
                    };
                }
                ConnectionState::Closed => return Err(SwarmError::ConnectionClosed),
                other => {
                    tracing::warn!(peer = %self.remote_id, state = ?other, "connect called twice");
                    return Ok(());
                }
            }
        }
        tracing::debug!(
            peer = %self.remote_id,
            session = %self.session_id,
            initiator = self.initiator,
            "connecting"
        );
        self.transport.connect(self.initiator)
    }

    /// Feed a mid-negotiation signal into the transport.
    ///
    /// Drops messages from stale sessions, and rejects an inbound offer
    /// while we are the initiator (the remote must not also be offering
    /// for this session).
    pub fn signal(&self, msg: &SignalMessage) {
        if msg.session_id != self.session_id {
            tracing::debug!(
                peer = %self.remote_id,
                got = %msg.session_id,
                want = %self.session_id,
                "signal for stale session, dropping"
            );
            return;
        }

        let state = *self.state.lock().unwrap();
        if state == ConnectionState::Closed {
            tracing::debug!(peer = %self.remote_id, "signal for closed connection, dropping");
            return;
        }

        let is_offer = msg
            .data
            .get("type")
            .and_then(|t| t.as_str())
            .map_or(false, |t| t == "offer");
        if is_offer && state == ConnectionState::InitiatingConnection {
            tracing::warn!(
                peer = %self.remote_id,
                session = %self.session_id,
                "protocol violation: offer signal while initiating, dropping"
            );
            return;
        }

        if let Err(e) = self.transport.signal(msg.data.clone()) {
            tracing::warn!(peer = %self.remote_id, error = %e, "transport rejected signal");
        }
    }

    /// Send a payload frame to the remote peer.
    pub fn send(&self, data: Vec<u8>) -> Result<(), SwarmError> {
        match *self.state.lock().unwrap() {
            ConnectionState::Connected => self.transport.send(data),
            ConnectionState::Closed => Err(SwarmError::ConnectionClosed),
            _ => Err(SwarmError::NotConnected),
        }
    }

    /// Tear the transport down. A second close is a no-op.
    pub fn close(&self) -> Result<(), SwarmError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }
        tracing::debug!(peer = %self.remote_id, session = %self.session_id, "closing connection");
        let result = self.transport.close();
        self.emit_closed();
        result
    }

    fn emit_closed(&self) {
        if self.closed_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ConnectionEvent::Closed {
            peer: self.remote_id,
            session: self.session_id,
            was_connected: self.connected_emitted.load(Ordering::SeqCst),
        });
    }

    fn on_transport_connected(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Connected;
        }
        if !self.connected_emitted.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                own = %self.own_id,
                peer = %self.remote_id,
                session = %self.session_id,
                topic = %self.topic,
                "connected"
            );
            let _ = self.events.send(ConnectionEvent::Connected {
                peer: self.remote_id,
                session: self.session_id,
            });
        }
    }

    async fn pump_events(
        conn: Weak<Connection>,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(conn) = conn.upgrade() else { return };
            match event {
                TransportEvent::Connected => conn.on_transport_connected(),
                TransportEvent::Data(frame) => {
                    let _ = conn.data_tx.send(frame);
                }
                TransportEvent::Error(reason) => {
                    tracing::warn!(peer = %conn.remote_id, %reason, "transport error, closing");
                    if let Err(e) = conn.close() {
                        tracing::warn!(peer = %conn.remote_id, error = %e, "close after transport error failed");
                    }
                }
                TransportEvent::Closed => {
                    if let Err(e) = conn.close() {
                        tracing::warn!(peer = %conn.remote_id, error = %e, "close after remote hangup failed");
                    }
                    return;
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}
