//! Memory-signaled transport.
//!
//! Stands in for a remote transport library (WebRTC and friends): the
//! negotiation handshake travels through the swarm's signaling path as
//! tagged JSON payloads, and data frames cross an in-process hub once the
//! handshake completes. Exercises the same signal routing, session
//! validation, and ordering paths a real remote transport would.
//!
//! Handshake, initiator on the left:
//!
//! ```text
//! offer ──▶            (responder replies)
//!        ◀── answer
//! ready ──▶            both sides report Connected
//! ```

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use lattice_core::{PeerId, SessionId, SwarmError};

use super::{Transport, TransportContext, TransportEvent, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Offer,
    Answer,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Constructed; responder side also waits here for the offer.
    Idle,
    /// Initiator sent the offer, waiting for the answer.
    OfferSent,
    /// Responder answered, waiting for the ready ack.
    AnswerSent,
    Established,
    Closed,
}

/// Pairs the two halves of established links, keyed by session and the
/// receiving peer. Injected so parallel tests stay isolated.
#[derive(Default)]
pub struct MemoryHub {
    links: DashMap<(SessionId, PeerId), mpsc::UnboundedSender<TransportEvent>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(
        &self,
        session: SessionId,
        peer: PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        self.links.insert((session, peer), events);
    }

    fn detach(&self, session: SessionId, peer: PeerId) {
        self.links.remove(&(session, peer));
    }

    fn deliver(&self, session: SessionId, peer: PeerId, event: TransportEvent) -> bool {
        match self.links.get(&(session, peer)) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

pub struct MemoryTransportFactory {
    hub: Arc<MemoryHub>,
}

impl MemoryTransportFactory {
    pub fn new(hub: Arc<MemoryHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, ctx: TransportContext) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            ctx,
            hub: self.hub.clone(),
            phase: Mutex::new(Phase::Idle),
        })
    }
}

pub struct MemoryTransport {
    ctx: TransportContext,
    hub: Arc<MemoryHub>,
    phase: Mutex<Phase>,
}

impl MemoryTransport {
    fn send_handshake(&self, msg: Handshake) {
        // Serialization of a unit enum variant cannot fail.
        let payload = serde_json::to_value(msg).unwrap_or(serde_json::Value::Null);
        self.ctx.signals.send(payload);
    }

    fn establish(&self, phase: &mut Phase) {
        *phase = Phase::Established;
        self.hub
            .attach(self.ctx.session_id, self.ctx.own_id, self.ctx.events.clone());
        let _ = self.ctx.events.send(TransportEvent::Connected);
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, initiator: bool) -> Result<(), SwarmError> {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            Phase::Idle => {
                if initiator {
                    *phase = Phase::OfferSent;
                    drop(phase);
                    self.send_handshake(Handshake::Offer);
                }
                // The responder stays idle until the offer payload arrives.
                Ok(())
            }
            Phase::Closed => Err(SwarmError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    fn signal(&self, payload: serde_json::Value) -> Result<(), SwarmError> {
        let msg: Handshake = serde_json::from_value(payload)
            .map_err(|e| SwarmError::Transport(format!("malformed handshake payload: {e}")))?;

        let mut phase = self.phase.lock().unwrap();
        match (*phase, msg) {
            (Phase::Idle, Handshake::Offer) => {
                *phase = Phase::AnswerSent;
                drop(phase);
                self.send_handshake(Handshake::Answer);
                Ok(())
            }
            (Phase::OfferSent, Handshake::Answer) => {
                self.establish(&mut phase);
                drop(phase);
                self.send_handshake(Handshake::Ready);
                Ok(())
            }
            (Phase::AnswerSent, Handshake::Ready) => {
                self.establish(&mut phase);
                Ok(())
            }
            (Phase::Closed, _) => Err(SwarmError::ConnectionClosed),
            (phase, msg) => {
                tracing::debug!(?phase, ?msg, "handshake message out of order, dropping");
                Ok(())
            }
        }
    }

    fn send(&self, data: Vec<u8>) -> Result<(), SwarmError> {
        if *self.phase.lock().unwrap() != Phase::Established {
            return Err(SwarmError::NotConnected);
        }
        if !self
            .hub
            .deliver(self.ctx.session_id, self.ctx.remote_id, TransportEvent::Data(data))
        {
            return Err(SwarmError::Transport("remote link gone".into()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SwarmError> {
        let was_established = {
            let mut phase = self.phase.lock().unwrap();
            if *phase == Phase::Closed {
                return Ok(());
            }
            let was = *phase == Phase::Established;
            *phase = Phase::Closed;
            was
        };
        self.hub.detach(self.ctx.session_id, self.ctx.own_id);
        if was_established {
            // Remote hangup notification.
            self.hub
                .deliver(self.ctx.session_id, self.ctx.remote_id, TransportEvent::Closed);
        }
        Ok(())
    }
}
