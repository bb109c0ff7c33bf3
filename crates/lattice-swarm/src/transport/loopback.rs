//! Loopback transport.
//!
//! Pairs two in-process connections under the same topic by matching on
//! the unordered peer pair in a registry. No signaling round trip: the
//! first half to connect waits in the registry, and when the second half
//! registers both flip straight to connected. The registry is injected,
//! never a process-wide singleton, so tests can run isolated meshes in
//! parallel.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;

use lattice_core::{PeerId, SwarmError, Topic};

use super::{Transport, TransportContext, TransportEvent, TransportFactory};

/// Unordered peer pair under one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LinkKey {
    topic: Topic,
    lo: PeerId,
    hi: PeerId,
}

impl LinkKey {
    fn new(topic: Topic, a: PeerId, b: PeerId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self { topic, lo, hi }
    }
}

struct WaitingHalf {
    peer: PeerId,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Slot on the waiting transport that receives the peer's event
    /// sender once the second half arrives.
    peer_slot: Arc<Mutex<LinkState>>,
}

enum LinkState {
    Idle,
    Waiting,
    Paired(mpsc::UnboundedSender<TransportEvent>),
    Closed,
}

/// Pairing table for loopback links.
#[derive(Default)]
pub struct LoopbackRegistry {
    waiting: DashMap<LinkKey, WaitingHalf>,
}

impl LoopbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct LoopbackTransportFactory {
    registry: Arc<LoopbackRegistry>,
}

impl LoopbackTransportFactory {
    pub fn new(registry: Arc<LoopbackRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

impl TransportFactory for LoopbackTransportFactory {
    fn create(&self, ctx: TransportContext) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            ctx,
            registry: self.registry.clone(),
            link: Arc::new(Mutex::new(LinkState::Idle)),
        })
    }
}

pub struct LoopbackTransport {
    ctx: TransportContext,
    registry: Arc<LoopbackRegistry>,
    link: Arc<Mutex<LinkState>>,
}

impl LoopbackTransport {
    fn key(&self) -> LinkKey {
        LinkKey::new(self.ctx.topic, self.ctx.own_id, self.ctx.remote_id)
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self, _initiator: bool) -> Result<(), SwarmError> {
        {
            let link = self.link.lock().unwrap();
            match *link {
                LinkState::Idle => {}
                LinkState::Closed => return Err(SwarmError::ConnectionClosed),
                _ => return Ok(()),
            }
        }

        let key = self.key();
        // Take the other half if it is already waiting; otherwise wait.
        let other = self
            .registry
            .waiting
            .remove_if(&key, |_, half| half.peer == self.ctx.remote_id)
            .map(|(_, half)| half);

        match other {
            Some(half) => {
                {
                    let mut peer_link = half.peer_slot.lock().unwrap();
                    if matches!(*peer_link, LinkState::Closed) {
                        // The other side closed while parked. Go back to
                        // waiting for a fresh half.
                        drop(peer_link);
                        return self.park(key);
                    }
                    *peer_link = LinkState::Paired(self.ctx.events.clone());
                }
                *self.link.lock().unwrap() = LinkState::Paired(half.events.clone());
                let _ = half.events.send(TransportEvent::Connected);
                let _ = self.ctx.events.send(TransportEvent::Connected);
                Ok(())
            }
            None => self.park(key),
        }
    }

    fn signal(&self, _payload: serde_json::Value) -> Result<(), SwarmError> {
        // Loopback links negotiate nothing.
        tracing::debug!(peer = %self.ctx.remote_id, "loopback transport ignoring signal payload");
        Ok(())
    }

    fn send(&self, data: Vec<u8>) -> Result<(), SwarmError> {
        match &*self.link.lock().unwrap() {
            LinkState::Paired(peer) => peer
                .send(TransportEvent::Data(data))
                .map_err(|_| SwarmError::Transport("loopback peer gone".into())),
            LinkState::Closed => Err(SwarmError::ConnectionClosed),
            _ => Err(SwarmError::NotConnected),
        }
    }

    fn close(&self) -> Result<(), SwarmError> {
        let previous = {
            let mut link = self.link.lock().unwrap();
            std::mem::replace(&mut *link, LinkState::Closed)
        };
        match previous {
            LinkState::Waiting => {
                self.registry
                    .waiting
                    .remove_if(&self.key(), |_, half| half.peer == self.ctx.own_id);
            }
            LinkState::Paired(peer) => {
                let _ = peer.send(TransportEvent::Closed);
            }
            _ => {}
        }
        Ok(())
    }
}

impl LoopbackTransport {
    fn park(&self, key: LinkKey) -> Result<(), SwarmError> {
        *self.link.lock().unwrap() = LinkState::Waiting;
        self.registry.waiting.insert(
            key,
            WaitingHalf {
                peer: self.ctx.own_id,
                events: self.ctx.events.clone(),
                peer_slot: self.link.clone(),
            },
        );
        Ok(())
    }
}
