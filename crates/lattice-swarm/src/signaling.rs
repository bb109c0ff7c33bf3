//! Signaling collaborator boundary.
//!
//! The manager owns one [`SignalingClient`]; each swarm sees only the
//! narrow [`SwarmSignaling`] slice bound to its topic, so swarms never
//! depend on the concrete signaling transport.
//!
//! The crate ships an in-memory implementation backed by a shared
//! [`MemoryBroker`]. The broker is injected and lifetime-scoped — parallel
//! tests each build their own.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use lattice_core::{Answer, PeerId, SignalMessage, SwarmError, Topic};

/// Inbound events pushed by a signaling client.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A fresh view of the peers interested in `topic`.
    PeerCandidatesChanged {
        topic: Topic,
        candidates: Vec<PeerId>,
    },
    /// A mid-negotiation payload for an existing connection attempt.
    Signal(SignalMessage),
}

/// Inbound offer handler, supplied when the client is constructed.
pub type OfferHandler =
    Arc<dyn Fn(SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>> + Send + Sync>;

/// The signaling transport as consumed by the manager.
pub trait SignalingClient: Send + Sync {
    /// Idempotent membership registration.
    fn join(&self, topic: Topic, peer: PeerId) -> BoxFuture<'static, Result<(), SwarmError>>;
    fn leave(&self, topic: Topic, peer: PeerId) -> BoxFuture<'static, Result<(), SwarmError>>;

    /// Request a candidate refresh; results arrive as
    /// [`SignalingEvent::PeerCandidatesChanged`].
    fn lookup(&self, topic: Topic);

    /// Offer round trip to the recipient peer.
    fn offer(&self, msg: SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>>;

    /// Fire-and-forget negotiation payload delivery.
    fn signal(&self, msg: SignalMessage) -> BoxFuture<'static, Result<(), SwarmError>>;
}

/// The slice of signaling a single swarm uses, pre-bound to its topic.
pub trait SwarmSignaling: Send + Sync {
    fn offer(&self, msg: SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>>;
    fn signal(&self, msg: SignalMessage) -> BoxFuture<'static, Result<(), SwarmError>>;
    fn lookup(&self);
}

#[derive(Clone)]
struct Endpoint {
    offers: OfferHandler,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

/// In-process signaling broker: topic membership plus per-peer routing.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<Topic, HashSet<PeerId>>,
    endpoints: DashMap<PeerId, Endpoint>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Peers currently registered for a topic.
    pub fn members(&self, topic: Topic) -> Vec<PeerId> {
        self.topics
            .get(&topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn join(&self, topic: Topic, peer: PeerId, endpoint: Endpoint) {
        self.endpoints.insert(peer, endpoint);
        self.topics.entry(topic).or_default().insert(peer);
        tracing::debug!(%topic, %peer, "broker: peer joined");
        self.announce(topic);
    }

    fn leave(&self, topic: Topic, peer: PeerId) {
        if let Some(mut set) = self.topics.get_mut(&topic) {
            set.remove(&peer);
        }
        let still_member = self.topics.iter().any(|entry| entry.value().contains(&peer));
        if !still_member {
            self.endpoints.remove(&peer);
        }
        tracing::debug!(%topic, %peer, "broker: peer left");
        self.announce(topic);
    }

    /// Push the current member list to every member of `topic`.
    pub fn announce(&self, topic: Topic) {
        let members = self.members(topic);
        for peer in &members {
            if let Some(endpoint) = self.endpoints.get(peer) {
                let _ = endpoint
                    .events
                    .send(SignalingEvent::PeerCandidatesChanged {
                        topic,
                        candidates: members.clone(),
                    });
            }
        }
    }

    /// Route an offer to the recipient's registered handler.
    pub async fn route_offer(&self, msg: SignalMessage) -> Result<Answer, SwarmError> {
        let handler = match self.endpoints.get(&msg.remote_id) {
            Some(endpoint) => endpoint.offers.clone(),
            None => {
                return Err(SwarmError::Signaling(format!(
                    "peer {} not reachable",
                    msg.remote_id
                )))
            }
        };
        handler(msg).await
    }

    pub fn route_signal(&self, msg: SignalMessage) -> Result<(), SwarmError> {
        let sender = self
            .endpoints
            .get(&msg.remote_id)
            .map(|endpoint| endpoint.events.clone())
            .ok_or_else(|| {
                SwarmError::Signaling(format!("peer {} not reachable", msg.remote_id))
            })?;
        sender
            .send(SignalingEvent::Signal(msg))
            .map_err(|_| SwarmError::Signaling("recipient event channel closed".into()))
    }
}

/// A peer-process view onto a [`MemoryBroker`].
pub struct MemorySignaling {
    broker: Arc<MemoryBroker>,
    endpoint: Endpoint,
}

impl MemorySignaling {
    pub fn new(
        broker: Arc<MemoryBroker>,
        offers: OfferHandler,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            endpoint: Endpoint { offers, events },
        })
    }
}

impl SignalingClient for MemorySignaling {
    fn join(&self, topic: Topic, peer: PeerId) -> BoxFuture<'static, Result<(), SwarmError>> {
        let broker = self.broker.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            broker.join(topic, peer, endpoint);
            Ok(())
        })
    }

    fn leave(&self, topic: Topic, peer: PeerId) -> BoxFuture<'static, Result<(), SwarmError>> {
        let broker = self.broker.clone();
        Box::pin(async move {
            broker.leave(topic, peer);
            Ok(())
        })
    }

    fn lookup(&self, topic: Topic) {
        self.broker.announce(topic);
    }

    fn offer(&self, msg: SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>> {
        let broker = self.broker.clone();
        Box::pin(async move { broker.route_offer(msg).await })
    }

    fn signal(&self, msg: SignalMessage) -> BoxFuture<'static, Result<(), SwarmError>> {
        let broker = self.broker.clone();
        Box::pin(async move { broker.route_signal(msg) })
    }
}
