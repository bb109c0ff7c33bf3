//! Topic registry tying swarms to a shared signaling client.
//!
//! The manager owns the process-wide [`SignalingClient`] and routes its
//! inbound traffic to the swarm registered for each topic. Swarms never
//! see the client directly; they get a topic-bound [`SwarmSignaling`]
//! slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lattice_core::{
    Answer, ErrorSink, PeerId, SignalMessage, SwarmError, SwarmEvent, SwarmTimings, Topic,
};

use crate::signaling::{OfferHandler, SignalingClient, SignalingEvent, SwarmSignaling};
use crate::swarm::{Swarm, SwarmParams};
use crate::topology::Topology;
use crate::transport::TransportFactory;

/// Everything needed to join one topic.
pub struct SwarmOptions {
    pub topic: Topic,
    pub peer_id: PeerId,
    pub topology: Arc<dyn Topology>,
    pub transport: Arc<dyn TransportFactory>,
    pub timings: SwarmTimings,
}

struct SwarmEntry {
    swarm: Arc<Swarm>,
    peer_id: PeerId,
}

pub struct NetworkManager {
    signaling: Arc<dyn SignalingClient>,
    swarms: Arc<DashMap<Topic, SwarmEntry>>,
    events_tx: mpsc::UnboundedSender<SwarmEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SwarmEvent>>>,
    errors: ErrorSink,
    router: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl NetworkManager {
    /// Build a manager. `make_signaling` receives the manager's offer
    /// handler and event sender and returns the client wired to them;
    /// this keeps the manager independent of the concrete signaling
    /// transport. Must run inside a tokio runtime.
    pub fn new<F>(make_signaling: F, errors: ErrorSink) -> Arc<Self>
    where
        F: FnOnce(OfferHandler, mpsc::UnboundedSender<SignalingEvent>) -> Arc<dyn SignalingClient>,
    {
        let swarms: Arc<DashMap<Topic, SwarmEntry>> = Arc::new(DashMap::new());

        let offers: OfferHandler = {
            let swarms = swarms.clone();
            Arc::new(move |msg: SignalMessage| {
                // Clone the swarm out of the map guard before awaiting.
                let swarm = swarms.get(&msg.topic).map(|entry| entry.swarm.clone());
                Box::pin(async move {
                    match swarm {
                        Some(swarm) => swarm.on_offer(msg).await,
                        None => {
                            tracing::debug!(
                                topic = %msg.topic,
                                peer = %msg.id,
                                "offer for unknown topic, rejecting"
                            );
                            Ok(Answer::REJECT)
                        }
                    }
                })
            })
        };

        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let signaling = make_signaling(offers, signaling_tx);
        let router = tokio::spawn(Self::route_events(swarms.clone(), signaling_rx));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            signaling,
            swarms,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            errors,
            router: Mutex::new(Some(router)),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Take the stream of peer connect/disconnect notifications. Yields
    /// once per manager.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SwarmEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    pub fn swarm(&self, topic: Topic) -> Option<Arc<Swarm>> {
        self.swarms.get(&topic).map(|entry| entry.swarm.clone())
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.swarms.iter().map(|entry| *entry.key()).collect()
    }

    /// Join a topic: register the swarm, announce membership over
    /// signaling, kick off the first lookup. One swarm per topic.
    pub async fn join_swarm(&self, options: SwarmOptions) -> Result<Arc<Swarm>, SwarmError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SwarmError::Destroyed);
        }
        tracing::info!(topic = %options.topic, peer = %options.peer_id, "joining swarm");

        let swarm = Swarm::new(SwarmParams {
            topic: options.topic,
            own_id: options.peer_id,
            topology: options.topology,
            signaling: Arc::new(TopicSignaling {
                client: self.signaling.clone(),
                topic: options.topic,
            }),
            transport: options.transport,
            timings: options.timings,
            events: self.events_tx.clone(),
            errors: self.errors.clone(),
        });

        let inserted = match self.swarms.entry(options.topic) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SwarmEntry {
                    swarm: swarm.clone(),
                    peer_id: options.peer_id,
                });
                true
            }
        };
        if !inserted {
            if let Err(e) = swarm.destroy().await {
                self.errors.report(e);
            }
            return Err(SwarmError::TopicAlreadyJoined {
                topic: options.topic,
            });
        }

        if let Err(e) = self.signaling.join(options.topic, options.peer_id).await {
            tracing::warn!(topic = %options.topic, error = %e, "signaling join failed, rolling back");
            self.swarms.remove(&options.topic);
            if let Err(de) = swarm.destroy().await {
                self.errors.report(de);
            }
            return Err(e);
        }

        self.signaling.lookup(options.topic);
        Ok(swarm)
    }

    /// Leave a topic: withdraw from signaling (best effort), then destroy
    /// the swarm. Leaving a topic we never joined is a no-op.
    pub async fn leave_swarm(&self, topic: Topic) -> Result<(), SwarmError> {
        let Some((_, entry)) = self.swarms.remove(&topic) else {
            tracing::debug!(%topic, "leave for a topic we never joined");
            return Ok(());
        };
        tracing::info!(%topic, peer = %entry.peer_id, "leaving swarm");

        if let Err(e) = self.signaling.leave(topic, entry.peer_id).await {
            tracing::warn!(%topic, error = %e, "signaling leave failed");
            self.errors.report(e);
        }
        entry.swarm.destroy().await
    }

    /// Leave every topic and stop routing. The first swarm teardown
    /// failure is returned, later ones go to the error sink.
    pub async fn destroy(&self) -> Result<(), SwarmError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("destroying network manager");

        let topics = self.topics();
        let mut first_err = None;
        for topic in topics {
            match self.leave_swarm(topic).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(%topic, error = %e, "swarm teardown failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        self.errors.report(e);
                    }
                }
            }
        }

        if let Some(router) = self.router.lock().unwrap().take() {
            router.abort();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn route_events(
        swarms: Arc<DashMap<Topic, SwarmEntry>>,
        mut rx: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                SignalingEvent::PeerCandidatesChanged { topic, candidates } => {
                    match swarms.get(&topic) {
                        Some(entry) => entry.swarm.on_peer_candidates_changed(candidates),
                        None => {
                            tracing::debug!(%topic, "candidate update for unknown topic, dropping")
                        }
                    }
                }
                SignalingEvent::Signal(msg) => match swarms.get(&msg.topic) {
                    Some(entry) => entry.swarm.on_signal(&msg),
                    None => {
                        tracing::debug!(topic = %msg.topic, "signal for unknown topic, dropping")
                    }
                },
            }
        }
    }
}

/// [`SignalingClient`] slice bound to one topic.
struct TopicSignaling {
    client: Arc<dyn SignalingClient>,
    topic: Topic,
}

impl SwarmSignaling for TopicSignaling {
    fn offer(&self, msg: SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>> {
        self.client.offer(msg)
    }

    fn signal(&self, msg: SignalMessage) -> BoxFuture<'static, Result<(), SwarmError>> {
        self.client.signal(msg)
    }

    fn lookup(&self) {
        self.client.lookup(self.topic);
    }
}
