//! Swarm: membership and connection management for one topic.
//!
//! The swarm owns the connection table and the candidate set; nothing
//! else mutates them. The topology reaches in only through the
//! [`SwarmController`] capability, and connections report back over a
//! channel pumped by a swarm-owned task.
//!
//! The central protocol here is offer/answer race resolution: two peers
//! may originate toward each other simultaneously, and both sides resolve
//! the race locally by comparing peer ids, independent of message arrival
//! order. The lower id's origination survives on both sides.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use lattice_core::{
    Answer, ErrorSink, PeerId, SessionId, SignalMessage, SwarmError, SwarmEvent, SwarmTimings,
    Topic,
};

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::signaling::SwarmSignaling;
use crate::topology::{SwarmController, SwarmState, Topology};
use crate::transport::{SignalSender, TransportFactory};

pub struct SwarmParams {
    pub topic: Topic,
    pub own_id: PeerId,
    pub topology: Arc<dyn Topology>,
    pub signaling: Arc<dyn SwarmSignaling>,
    pub transport: Arc<dyn TransportFactory>,
    pub timings: SwarmTimings,
    pub events: mpsc::UnboundedSender<SwarmEvent>,
    pub errors: ErrorSink,
}

pub struct Swarm {
    topic: Topic,
    own_id: PeerId,
    timings: SwarmTimings,
    signaling: Arc<dyn SwarmSignaling>,
    transport: Arc<dyn TransportFactory>,
    topology: Mutex<Option<Arc<dyn Topology>>>,
    /// At most one live connection per remote peer. Entries are evicted
    /// only when the closing session id matches the stored one.
    connections: DashMap<PeerId, Arc<Connection>>,
    /// Discovered peers, never containing our own id.
    candidates: RwLock<HashSet<PeerId>>,
    candidates_changed: Notify,
    conn_events: mpsc::UnboundedSender<ConnectionEvent>,
    events: mpsc::UnboundedSender<SwarmEvent>,
    errors: ErrorSink,
    destroyed: AtomicBool,
    destroy_notify: Notify,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Swarm {
    /// Build a swarm and bind its topology. Must run inside a tokio
    /// runtime: the swarm spawns its connection-event pump here.
    pub fn new(params: SwarmParams) -> Arc<Self> {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let swarm = Arc::new(Self {
            topic: params.topic,
            own_id: params.own_id,
            timings: params.timings,
            signaling: params.signaling,
            transport: params.transport,
            topology: Mutex::new(Some(params.topology.clone())),
            connections: DashMap::new(),
            candidates: RwLock::new(HashSet::new()),
            candidates_changed: Notify::new(),
            conn_events: conn_tx,
            events: params.events,
            errors: params.errors,
            destroyed: AtomicBool::new(false),
            destroy_notify: Notify::new(),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump_connection_events(
            Arc::downgrade(&swarm),
            conn_rx,
        ));
        *swarm.pump.lock().unwrap() = Some(pump);

        params.topology.init(swarm.controller());
        params.topology.update();
        swarm
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    pub fn connection(&self, peer: PeerId) -> Option<Arc<Connection>> {
        self.connections.get(&peer).map(|entry| entry.value().clone())
    }

    /// Peers whose connection has reached the connected state.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Connected)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Live table entries, connected or still negotiating.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn topology(&self) -> Option<Arc<dyn Topology>> {
        self.topology.lock().unwrap().clone()
    }

    fn topology_update(&self) {
        if let Some(topology) = self.topology() {
            topology.update();
        }
    }

    fn snapshot(&self) -> SwarmState {
        let connected: Vec<PeerId> = self.connections.iter().map(|e| *e.key()).collect();
        let candidates = self
            .candidates
            .read()
            .unwrap()
            .iter()
            .copied()
            .filter(|peer| !self.connections.contains_key(peer))
            .collect();
        SwarmState {
            own_peer_id: self.own_id,
            connected,
            candidates,
        }
    }

    fn controller(self: &Arc<Self>) -> Arc<dyn SwarmController> {
        Arc::new(ControllerHandle {
            swarm: Arc::downgrade(self),
            own_id: self.own_id,
        })
    }

    /// Replace the discovered-candidate set (minus self) and let the
    /// topology react.
    pub fn on_peer_candidates_changed(&self, candidates: Vec<PeerId>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let set: HashSet<PeerId> = candidates
            .into_iter()
            .filter(|peer| *peer != self.own_id)
            .collect();
        tracing::debug!(topic = %self.topic, count = set.len(), "candidate set replaced");
        *self.candidates.write().unwrap() = set;
        self.candidates_changed.notify_waiters();
        self.topology_update();
    }

    /// Route an inbound negotiation payload to the connection it belongs
    /// to. Unknown senders are dropped — their offer may have been
    /// superseded already.
    pub fn on_signal(&self, msg: &SignalMessage) {
        match self.connection(msg.id) {
            Some(conn) => conn.signal(msg),
            None => {
                tracing::debug!(topic = %self.topic, peer = %msg.id, "signal for unknown connection, dropping");
            }
        }
    }

    /// Handle an incoming offer: discovery wait, tie-break, topology
    /// admission.
    pub async fn on_offer(&self, msg: SignalMessage) -> Result<Answer, SwarmError> {
        let remote = msg.id;
        tracing::debug!(topic = %self.topic, peer = %remote, session = %msg.session_id, "incoming offer");

        self.wait_for_candidate(remote).await?;

        if let Some(existing) = self.connection(remote) {
            // Simultaneous origination. Both sides compare the same pair
            // of ids, so exactly one origination survives.
            if remote < self.own_id {
                tracing::debug!(
                    own = %self.own_id,
                    peer = %remote,
                    "remote has the lower id, yielding our attempt"
                );
                let errors = self.errors.clone();
                tokio::spawn(async move {
                    if let Err(e) = existing.close() {
                        tracing::warn!(error = %e, "failed to close superseded attempt");
                        errors.report(e);
                    }
                });
                // Fall through and admit the remote's offer; the new
                // entry replaces ours and the stale close cannot evict it.
            } else {
                tracing::debug!(
                    own = %self.own_id,
                    peer = %remote,
                    "we have the lower id, keeping our attempt"
                );
                // The remote applies the symmetric rule: it closes its
                // own attempt and accepts our offer. No connection is
                // created for this answer on purpose.
                return Ok(Answer::ACCEPT);
            }
        }

        let admit = match self.topology() {
            Some(topology) => topology.on_offer(remote),
            None => false,
        };

        let answer = if admit {
            let conn = self.create_connection(remote, msg.session_id, false);
            if let Err(e) = conn.connect() {
                tracing::warn!(peer = %remote, error = %e, "failed to start accepted connection");
            }
            Answer::ACCEPT
        } else {
            tracing::debug!(peer = %remote, "topology refused offer");
            Answer::REJECT
        };

        self.topology_update();
        Ok(answer)
    }

    /// Originate a connection to `peer`: new session, initiator
    /// connection, offer round trip.
    ///
    /// A rejecting answer removes the peer from the candidate set; a
    /// failed send is reported but not retried — the topology retries on
    /// its next update.
    pub async fn connect_to_peer(&self, peer: PeerId) -> Result<(), SwarmError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SwarmError::Destroyed);
        }
        if peer == self.own_id {
            return Ok(());
        }
        if self.connections.contains_key(&peer) {
            tracing::debug!(peer = %peer, "attempt already live, skipping origination");
            return Ok(());
        }

        let session = SessionId::random();
        tracing::debug!(topic = %self.topic, %peer, %session, "originating connection");
        let conn = self.create_connection(peer, session, true);

        let offer = SignalMessage {
            id: self.own_id,
            remote_id: peer,
            session_id: session,
            topic: self.topic,
            data: serde_json::Value::Null,
        };

        match self.signaling.offer(offer).await {
            Ok(answer) if answer.accept => {
                if let Err(e) = conn.connect() {
                    // The tie-break may have replaced this attempt while
                    // the answer was in flight.
                    tracing::debug!(%peer, error = %e, "attempt superseded before the answer arrived");
                }
            }
            Ok(_) => {
                tracing::debug!(%peer, "offer rejected, dropping candidate");
                self.candidates.write().unwrap().remove(&peer);
                self.drop_attempt(&conn);
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "offer delivery failed");
                self.errors.report(e);
                self.drop_attempt(&conn);
            }
        }

        self.topology_update();
        Ok(())
    }

    /// Close the connection to `peer`, if any. Eviction happens on the
    /// closed event, guarded by session id.
    pub fn disconnect_from_peer(&self, peer: PeerId) {
        let Some(conn) = self.connection(peer) else {
            return;
        };
        if let Err(e) = conn.close() {
            tracing::warn!(%peer, error = %e, "disconnect failed");
            self.errors.report(e);
        }
    }

    /// Dispose the current topology and install a new one.
    pub fn set_topology(self: &Arc<Self>, topology: Arc<dyn Topology>) -> Result<(), SwarmError> {
        let old = self.topology.lock().unwrap().take();
        if let Some(old) = old {
            old.destroy()
                .map_err(|e| SwarmError::Topology(e.to_string()))?;
        }
        *self.topology.lock().unwrap() = Some(topology.clone());
        topology.init(self.controller());
        topology.update();
        Ok(())
    }

    /// Tear the swarm down: cancel pending discovery waits, dispose the
    /// topology (its failure is fatal and propagates), then close every
    /// connection concurrently, tolerating individual failures.
    pub async fn destroy(&self) -> Result<(), SwarmError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(topic = %self.topic, "destroying swarm");
        self.destroy_notify.notify_waiters();

        let topology_result = match self.topology.lock().unwrap().take() {
            Some(topology) => topology
                .destroy()
                .map_err(|e| SwarmError::Topology(e.to_string())),
            None => Ok(()),
        };
        if let Err(e) = &topology_result {
            tracing::error!(topic = %self.topic, error = %e, "topology destroy failed");
        }

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();

        let closers: Vec<JoinHandle<Result<(), SwarmError>>> = connections
            .into_iter()
            .map(|conn| tokio::spawn(async move { conn.close() }))
            .collect();
        for closer in closers {
            match closer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "connection close failed during teardown");
                    self.errors.report(e);
                }
                Err(e) => tracing::warn!(error = %e, "close task failed during teardown"),
            }
        }

        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }

        topology_result
    }

    /// Block until `peer` shows up in the candidate set, re-triggering a
    /// signaling lookup every poll interval, bounded by the discovery
    /// timeout.
    async fn wait_for_candidate(&self, peer: PeerId) -> Result<(), SwarmError> {
        let deadline = tokio::time::Instant::now() + self.timings.discovery_timeout;
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(SwarmError::Destroyed);
            }
            // Register before checking, so a concurrent update cannot be
            // missed between the check and the wait.
            let notified = self.candidates_changed.notified();
            if self.candidates.read().unwrap().contains(&peer) {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(topic = %self.topic, %peer, "discovery wait timed out");
                return Err(SwarmError::DiscoveryTimeout { peer });
            }
            let poll = self.timings.lookup_interval.min(deadline - now);

            tokio::select! {
                _ = notified => {}
                _ = self.destroy_notify.notified() => return Err(SwarmError::Destroyed),
                _ = tokio::time::sleep(poll) => {
                    self.signaling.lookup();
                }
            }
        }
    }

    fn create_connection(
        &self,
        remote: PeerId,
        session: SessionId,
        initiator: bool,
    ) -> Arc<Connection> {
        let signals = {
            let signaling = self.signaling.clone();
            let errors = self.errors.clone();
            let (topic, own) = (self.topic, self.own_id);
            SignalSender::new(move |payload| {
                let msg = SignalMessage {
                    id: own,
                    remote_id: remote,
                    session_id: session,
                    topic,
                    data: payload,
                };
                let fut = signaling.signal(msg);
                let errors = errors.clone();
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::warn!(peer = %remote, error = %e, "signal delivery failed");
                        errors.report(e);
                    }
                });
            })
        };

        let conn = Connection::new(
            self.topic,
            self.own_id,
            remote,
            session,
            initiator,
            self.transport.as_ref(),
            signals,
            self.conn_events.clone(),
        );
        self.connections.insert(remote, conn.clone());
        conn
    }

    /// Remove an abandoned origination, guarded by session id, and close
    /// it.
    fn drop_attempt(&self, conn: &Arc<Connection>) {
        self.connections
            .remove_if(&conn.remote_id(), |_, c| c.session_id() == conn.session_id());
        if let Err(e) = conn.close() {
            tracing::warn!(peer = %conn.remote_id(), error = %e, "failed to close abandoned attempt");
            self.errors.report(e);
        }
    }

    async fn pump_connection_events(
        swarm: Weak<Swarm>,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(swarm) = swarm.upgrade() else { return };
            match event {
                ConnectionEvent::Connected { peer, session } => {
                    tracing::debug!(topic = %swarm.topic, %peer, %session, "peer connected");
                    let _ = swarm.events.send(SwarmEvent::PeerConnected {
                        topic: swarm.topic,
                        peer,
                        session,
                    });
                    swarm.topology_update();
                }
                ConnectionEvent::Closed {
                    peer,
                    session,
                    was_connected,
                } => {
                    let evicted = swarm
                        .connections
                        .remove_if(&peer, |_, conn| conn.session_id() == session)
                        .is_some();
                    if evicted {
                        tracing::debug!(topic = %swarm.topic, %peer, %session, "connection evicted");
                    } else {
                        tracing::debug!(
                            topic = %swarm.topic, %peer, %session,
                            "stale close, table entry already replaced"
                        );
                    }
                    if was_connected {
                        let _ = swarm.events.send(SwarmEvent::PeerDisconnected {
                            topic: swarm.topic,
                            peer,
                            session,
                        });
                    }
                    swarm.topology_update();
                }
            }
        }
    }
}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("topic", &self.topic)
            .field("own_id", &self.own_id)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

struct ControllerHandle {
    swarm: Weak<Swarm>,
    own_id: PeerId,
}

impl SwarmController for ControllerHandle {
    fn state(&self) -> SwarmState {
        match self.swarm.upgrade() {
            Some(swarm) => swarm.snapshot(),
            None => SwarmState::empty(self.own_id),
        }
    }

    fn connect(&self, peer: PeerId) {
        let Some(swarm) = self.swarm.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = swarm.connect_to_peer(peer).await {
                tracing::debug!(%peer, error = %e, "origination failed");
            }
        });
    }

    fn disconnect(&self, peer: PeerId) {
        if let Some(swarm) = self.swarm.upgrade() {
            swarm.disconnect_from_peer(peer);
        }
    }

    fn lookup(&self) {
        if let Some(swarm) = self.swarm.upgrade() {
            swarm.signaling.lookup();
        }
    }
}
