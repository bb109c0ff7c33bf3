//! Topology strategies.
//!
//! A topology is pure decision logic: given a snapshot of the swarm it
//! decides which peers to connect to or drop, and whether to admit an
//! incoming offer. It touches swarm state only through the narrow
//! [`SwarmController`] capability, never the swarm itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use lattice_core::PeerId;

/// Read-only snapshot handed to a topology.
///
/// `candidates` excludes peers that already have a connection and always
/// excludes the local peer.
#[derive(Debug, Clone)]
pub struct SwarmState {
    pub own_peer_id: PeerId,
    pub connected: Vec<PeerId>,
    pub candidates: Vec<PeerId>,
}

impl SwarmState {
    pub fn empty(own_peer_id: PeerId) -> Self {
        Self {
            own_peer_id,
            connected: Vec::new(),
            candidates: Vec::new(),
        }
    }
}

/// The capability a swarm hands to its topology. All mutating calls are
/// non-blocking; the actual work runs on background tasks.
pub trait SwarmController: Send + Sync {
    fn state(&self) -> SwarmState;
    fn connect(&self, peer: PeerId);
    fn disconnect(&self, peer: PeerId);
    /// Request a fresh candidate list from signaling.
    fn lookup(&self);
}

/// Strategy contract. One instance serves at most one swarm at a time;
/// swapping topologies destroys the old instance first.
pub trait Topology: Send + Sync {
    /// Bind to a swarm. May start background timers.
    fn init(&self, controller: Arc<dyn SwarmController>);

    /// Called whenever swarm state changes. Side-effect only.
    fn update(&self);

    /// Whether to admit an incoming offer from `peer`. Only consulted for
    /// offers that passed discovery and tie-break checks.
    fn on_offer(&self, peer: PeerId) -> bool;

    /// Release timers and background work. An error here is fatal to the
    /// owning swarm.
    fn destroy(&self) -> anyhow::Result<()>;
}

/// Connects to every discovered candidate.
pub struct FullMeshTopology {
    controller: Mutex<Option<Arc<dyn SwarmController>>>,
    lookup_task: Mutex<Option<JoinHandle<()>>>,
    lookup_every: Duration,
}

impl FullMeshTopology {
    pub fn new() -> Arc<Self> {
        Self::with_lookup_interval(Duration::from_secs(10))
    }

    /// Override the periodic-lookup interval (tests use short ones).
    pub fn with_lookup_interval(lookup_every: Duration) -> Arc<Self> {
        Arc::new(Self {
            controller: Mutex::new(None),
            lookup_task: Mutex::new(None),
            lookup_every,
        })
    }

    fn controller(&self) -> Option<Arc<dyn SwarmController>> {
        self.controller.lock().unwrap().clone()
    }
}

impl Topology for FullMeshTopology {
    fn init(&self, controller: Arc<dyn SwarmController>) {
        *self.controller.lock().unwrap() = Some(controller.clone());

        let every = self.lookup_every;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The immediate first tick would duplicate the lookup the
            // manager issues on join.
            interval.tick().await;
            loop {
                interval.tick().await;
                controller.lookup();
            }
        });
        *self.lookup_task.lock().unwrap() = Some(handle);
    }

    fn update(&self) {
        let Some(controller) = self.controller() else { return };
        let state = controller.state();
        for peer in state.candidates {
            tracing::debug!(%peer, "full mesh: connecting to candidate");
            controller.connect(peer);
        }
    }

    fn on_offer(&self, _peer: PeerId) -> bool {
        true
    }

    fn destroy(&self) -> anyhow::Result<()> {
        if let Some(task) = self.lookup_task.lock().unwrap().take() {
            task.abort();
        }
        self.controller.lock().unwrap().take();
        Ok(())
    }
}

/// Connects every peer to one designated center peer only.
///
/// The center connects to all candidates; leaves connect to the center
/// and drop any edge that bypasses it.
pub struct StarTopology {
    center: PeerId,
    controller: Mutex<Option<Arc<dyn SwarmController>>>,
}

impl StarTopology {
    pub fn new(center: PeerId) -> Arc<Self> {
        Arc::new(Self {
            center,
            controller: Mutex::new(None),
        })
    }

    fn controller(&self) -> Option<Arc<dyn SwarmController>> {
        self.controller.lock().unwrap().clone()
    }

    fn is_center(&self, state: &SwarmState) -> bool {
        state.own_peer_id == self.center
    }
}

impl Topology for StarTopology {
    fn init(&self, controller: Arc<dyn SwarmController>) {
        *self.controller.lock().unwrap() = Some(controller);
    }

    fn update(&self) {
        let Some(controller) = self.controller() else { return };
        let state = controller.state();

        if self.is_center(&state) {
            for peer in state.candidates {
                controller.connect(peer);
            }
            return;
        }

        if state.candidates.contains(&self.center) {
            controller.connect(self.center);
        }
        for peer in state.connected {
            if peer != self.center {
                tracing::debug!(%peer, "star: dropping edge that bypasses the center");
                controller.disconnect(peer);
            }
        }
    }

    fn on_offer(&self, peer: PeerId) -> bool {
        if peer == self.center {
            return true;
        }
        match self.controller() {
            Some(c) => self.is_center(&c.state()),
            None => false,
        }
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.controller.lock().unwrap().take();
        Ok(())
    }
}
