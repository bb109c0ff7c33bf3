//! Shared harness: in-process meshes, simulated peers, wait helpers.

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::mpsc;

use lattice_core::{ErrorSink, PeerId, SwarmError, SwarmEvent, SwarmTimings, Topic};
use lattice_swarm::{
    FullMeshTopology, LoopbackRegistry, LoopbackTransportFactory, MemoryBroker, MemoryHub,
    MemorySignaling, MemoryTransportFactory, NetworkManager, SignalingClient, Swarm, SwarmOptions,
    Topology,
};

/// Install a subscriber once for the whole suite. Verbosity comes from
/// `RUST_LOG`, default silent.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One isolated network: signaling broker plus both transport fabrics.
pub struct Mesh {
    pub broker: Arc<MemoryBroker>,
    pub hub: Arc<MemoryHub>,
    pub registry: Arc<LoopbackRegistry>,
}

impl Mesh {
    pub fn new() -> Self {
        init_tracing();
        Self {
            broker: MemoryBroker::new(),
            hub: MemoryHub::new(),
            registry: LoopbackRegistry::new(),
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer_with_id(PeerId::random())
    }

    pub fn peer_with_id(&self, id: PeerId) -> Peer {
        let broker = self.broker.clone();
        let (err_tx, errors) = mpsc::unbounded_channel();
        let manager = NetworkManager::new(
            move |offers, events| {
                MemorySignaling::new(broker, offers, events) as Arc<dyn SignalingClient>
            },
            ErrorSink::new(err_tx),
        );
        let events = manager.take_events().unwrap();
        Peer {
            id,
            manager,
            events,
            errors,
        }
    }
}

/// A simulated process: one manager, one peer id, captured event and
/// error streams.
pub struct Peer {
    pub id: PeerId,
    pub manager: Arc<NetworkManager>,
    pub events: mpsc::UnboundedReceiver<SwarmEvent>,
    pub errors: mpsc::UnboundedReceiver<SwarmError>,
}

impl Peer {
    /// Join with the default setup: full mesh over the memory transport.
    pub async fn join(&self, mesh: &Mesh, topic: Topic) -> anyhow::Result<Arc<Swarm>> {
        self.join_with(
            mesh,
            topic,
            FullMeshTopology::with_lookup_interval(Duration::from_millis(25)),
        )
        .await
    }

    pub async fn join_with(
        &self,
        mesh: &Mesh,
        topic: Topic,
        topology: Arc<dyn Topology>,
    ) -> anyhow::Result<Arc<Swarm>> {
        let swarm = self
            .manager
            .join_swarm(SwarmOptions {
                topic,
                peer_id: self.id,
                topology,
                transport: MemoryTransportFactory::new(mesh.hub.clone()),
                timings: SwarmTimings::fast(),
            })
            .await?;
        Ok(swarm)
    }

    /// Join over the loopback transport instead of the memory transport.
    pub async fn join_loopback(&self, mesh: &Mesh, topic: Topic) -> anyhow::Result<Arc<Swarm>> {
        let swarm = self
            .manager
            .join_swarm(SwarmOptions {
                topic,
                peer_id: self.id,
                topology: FullMeshTopology::with_lookup_interval(Duration::from_millis(25)),
                transport: LoopbackTransportFactory::new(mesh.registry.clone()),
                timings: SwarmTimings::fast(),
            })
            .await?;
        Ok(swarm)
    }
}

/// Two peer ids with a known ordering, for tie-break scenarios.
pub fn ordered_peer_ids() -> (PeerId, PeerId) {
    let mut low = *PeerId::random().as_bytes();
    low[0] = 0x00;
    let mut high = *PeerId::random().as_bytes();
    high[0] = 0xff;
    (PeerId::from_bytes(low), PeerId::from_bytes(high))
}

/// Poll until `cond` holds, panicking after five seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_connected(swarm: &Swarm, peer: PeerId) {
    wait_until(&format!("{} to connect to {peer}", swarm.own_id()), || {
        swarm.connected_peers().contains(&peer)
    })
    .await;
}

pub async fn wait_no_connection(swarm: &Swarm, peer: PeerId) {
    wait_until(&format!("{} to drop {peer}", swarm.own_id()), || {
        swarm.connection(peer).is_none()
    })
    .await;
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SwarmEvent>) -> SwarmEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a swarm event")
        .expect("event channel closed")
}
