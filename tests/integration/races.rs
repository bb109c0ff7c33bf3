//! Simultaneous-origination races.
//!
//! The deterministic test wires two swarms directly with a gated
//! signaling link, so both originations exist before either offer is
//! delivered. The manager-level test repeats concurrent joins and checks
//! that convergence never depends on scheduling luck.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use lattice_core::{
    Answer, ErrorSink, PeerId, SignalMessage, SwarmError, SwarmEvent, SwarmTimings, Topic,
};
use lattice_swarm::{
    MemoryHub, MemoryTransportFactory, Swarm, SwarmController, SwarmParams, SwarmSignaling,
    Topology,
};

use crate::infra::{self, Mesh};

/// Admits every offer, never originates; the test drives connections.
struct ManualTopology;

impl Topology for ManualTopology {
    fn init(&self, _controller: Arc<dyn SwarmController>) {}
    fn update(&self) {}
    fn on_offer(&self, _peer: PeerId) -> bool {
        true
    }
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Point-to-point signaling that parks offers at a gate until released.
/// Mid-negotiation signals pass straight through.
struct GatedLink {
    target: Mutex<Option<Arc<Swarm>>>,
    gate: watch::Receiver<bool>,
}

impl GatedLink {
    fn new(gate: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(None),
            gate,
        })
    }

    fn bind(&self, swarm: Arc<Swarm>) {
        *self.target.lock().unwrap() = Some(swarm);
    }

    fn target(&self) -> Option<Arc<Swarm>> {
        self.target.lock().unwrap().clone()
    }
}

impl SwarmSignaling for GatedLink {
    fn offer(&self, msg: SignalMessage) -> BoxFuture<'static, Result<Answer, SwarmError>> {
        let target = self.target();
        let mut gate = self.gate.clone();
        Box::pin(async move {
            while !*gate.borrow() {
                gate.changed()
                    .await
                    .map_err(|_| SwarmError::Signaling("gate dropped".into()))?;
            }
            match target {
                Some(swarm) => swarm.on_offer(msg).await,
                None => Err(SwarmError::Signaling("link not bound".into())),
            }
        })
    }

    fn signal(&self, msg: SignalMessage) -> BoxFuture<'static, Result<(), SwarmError>> {
        let target = self.target();
        Box::pin(async move {
            match target {
                Some(swarm) => {
                    swarm.on_signal(&msg);
                    Ok(())
                }
                None => Err(SwarmError::Signaling("link not bound".into())),
            }
        })
    }

    fn lookup(&self) {}
}

fn gated_swarm(
    topic: Topic,
    id: PeerId,
    hub: &Arc<MemoryHub>,
    gate: watch::Receiver<bool>,
) -> (Arc<Swarm>, Arc<GatedLink>) {
    let link = GatedLink::new(gate);
    let (events_tx, _events) = mpsc::unbounded_channel::<SwarmEvent>();
    let swarm = Swarm::new(SwarmParams {
        topic,
        own_id: id,
        topology: Arc::new(ManualTopology),
        signaling: link.clone(),
        transport: MemoryTransportFactory::new(hub.clone()),
        timings: SwarmTimings::fast(),
        events: events_tx,
        errors: ErrorSink::disabled(),
    });
    (swarm, link)
}

#[tokio::test]
async fn simultaneous_origination_keeps_the_lower_ids_session() {
    infra::init_tracing();
    let hub = MemoryHub::new();
    let topic = Topic::random();
    let (low_id, high_id) = infra::ordered_peer_ids();
    let (gate_tx, gate_rx) = watch::channel(false);

    let (low, low_link) = gated_swarm(topic, low_id, &hub, gate_rx.clone());
    let (high, high_link) = gated_swarm(topic, high_id, &hub, gate_rx);
    low_link.bind(high.clone());
    high_link.bind(low.clone());

    low.on_peer_candidates_changed(vec![high_id]);
    high.on_peer_candidates_changed(vec![low_id]);

    let (l, h) = (low.clone(), high.clone());
    let from_low = tokio::spawn(async move { l.connect_to_peer(high_id).await });
    let from_high = tokio::spawn(async move { h.connect_to_peer(low_id).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Both attempts exist before either offer is delivered.
    let winning = low.connection(high_id).expect("low originated").session_id();
    let losing = high.connection(low_id).expect("high originated").session_id();
    assert_ne!(winning, losing);

    gate_tx.send(true).unwrap();
    from_low.await.unwrap().unwrap();
    from_high.await.unwrap().unwrap();

    infra::wait_connected(&low, high_id).await;
    infra::wait_connected(&high, low_id).await;

    let low_conn = low.connection(high_id).unwrap();
    let high_conn = high.connection(low_id).unwrap();
    assert_eq!(
        low_conn.session_id(),
        winning,
        "the lower id's origination survives"
    );
    assert_eq!(
        high_conn.session_id(),
        winning,
        "both sides settle on the same session"
    );
    assert!(low_conn.is_initiator());
    assert!(!high_conn.is_initiator());

    low.destroy().await.unwrap();
    high.destroy().await.unwrap();
}

#[tokio::test]
async fn concurrent_joins_always_converge_to_one_connection() {
    for _ in 0..5 {
        let mesh = Mesh::new();
        let (a, b) = (mesh.peer(), mesh.peer());
        let topic = Topic::random();

        let (sa, sb) = tokio::join!(a.join(&mesh, topic), b.join(&mesh, topic));
        let (sa, sb) = (sa.unwrap(), sb.unwrap());

        infra::wait_until("both sides to agree on one session", || {
            match (sa.connection(b.id), sb.connection(a.id)) {
                (Some(x), Some(y)) => {
                    x.session_id() == y.session_id()
                        && sa.connected_peers().contains(&b.id)
                        && sb.connected_peers().contains(&a.id)
                }
                _ => false,
            }
        })
        .await;

        let ca = sa.connection(b.id).unwrap();
        let cb = sb.connection(a.id).unwrap();
        assert!(ca.is_initiator() != cb.is_initiator());
        assert_eq!(sa.connection_count(), 1);
        assert_eq!(sb.connection_count(), 1);
    }
}
