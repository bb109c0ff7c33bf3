//! Session identity across reconnects and stale traffic.

use std::time::Duration;

use lattice_core::{SessionId, SignalMessage, SwarmEvent, Topic};
use lattice_swarm::ConnectionState;

use crate::infra::{self, Mesh};

#[tokio::test]
async fn reconnect_gets_a_fresh_session() {
    let mesh = Mesh::new();
    let (a, b) = (mesh.peer(), mesh.peer());
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let sb = b.join(&mesh, topic).await.unwrap();
    infra::wait_connected(&sa, b.id).await;
    infra::wait_connected(&sb, a.id).await;
    let before = sa.connection(b.id).unwrap().session_id();

    sa.disconnect_from_peer(b.id);

    // The full-mesh topology re-originates on its own; the replacement
    // attempt must carry a new session id.
    infra::wait_until("reconnect with a fresh session", || {
        sa.connection(b.id).map_or(false, |c| {
            c.session_id() != before && c.state() == ConnectionState::Connected
        })
    })
    .await;
    infra::wait_connected(&sb, a.id).await;
}

#[tokio::test]
async fn stale_session_signals_are_ignored() {
    let mesh = Mesh::new();
    let (a, b) = (mesh.peer(), mesh.peer());
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let sb = b.join(&mesh, topic).await.unwrap();
    infra::wait_connected(&sa, b.id).await;
    infra::wait_connected(&sb, a.id).await;
    let session = sb.connection(a.id).unwrap().session_id();

    // A leftover payload from a replaced attempt must not disturb the
    // live connection.
    mesh.broker
        .route_signal(SignalMessage {
            id: a.id,
            remote_id: b.id,
            session_id: SessionId::random(),
            topic,
            data: serde_json::json!({ "type": "answer" }),
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let conn = sb.connection(a.id).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.session_id(), session);
}

#[tokio::test]
async fn disconnect_event_carries_the_live_session() {
    let mesh = Mesh::new();
    let (mut a, b) = (mesh.peer(), mesh.peer());
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let sb = b.join(&mesh, topic).await.unwrap();

    infra::wait_until("both sides to agree on one session", || {
        match (sa.connection(b.id), sb.connection(a.id)) {
            (Some(x), Some(y)) => {
                x.session_id() == y.session_id() && sa.connected_peers().contains(&b.id)
            }
            _ => false,
        }
    })
    .await;
    let session = sa.connection(b.id).unwrap().session_id();
    while a.events.try_recv().is_ok() {}

    b.manager.leave_swarm(topic).await.unwrap();

    loop {
        match infra::next_event(&mut a.events).await {
            SwarmEvent::PeerDisconnected {
                topic: t,
                peer,
                session: s,
            } => {
                assert_eq!(t, topic);
                assert_eq!(peer, b.id);
                assert_eq!(s, session);
                break;
            }
            SwarmEvent::PeerConnected { .. } => continue,
        }
    }
}
