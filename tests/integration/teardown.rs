//! Leaving, destroying, and failure reporting.

use std::time::Duration;

use lattice_core::{PeerId, SessionId, SignalMessage, SwarmError, Topic};

use crate::infra::{self, Mesh};

#[tokio::test]
async fn leave_withdraws_membership_and_disconnects_the_remote() {
    let mesh = Mesh::new();
    let (a, b) = (mesh.peer(), mesh.peer());
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let sb = b.join(&mesh, topic).await.unwrap();
    infra::wait_connected(&sa, b.id).await;
    infra::wait_connected(&sb, a.id).await;

    b.manager.leave_swarm(topic).await.unwrap();

    infra::wait_no_connection(&sa, b.id).await;
    assert_eq!(mesh.broker.members(topic), vec![a.id]);
    assert!(b.manager.topics().is_empty());
}

#[tokio::test]
async fn manager_destroy_tears_everything_down() {
    let mesh = Mesh::new();
    let (a, b) = (mesh.peer(), mesh.peer());
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let sb = b.join(&mesh, topic).await.unwrap();
    infra::wait_connected(&sa, b.id).await;
    infra::wait_connected(&sb, a.id).await;

    a.manager.destroy().await.unwrap();

    infra::wait_no_connection(&sb, a.id).await;
    assert_eq!(mesh.broker.members(topic), vec![b.id]);

    let err = a.join(&mesh, Topic::random()).await.unwrap_err();
    assert_eq!(
        err.downcast::<SwarmError>().unwrap(),
        SwarmError::Destroyed
    );
}

#[tokio::test]
async fn offer_to_an_unreachable_peer_reports_to_the_error_sink() {
    let mesh = Mesh::new();
    let mut a = mesh.peer();
    let topic = Topic::random();

    let sa = a.join(&mesh, topic).await.unwrap();
    let ghost = PeerId::random();

    sa.connect_to_peer(ghost).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), a.errors.recv())
        .await
        .expect("no error reported")
        .expect("error channel closed");
    assert!(matches!(err, SwarmError::Signaling(_)));
    assert!(sa.connection(ghost).is_none());
}

#[tokio::test]
async fn offer_from_an_undiscovered_peer_times_out() {
    let mesh = Mesh::new();
    let a = mesh.peer();
    let topic = Topic::random();
    a.join(&mesh, topic).await.unwrap();

    // A peer that never registered for the topic offers directly.
    let stranger = PeerId::random();
    let err = mesh
        .broker
        .route_offer(SignalMessage {
            id: stranger,
            remote_id: a.id,
            session_id: SessionId::random(),
            topic,
            data: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    assert_eq!(err, SwarmError::DiscoveryTimeout { peer: stranger });
}
