//! Error taxonomy for the swarm core.
//!
//! Errors scoped to a single connection attempt stay contained to that
//! attempt; errors indicating the swarm's governing strategy is broken
//! (`Topology`) are fatal to the whole swarm.

use crate::id::{PeerId, Topic};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwarmError {
    /// The offering peer never appeared in the candidate set within the
    /// discovery timeout. The specific offer is abandoned.
    #[error("peer {peer} not discovered within the timeout")]
    DiscoveryTimeout { peer: PeerId },

    #[error("already joined topic {topic}")]
    TopicAlreadyJoined { topic: Topic },

    /// A signaling round trip failed. The operation it carried is lost;
    /// retry is the topology's responsibility.
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// The topology strategy failed to shut down. Fatal to the swarm.
    #[error("topology failure: {0}")]
    Topology(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("connection already closed")]
    ConnectionClosed,

    #[error("connection is not established")]
    NotConnected,

    #[error("swarm destroyed")]
    Destroyed,
}
