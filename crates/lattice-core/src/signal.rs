//! Signaling message shapes.
//!
//! A [`SignalMessage`] is used both for offers (asking a remote peer to
//! open a connection) and for mid-negotiation payloads once a connection
//! attempt exists. The `data` field is opaque to the swarm layer; only the
//! transport behind the connection interprets it.

use serde::{Deserialize, Serialize};

use crate::id::{PeerId, SessionId, Topic};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Sending peer.
    pub id: PeerId,
    /// Receiving peer.
    pub remote_id: PeerId,
    /// The connection attempt this message belongs to.
    pub session_id: SessionId,
    pub topic: Topic,
    /// Opaque negotiation payload.
    pub data: serde_json::Value,
}

/// Reply to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub accept: bool,
}

impl Answer {
    pub const ACCEPT: Answer = Answer { accept: true };
    pub const REJECT: Answer = Answer { accept: false };
}
