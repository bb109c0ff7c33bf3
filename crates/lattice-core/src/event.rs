//! Host-facing notifications.
//!
//! The swarm pushes membership changes onto a plain mpsc channel instead of
//! exposing an event-emitter object; the host owns the receiving end and
//! polls it however it likes. Each terminal transition fires at most once
//! per connection attempt.

use tokio::sync::mpsc;

use crate::error::SwarmError;
use crate::id::{PeerId, SessionId, Topic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A connection to `peer` reached the connected state.
    PeerConnected {
        topic: Topic,
        peer: PeerId,
        session: SessionId,
    },
    /// A previously-connected peer went away.
    PeerDisconnected {
        topic: Topic,
        peer: PeerId,
        session: SessionId,
    },
}

/// Destination for failures of fire-and-forget background work (offer
/// sends, connection closes). Never blocks and never panics: if the host
/// dropped the receiver, or no sink was installed, the error is logged
/// instead.
#[derive(Clone)]
pub struct ErrorSink {
    tx: Option<mpsc::UnboundedSender<SwarmError>>,
}

impl ErrorSink {
    pub fn new(tx: mpsc::UnboundedSender<SwarmError>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that only logs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, err: SwarmError) {
        match &self.tx {
            Some(tx) => {
                if tx.send(err.clone()).is_err() {
                    tracing::warn!(error = %err, "background failure (error sink closed)");
                }
            }
            None => tracing::warn!(error = %err, "background failure"),
        }
    }
}
