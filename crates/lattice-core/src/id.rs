//! Opaque 32-byte identifiers.
//!
//! Three id families share the same shape but are deliberately distinct
//! types so a session id can never be passed where a peer id is expected:
//!
//! - [`Topic`]     — rendezvous identifier for one swarm.
//! - [`PeerId`]    — a swarm participant. Ordered byte-lexicographically;
//!   the ordering is used as a deterministic tie-break, not for anything
//!   cryptographic.
//! - [`SessionId`] — one connection *attempt*. A replaced attempt toward
//!   the same peer always gets a fresh session id.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of every Lattice identifier.
pub const ID_LEN: usize = 32;

/// Errors from parsing a hex-encoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            /// Generate a random identifier.
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_LEN];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
                let bytes =
                    hex::decode(s).map_err(|e| IdParseError::InvalidHex(e.to_string()))?;
                let arr: [u8; ID_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdParseError::WrongLength(bytes.len()))?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Truncated hex, enough to tell ids apart in logs.
                write!(f, "{}", hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }
    };
}

id_type! {
    /// Rendezvous identifier naming a swarm.
    Topic
}

id_type! {
    /// Identifier naming a swarm participant.
    PeerId
}

id_type! {
    /// Identifier for a single connection attempt.
    SessionId
}
