//! lattice-core — shared identifiers, signaling messages, events, and errors.
//! All other Lattice crates depend on this one.

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod signal;

pub use config::SwarmTimings;
pub use error::SwarmError;
pub use event::{ErrorSink, SwarmEvent};
pub use id::{PeerId, SessionId, Topic};
pub use signal::{Answer, SignalMessage};
