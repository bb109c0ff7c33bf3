//! lattice-swarm — per-topic swarm membership and connection management.
//!
//! Layering, leaves first:
//!
//! - [`topology`]: pure strategy deciding which peers to connect to,
//!   driven through a narrow controller capability.
//! - [`connection`] + [`transport`]: one state machine per connection
//!   attempt over a pluggable transport (memory-signaled or loopback).
//! - [`swarm`]: the connection table, candidate set, and the offer/answer
//!   race-resolution protocol for one topic.
//! - [`manager`]: topic → swarm registry, routing inbound signaling.

pub mod connection;
pub mod manager;
pub mod signaling;
pub mod swarm;
pub mod topology;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use manager::{NetworkManager, SwarmOptions};
pub use signaling::{
    MemoryBroker, MemorySignaling, OfferHandler, SignalingClient, SignalingEvent, SwarmSignaling,
};
pub use swarm::{Swarm, SwarmParams};
pub use topology::{FullMeshTopology, StarTopology, SwarmController, SwarmState, Topology};
pub use transport::{
    loopback::{LoopbackRegistry, LoopbackTransportFactory},
    memory::{MemoryHub, MemoryTransportFactory},
    Transport, TransportFactory,
};
