//! Lattice integration suite.
//!
//! Every test builds its own in-process mesh: a private signaling broker
//! plus private transport fabrics, with one `NetworkManager` per simulated
//! peer. Nothing is shared between tests, so the suite runs fully in
//! parallel.

mod infra;

mod races;
mod sessions;
mod teardown;
