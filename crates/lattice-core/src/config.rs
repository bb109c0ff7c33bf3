//! Swarm timing configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for the offer-handling discovery wait.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmTimings {
    /// How often a pending offer re-triggers a signaling lookup while
    /// waiting for the offering peer to show up in the candidate set.
    pub lookup_interval: Duration,
    /// Overall bound on that wait. Exceeding it abandons the offer.
    pub discovery_timeout: Duration,
}

impl Default for SwarmTimings {
    fn default() -> Self {
        Self {
            lookup_interval: Duration::from_secs(1),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl SwarmTimings {
    /// Compressed timings so tests hit the timeout path quickly.
    pub fn fast() -> Self {
        Self {
            lookup_interval: Duration::from_millis(20),
            discovery_timeout: Duration::from_millis(250),
        }
    }
}
