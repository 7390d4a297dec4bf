//! SFU core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the track-routing core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Run inbound packets through a reorder buffer before fan-out
    pub enable_reorder: bool,
    /// Minimum time a packet is held in the reorder buffer (ms)
    pub reorder_min_wait_ms: u64,
    /// Maximum time the reorder buffer holds back a packet waiting for a
    /// gap to fill (ms)
    pub reorder_max_wait_ms: u64,
    /// Minimum spacing between PLI transmissions per remote track (ms)
    pub pli_interval_ms: u64,
    /// Cadence of the per-track stats query (ms)
    pub stats_interval_ms: u64,
    /// Capacity of each client track's outbound forward queue; packets are
    /// dropped, not blocked on, when the queue is full
    pub forward_queue_size: usize,
    /// Maximum number of idle buffers retained by the packet pool
    pub pool_max_idle: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            enable_reorder: false,
            reorder_min_wait_ms: 20,
            reorder_max_wait_ms: 100,
            pli_interval_ms: 500,
            stats_interval_ms: 1000,
            forward_queue_size: 128,
            pool_max_idle: 512,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub fn reorder_min_wait(&self) -> Duration {
        Duration::from_millis(self.reorder_min_wait_ms)
    }

    #[must_use]
    pub fn reorder_max_wait(&self) -> Duration {
        Duration::from_millis(self.reorder_max_wait_ms)
    }

    #[must_use]
    pub fn pli_interval(&self) -> Duration {
        Duration::from_millis(self.pli_interval_ms)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}
