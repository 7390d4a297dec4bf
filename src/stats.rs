//! Per-track statistics and network-condition derivation
//!
//! The stats themselves come from an injected getter (the transport layer
//! owns RTCP accounting); this module only defines the shapes and the
//! translation from degraded metrics into a coarse network condition that
//! drives adaptive-quality decisions upstream.

use serde::{Deserialize, Serialize};

/// Receiver-side statistics for one inbound RTP encoding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteTrackStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: i64,
    /// Interarrival jitter in clock-rate units
    pub jitter: f64,
    /// Fraction of packets lost over the last reporting window (0.0 - 1.0)
    pub fraction_lost: f32,
}

/// Coarse network condition derived from receive statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkCondition {
    /// Loss below 10%, nothing to act on
    Good,
    /// Loss between 10% and 20%, quality reduction advised
    Degraded,
    /// Loss above 20%, the encoding is barely usable
    Critical,
}

/// Translate a stats sample into a network condition
#[must_use]
pub fn condition_for(stats: &RemoteTrackStats) -> NetworkCondition {
    if stats.fraction_lost > 0.20 {
        NetworkCondition::Critical
    } else if stats.fraction_lost > 0.10 {
        NetworkCondition::Degraded
    } else {
        NetworkCondition::Good
    }
}
