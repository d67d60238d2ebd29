//! Latency probing between stable members.

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::hash_ring::ActiveSet;

/// Larger values make the latency estimate change more slowly.
pub const LATENCY_DECAY_DIVISOR: i64 = 100;

/// Picks heartbeat targets and folds echo timings into latency estimates.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    decay_divisor: i64,
    rng: StdRng,
}

impl HeartbeatMonitor {
    pub fn new(decay_divisor: i64) -> Self {
        Self {
            decay_divisor: decay_divisor.max(1),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn seeded(decay_divisor: i64, seed: u64) -> Self {
        Self {
            decay_divisor,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A uniformly random active member, or `None` when the set is empty.
    ///
    /// The caller skips the heartbeat when the pick is the local member.
    pub fn pick(&mut self, active: &ActiveSet) -> Option<String> {
        active.members().choose(&mut self.rng).cloned()
    }

    /// New latency estimate after an echo that took `elapsed` microseconds.
    pub fn fold(&self, latency: i64, elapsed: i64) -> i64 {
        decay_latency(latency, elapsed, self.decay_divisor)
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(LATENCY_DECAY_DIVISOR)
    }
}

pub fn decay_latency(latency: i64, elapsed: i64, divisor: i64) -> i64 {
    latency + ((elapsed - latency) as f64 / divisor as f64).round() as i64
}
