use rand::Rng;
use std::time::Duration;
use tokio::time::{interval, Interval};

use crate::config::TimingConfig;

/// Generates a random election timeout in `[min, 2 * min)`.
///
/// The jitter keeps peers from timing out in lockstep and splitting votes
/// forever.
pub fn random_election_timeout(config: &TimingConfig) -> Duration {
    let min = config.min_election_timeout_ms;
    let max = config.max_election_timeout_ms();
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min..max))
}

/// Creates the leader's heartbeat ticker. The first tick completes
/// immediately, so a fresh leader asserts itself without delay.
pub fn heartbeat_interval(config: &TimingConfig) -> Interval {
    interval(config.broadcast_interval())
}
