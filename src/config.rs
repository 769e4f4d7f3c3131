use std::time::Duration;

/// Timing configuration for a single server.
///
/// Only the minimum election timeout is tunable. The maximum election
/// timeout and the heartbeat broadcast interval are derived from it so that
/// broadcast interval << election timeout always holds.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum election timeout in ms (default: 250)
    pub min_election_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_election_timeout_ms: 250,
        }
    }
}

impl TimingConfig {
    pub fn new(min_election_timeout_ms: u64) -> Self {
        Self {
            min_election_timeout_ms,
        }
    }

    /// Upper bound of the randomized election timeout: twice the minimum.
    pub fn max_election_timeout_ms(&self) -> u64 {
        self.min_election_timeout_ms * 2
    }

    /// Interval between leader heartbeats: one tenth of the minimum election
    /// timeout, never below 1ms.
    pub fn broadcast_interval_ms(&self) -> u64 {
        (self.min_election_timeout_ms / 10).max(1)
    }

    pub fn min_election_timeout(&self) -> Duration {
        Duration::from_millis(self.min_election_timeout_ms)
    }

    pub fn max_election_timeout(&self) -> Duration {
        Duration::from_millis(self.max_election_timeout_ms())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms())
    }
}
