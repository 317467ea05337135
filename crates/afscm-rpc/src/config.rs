use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for connection pooling, probing and replica ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Port file servers listen on.
    pub fs_port: u16,
    /// Connections allocated at once when the freelist runs dry.
    pub conn_batch: usize,
    /// RTT assumed for a host that has never answered.
    pub initial_rtt_us: u64,
    /// Upper bound (exclusive) of the random jitter added to each RTT.
    pub rtt_jitter_us: u64,
    /// Added to the RTT of a connection known to be dead.
    pub dead_penalty_us: u64,
    /// Added to the RTT of a replica flagged unreliable.
    pub unreliable_penalty_us: u64,
    /// Retries of the same replica while it reports busy.
    pub busy_retries: u32,
    pub busy_retry_delay_ms: u64,
    /// First probe delay for a dead host; doubled after every failed probe.
    pub probe_interval_secs: u64,
    pub probe_max_interval_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            fs_port: 7000,
            conn_batch: 16,
            initial_rtt_us: 100_000,
            rtt_jitter_us: 5_000,
            dead_penalty_us: 1_000_000_000,
            unreliable_penalty_us: 100_000_000,
            busy_retries: 5,
            busy_retry_delay_ms: 1_000,
            probe_interval_secs: 10,
            probe_max_interval_secs: 600,
        }
    }
}

impl RpcConfig {
    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_max_interval(&self) -> Duration {
        Duration::from_secs(self.probe_max_interval_secs)
    }

    /// Delay before the next probe after one more failure. Never below the
    /// first interval nor above the cap.
    pub fn next_probe_backoff(&self, current: Duration) -> Duration {
        let floor = self.probe_interval();
        let cap = self.probe_max_interval().max(floor);
        current.saturating_mul(2).clamp(floor, cap)
    }
}
