//! Tunable player parameters
//!
//! Every timing and capacity knob the orchestrator consults lives here with
//! its default, so deployments override individual values from the config
//! file without the orchestrator reaching into ad hoc constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime parameters for session orchestration.
///
/// All durations are in seconds or milliseconds as named; accessors convert
/// to `Duration` where call sites want one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerParams {
    /// Recently-played ring capacity (autoplay seeding and "back")
    pub history_capacity: usize,

    /// Precomputed autoplay candidate ring capacity
    pub autoplay_capacity: usize,

    /// Failed-track diagnostic ring capacity
    pub failed_capacity: usize,

    /// Seconds an empty, autoplay-less session survives before teardown
    pub idle_timeout_secs: u64,

    /// Seconds to wait after the voice channel empties before acting
    pub members_timeout_secs: u64,

    /// Minimum duration for a history entry to seed recommendations
    pub autoplay_min_seed_ms: u64,

    /// How many history entries seed one recommendation call
    pub autoplay_seed_count: usize,

    /// Attempts against the recommendation collaborator before giving up
    pub autoplay_recommend_attempts: u32,

    /// Seconds between recommendation attempts
    pub autoplay_recommend_backoff_secs: u64,

    /// Local attempts per network-class error before rotating nodes
    pub network_max_attempts: u32,

    /// Local attempts per rate-limit-class error before rotating nodes
    pub rate_limit_max_attempts: u32,

    /// Reposition retries per decode/stuck-class error before skipping
    pub decode_max_attempts: u32,

    /// Base cooldown in seconds for retry backoff
    pub retry_cooldown_base_secs: u64,

    /// Backoff cap as a power-of-two exponent over the base
    pub retry_cooldown_max_exp: u32,

    /// Seconds without errors after which per-class counters reset
    pub retry_quiet_period_secs: u64,

    /// Cooldown after a resolution failure before pulling the next entry
    pub resolve_failure_cooldown_secs: u64,

    /// Poll interval while waiting for any rendering node to come back
    pub node_wait_interval_secs: u64,

    /// Timeout for search/play/control requests against a node
    pub node_request_timeout_secs: u64,

    /// Presence heartbeat interval while playing
    pub presence_heartbeat_secs: u64,

    /// Extra slack past the expected track end before the watchdog steps in
    pub watchdog_slack_secs: u64,

    /// Interval between periodic session snapshot saves
    pub snapshot_interval_secs: u64,

    /// Initial volume for new sessions (percent)
    pub default_volume: u16,
}

impl Default for PlayerParams {
    fn default() -> Self {
        Self {
            history_capacity: 20,
            autoplay_capacity: 30,
            failed_capacity: 30,
            idle_timeout_secs: 180,
            members_timeout_secs: 10,
            autoplay_min_seed_ms: 90_000,
            autoplay_seed_count: 5,
            autoplay_recommend_attempts: 3,
            autoplay_recommend_backoff_secs: 5,
            network_max_attempts: 3,
            rate_limit_max_attempts: 3,
            decode_max_attempts: 1,
            retry_cooldown_base_secs: 4,
            retry_cooldown_max_exp: 4,
            retry_quiet_period_secs: 180,
            resolve_failure_cooldown_secs: 10,
            node_wait_interval_secs: 5,
            node_request_timeout_secs: 15,
            presence_heartbeat_secs: 30,
            watchdog_slack_secs: 5,
            snapshot_interval_secs: 60,
            default_volume: 100,
        }
    }
}

impl PlayerParams {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn members_timeout(&self) -> Duration {
        Duration::from_secs(self.members_timeout_secs)
    }

    pub fn retry_quiet_period(&self) -> Duration {
        Duration::from_secs(self.retry_quiet_period_secs)
    }

    pub fn resolve_failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.resolve_failure_cooldown_secs)
    }

    pub fn node_wait_interval(&self) -> Duration {
        Duration::from_secs(self.node_wait_interval_secs)
    }

    pub fn node_request_timeout(&self) -> Duration {
        Duration::from_secs(self.node_request_timeout_secs)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Truncated exponential backoff: `base * 2^attempt`, capped at
    /// `base * 2^retry_cooldown_max_exp`.
    pub fn retry_cooldown(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.retry_cooldown_max_exp);
        Duration::from_secs(self.retry_cooldown_base_secs.saturating_mul(1u64 << exp))
    }
}
