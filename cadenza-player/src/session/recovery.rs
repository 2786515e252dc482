//! Error classification and recovery policy
//!
//! Pure decision logic: `classify` maps a raised track error to an error
//! class, `decide` maps (class, per-class attempt counters) to a recovery
//! action. The orchestrator executes the action; nothing here performs I/O.
//!
//! Counters have a fixed shape, initialized at session creation, and reset
//! whenever the bound node changes or after a quiet period with no errors.

use cadenza_common::PlayerParams;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Severity reported by the rendering node alongside a track error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The track itself failed; the node is fine
    #[default]
    Common,
    /// Cause is unclear; may be environmental
    Suspicious,
    /// The node misbehaved
    Fault,
}

/// Error event raised by a rendering node for the current track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackError {
    /// Human-readable message
    pub message: String,
    /// Raw cause string from the node
    pub cause: String,
    pub severity: Severity,
}

/// Recovery-relevant class of a track error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeouts, unreachable hosts: retry from position, then rotate
    Network,
    /// Blocked or throttled: short local retries, then rotate away
    RateLimited,
    /// The media itself is unavailable or unsupported: skip
    Unplayable,
    /// Decoder failures and stuck playback: one reposition retry, then skip
    Decode,
    /// No retry can fix this; surface to the owner and close
    Fatal,
}

/// Action chosen by the recovery policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Same node, same track, after the cooldown; optionally resuming from
    /// the last known position instead of zero
    Retry {
        cooldown: Duration,
        resume_position: bool,
    },
    /// Mark the bound node degraded for this class and migrate
    RotateNode,
    /// Push to the failed ring and advance
    Skip,
    /// Clean up and close the session
    Fatal,
}

/// What to do about a TransportClosed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAction {
    /// Benign close, nothing user-visible
    Ignore,
    /// The voice session went stale; re-issue the voice connection
    ReconnectVoice,
    /// Transport problems beyond the voice session: move off this node
    RotateNode,
}

/// Map a raised track error to its class.
///
/// Cause categories are checked in a fixed order — fatal, network,
/// rate-limit, unplayable, decode — so a cause matching two categories
/// takes the earlier one. Unmatched causes fall back on severity: a
/// common-severity error indicts the track, anything else is treated as
/// environmental and retried.
pub fn classify(error: &TrackError) -> ErrorClass {
    let cause = error.cause.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| cause.contains(p));

    if matches(&["authorization revoked", "access revoked", "account terminated"]) {
        return ErrorClass::Fatal;
    }
    if matches(&[
        "timed out",
        "timeout",
        "unreachable",
        "unknown host",
        "connection reset",
        "connection refused",
    ]) {
        return ErrorClass::Network;
    }
    if matches(&[
        "429",
        "rate limit",
        "too many requests",
        "blocked by",
        "not success status code: 403",
    ]) {
        return ErrorClass::RateLimited;
    }
    if matches(&[
        "not available",
        "unavailable",
        "not supported",
        "unsupported",
        "not found",
        "private",
        "region",
    ]) {
        return ErrorClass::Unplayable;
    }
    if matches(&[
        "decod",
        "position is beyond",
        "invalid bitrate",
        "corrupt",
        "read error",
    ]) {
        return ErrorClass::Decode;
    }

    match error.severity {
        Severity::Common => ErrorClass::Unplayable,
        Severity::Suspicious | Severity::Fault => ErrorClass::Network,
    }
}

/// Classify a transport close code.
///
/// 1000 is a clean close. The 4005/4006/4009 group means the voice session
/// is no longer valid and a reconnect fixes it. Everything else is treated
/// as node trouble.
pub fn classify_transport(code: u16) -> TransportAction {
    match code {
        1000 => TransportAction::Ignore,
        4005 | 4006 | 4009 => TransportAction::ReconnectVoice,
        _ => TransportAction::RotateNode,
    }
}

/// Attempt counter for one error class
#[derive(Debug, Clone, Default)]
struct ClassCounter {
    attempts: u32,
}

/// Fixed-shape per-class retry state for one session.
///
/// `node_id` records which node the counters apply to; binding a different
/// node resets everything.
#[derive(Debug)]
pub struct RetryCounters {
    node_id: String,
    last_error: Option<Instant>,
    network: ClassCounter,
    rate_limited: ClassCounter,
    decode: ClassCounter,
}

impl RetryCounters {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            last_error: None,
            network: ClassCounter::default(),
            rate_limited: ClassCounter::default(),
            decode: ClassCounter::default(),
        }
    }

    /// Reset all counters when the bound node changes
    pub fn bind_node(&mut self, node_id: &str) {
        if self.node_id != node_id {
            self.node_id = node_id.to_string();
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.last_error = None;
        self.network = ClassCounter::default();
        self.rate_limited = ClassCounter::default();
        self.decode = ClassCounter::default();
    }

}

/// Decide the recovery action for one error occurrence.
///
/// Counts the occurrence against the class counter first, so with a
/// max-attempts of 3 the fourth occurrence inside the quiet window
/// escalates instead of retrying a fourth time.
pub fn decide(
    class: ErrorClass,
    counters: &mut RetryCounters,
    params: &PlayerParams,
    now: Instant,
) -> RecoveryAction {
    // Quiet period with no errors resets the counters
    if let Some(last) = counters.last_error {
        if now.duration_since(last) > params.retry_quiet_period() {
            counters.reset();
        }
    }
    counters.last_error = Some(now);

    match class {
        ErrorClass::Unplayable => RecoveryAction::Skip,
        ErrorClass::Fatal => RecoveryAction::Fatal,
        ErrorClass::Network | ErrorClass::RateLimited | ErrorClass::Decode => {
            let (max_attempts, resume_position, exhausted, counter) = match class {
                ErrorClass::Network => (
                    params.network_max_attempts,
                    true,
                    RecoveryAction::RotateNode,
                    &mut counters.network,
                ),
                ErrorClass::RateLimited => (
                    params.rate_limit_max_attempts,
                    false,
                    RecoveryAction::RotateNode,
                    &mut counters.rate_limited,
                ),
                _ => (
                    params.decode_max_attempts,
                    true,
                    RecoveryAction::Skip,
                    &mut counters.decode,
                ),
            };

            counter.attempts += 1;
            let attempt = counter.attempts;

            if attempt <= max_attempts {
                RecoveryAction::Retry {
                    cooldown: params.retry_cooldown(attempt - 1),
                    resume_position,
                }
            } else {
                counter.attempts = 0;
                exhausted
            }
        }
    }
}
