//! Presence event types for the Cadenza event system
//!
//! Presence updates are pushed to passive observers on every state-affecting
//! transition and on a low-frequency heartbeat while playing. The three
//! variants carry deliberately distinct field sets: an idle session has no
//! track to describe, a closed session has nothing left but the reason.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Loop behavior applied when the current track completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Off,
    /// Reinsert the finished track at the queue head
    Track,
    /// Reinsert the finished track at the queue tail
    Queue,
}

/// Observable playback phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Idle,
    Resolving,
    Playing,
    Paused,
    /// Paused because the voice channel emptied, distinct from user pause
    AutoPaused,
    Closing,
}

/// Current-track description included in playing updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayingTrackInfo {
    pub request_id: Uuid,
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    pub source: String,
    pub thumbnail: Option<String>,
    pub duration_ms: u64,
    pub is_stream: bool,
    pub autoplay: bool,
    pub requested_by: Option<u64>,
    pub playlist_name: Option<String>,
}

/// Presence update pushed to subscribed observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceUpdate {
    /// Session exists but nothing is queued or playing
    Idle {
        room: u64,
        /// When the idle timeout will tear the session down, if armed
        idle_deadline: Option<chrono::DateTime<chrono::Utc>>,
        autoplay: bool,
        persistent: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track is bound (playing, paused, or auto-paused)
    Playing {
        room: u64,
        phase: PlaybackPhase,
        track: PlayingTrackInfo,
        position_ms: u64,
        paused: bool,
        queue_len: usize,
        loop_mode: LoopMode,
        autoplay: bool,
        persistent: bool,
        volume: u16,
        node: String,
        node_ping_ms: Option<u32>,
        /// Transient status line shown to users, if any
        status_line: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session destroyed; final update on the stream
    Closed {
        room: u64,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PresenceUpdate {
    pub fn room(&self) -> u64 {
        match self {
            PresenceUpdate::Idle { room, .. } => *room,
            PresenceUpdate::Playing { room, .. } => *room,
            PresenceUpdate::Closed { room, .. } => *room,
        }
    }

    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PresenceUpdate::Idle { .. } => "Idle",
            PresenceUpdate::Playing { .. } => "Playing",
            PresenceUpdate::Closed { .. } => "Closed",
        }
    }
}
