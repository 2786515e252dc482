//! Chat-platform client abstraction
//!
//! The orchestrator needs a handful of calls against the chat platform:
//! transient status messages, voice-channel join/leave, a census of
//! eligible listeners, and the voice-channel status label. Everything else
//! about the platform (commands, permissions, rendering) lives outside this
//! service.

use crate::error::Result;
use crate::RoomId;
use async_trait::async_trait;
use tracing::{debug, info};

/// Channel identifier on the chat platform
pub type ChannelId = u64;

/// Minimal chat-platform surface consumed by sessions
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post a transient status line to the session's text channel
    async fn send_status(&self, channel: ChannelId, text: &str) -> Result<()>;

    async fn join_voice(&self, room: RoomId, channel: ChannelId) -> Result<()>;

    async fn leave_voice(&self, room: RoomId) -> Result<()>;

    /// Count of eligible listeners (non-bot, non-deafened) in a channel
    async fn eligible_listeners(&self, channel: ChannelId) -> Result<usize>;

    /// Set or clear the voice channel's status label
    async fn set_voice_status(&self, channel: ChannelId, status: Option<&str>) -> Result<()>;
}

/// Platform stand-in for headless operation: every call is logged and
/// succeeds. Listener counts report one listener so sessions never
/// auto-pause under it.
#[derive(Debug, Default)]
pub struct LoggingPlatform;

#[async_trait]
impl ChatPlatform for LoggingPlatform {
    async fn send_status(&self, channel: ChannelId, text: &str) -> Result<()> {
        info!(channel, text, "status message");
        Ok(())
    }

    async fn join_voice(&self, room: RoomId, channel: ChannelId) -> Result<()> {
        info!(room, channel, "join voice");
        Ok(())
    }

    async fn leave_voice(&self, room: RoomId) -> Result<()> {
        info!(room, "leave voice");
        Ok(())
    }

    async fn eligible_listeners(&self, channel: ChannelId) -> Result<usize> {
        debug!(channel, "listener census");
        Ok(1)
    }

    async fn set_voice_status(&self, channel: ChannelId, status: Option<&str>) -> Result<()> {
        debug!(channel, ?status, "voice status");
        Ok(())
    }
}
