//! Session snapshot persistence
//!
//! Snapshots are saved on track start, periodically while playing, and at
//! shutdown, so a process restart can offer to restore sessions. Restoring
//! never auto-resumes playback: the registry re-validates the node binding
//! and voice connection first and leaves the queue parked.

use crate::error::Result;
use crate::platform::ChannelId;
use crate::RoomId;
use async_trait::async_trait;
use cadenza_common::events::LoopMode;
use cadenza_common::{ResolvedTrack, Track};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

/// Serialized state of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub room: RoomId,
    pub voice_channel: ChannelId,
    pub text_channel: Option<ChannelId>,
    pub owner: Option<u64>,
    pub current: Option<ResolvedTrack>,
    /// Derived position at save time; resume offset after a restore
    pub position_ms: u64,
    pub queue: Vec<Track>,
    /// Most-recent-first, as `PlayQueue::history` iterates
    pub history: Vec<Track>,
    pub loop_mode: LoopMode,
    pub autoplay: bool,
    pub persistent: bool,
    pub volume: u16,
    pub skin: String,
    pub node_id: String,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Persistence collaborator for session snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
    async fn load(&self, room: RoomId) -> Result<Option<SessionSnapshot>>;
    async fn delete(&self, room: RoomId) -> Result<()>;
    /// Rooms with a stored snapshot, for restore-at-startup
    async fn list_rooms(&self) -> Result<Vec<RoomId>>;
}

/// SQLite-backed snapshot store; one JSON blob per room
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_snapshots (
                room INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Snapshot store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO session_snapshots (room, data, saved_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(room) DO UPDATE SET data = excluded.data, saved_at = excluded.saved_at
            "#,
        )
        .bind(snapshot.room as i64)
        .bind(data)
        .bind(snapshot.saved_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, room: RoomId) -> Result<Option<SessionSnapshot>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM session_snapshots WHERE room = ?1")
                .bind(room as i64)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, room: RoomId) -> Result<()> {
        sqlx::query("DELETE FROM session_snapshots WHERE room = ?1")
            .bind(room as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomId>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT room FROM session_snapshots")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(room,)| room as RoomId).collect())
    }
}
