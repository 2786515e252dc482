//! Session registry
//!
//! The one place sessions are created, looked up, and removed. Passed by
//! reference to whatever needs lookup — there is no process-wide registry.
//! Teardown ordering at shutdown: snapshots are flushed first, then every
//! session is destroyed (keeping its snapshot for the next start).

use crate::error::{Error, Result};
use crate::node::pool::NodePool;
use crate::persist::SnapshotStore;
use crate::platform::ChatPlatform;
use crate::session::autoplay::Recommender;
use crate::session::player::{Session, SessionOptions};
use crate::session::store::QueuePosition;
use crate::RoomId;
use cadenza_common::{PlayerParams, Track};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Registry of live sessions plus the shared collaborators they need
pub struct SessionRegistry {
    sessions: RwLock<HashMap<RoomId, Arc<Session>>>,
    pool: Arc<NodePool>,
    platform: Arc<dyn ChatPlatform>,
    recommender: Option<Arc<dyn Recommender>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    params: Arc<PlayerParams>,
    me: std::sync::Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(
        pool: Arc<NodePool>,
        platform: Arc<dyn ChatPlatform>,
        recommender: Option<Arc<dyn Recommender>>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        params: Arc<PlayerParams>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sessions: RwLock::new(HashMap::new()),
            pool,
            platform,
            recommender,
            snapshots,
            params,
            me: me.clone(),
        })
    }

    pub fn node_pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub async fn get(&self, room: RoomId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&room).cloned()
    }

    pub async fn rooms(&self) -> Vec<RoomId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Existing session for the room, or a fresh one bound to the least
    /// loaded available node.
    pub async fn get_or_create(
        &self,
        room: RoomId,
        options: SessionOptions,
    ) -> Result<Arc<Session>> {
        if let Some(session) = self.get(room).await {
            return Ok(session);
        }

        let node = self.pool.select().ok_or(Error::NoNodeAvailable)?;
        let session = Session::spawn(
            room,
            options,
            node,
            Arc::clone(&self.pool),
            Arc::clone(&self.platform),
            self.recommender.clone(),
            self.snapshots.clone(),
            Arc::clone(&self.params),
            self.me.clone(),
        )
        .await?;

        let mut sessions = self.sessions.write().await;
        // A concurrent create for the same room may have won the race
        if let Some(existing) = sessions.get(&room) {
            let existing = Arc::clone(existing);
            drop(sessions);
            session.destroy("superseded by concurrent create").await;
            return Ok(existing);
        }
        sessions.insert(room, Arc::clone(&session));
        Ok(session)
    }

    /// Rebuild a session from its stored snapshot.
    ///
    /// The node binding is re-validated (stored node if still usable,
    /// otherwise the best available) and the voice link re-issued by
    /// session creation. Playback resumes from the stored position only
    /// when `resume` is set; otherwise the restored current track is
    /// parked at the queue head.
    pub async fn restore(&self, room: RoomId, resume: bool) -> Result<Arc<Session>> {
        let store = self
            .snapshots
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no snapshot store configured".into()))?;
        let snapshot = store
            .load(room)
            .await?
            .ok_or(Error::SessionNotFound(room))?;

        if self.get(room).await.is_some() {
            return Err(Error::InvalidState(format!(
                "session {room} is already live"
            )));
        }

        let options = SessionOptions {
            voice_channel: snapshot.voice_channel,
            text_channel: snapshot.text_channel,
            owner: snapshot.owner,
            autoplay: snapshot.autoplay,
            persistent: snapshot.persistent,
            skin: Some(snapshot.skin.clone()),
        };

        let session = self.get_or_create(room, options).await?;

        let position_ms = snapshot.position_ms;
        let has_current = snapshot.current.is_some();
        {
            let mut state = session.state.write().await;
            state.loop_mode = snapshot.loop_mode;
            state.volume = snapshot.volume;

            // Park the interrupted track at the head; whatever advances
            // next plays it first
            let mut queue = Vec::with_capacity(snapshot.queue.len() + 1);
            if let Some(current) = snapshot.current {
                queue.push(Track::Resolved(current));
            }
            queue.extend(snapshot.queue);
            state.store.restore_queue(queue);
            // Stored history is most-recent-first; the ring wants oldest first
            state
                .store
                .restore_history(snapshot.history.into_iter().rev());
        }

        info!(room, resume, "Session restored from snapshot");
        if resume && has_current {
            session.advance_from(position_ms).await?;
        } else if resume {
            session.advance().await?;
        } else {
            session.arm_idle_timer().await;
            session.broadcast_presence().await;
        }
        Ok(session)
    }

    /// Enqueue into an existing session (convenience for the API layer)
    pub async fn enqueue(
        &self,
        room: RoomId,
        tracks: Vec<Track>,
        position: QueuePosition,
    ) -> Result<usize> {
        let session = self.get(room).await.ok_or(Error::SessionNotFound(room))?;
        session.enqueue_tracks(tracks, position).await
    }

    /// Called by a session at the end of its destroy sequence
    pub(crate) async fn remove(&self, room: RoomId) {
        if self.sessions.write().await.remove(&room).is_some() {
            info!(room, "Session removed from registry");
        }
    }

    /// Flush snapshots and destroy every session.
    ///
    /// Snapshots are kept so the next start can restore; only explicit
    /// user-facing destroys drop them.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.read().await;
            map.values().cloned().collect()
        };
        info!(count = sessions.len(), "Shutting down sessions");

        for session in sessions {
            session.save_snapshot().await;
            session.destroy_with("service shutdown", false).await;
        }
    }
}
