//! Per-room playback session
//!
//! One `Session` per voice room: owns the play queue, the binding to a
//! rendering node, the position clock, and every background helper task.
//! All queue advancement funnels through `advance_from`, guarded by the
//! session's `locked` flag so at most one advance is ever in flight.

use crate::error::{Error, Result};
use crate::node::client::{Filters, Node, NodeEvent};
use crate::node::pool::NodePool;
use crate::persist::{SessionSnapshot, SnapshotStore};
use crate::platform::{ChatPlatform, ChannelId};
use crate::registry::SessionRegistry;
use crate::session::autoplay::{has_noncanonical_tag, Recommender};
use crate::session::presence::PresenceBroadcaster;
use crate::session::recovery::{self, ErrorClass, RecoveryAction, RetryCounters};
use crate::session::store::{PlayQueue, QueuePosition};
use crate::RoomId;
use cadenza_common::events::{LoopMode, PlaybackPhase, PlayingTrackInfo, PresenceUpdate};
use cadenza_common::{PlayerParams, ResolvedTrack, Track, UnresolvedTrack};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options fixed at session creation
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub voice_channel: ChannelId,
    pub text_channel: Option<ChannelId>,
    pub owner: Option<u64>,
    pub autoplay: bool,
    /// 24/7 mode: auto-pause instead of tearing down when the channel
    /// empties, and keep playing from autoplay when the queue drains
    pub persistent: bool,
    pub skin: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            voice_channel: 0,
            text_channel: None,
            owner: None,
            autoplay: false,
            persistent: false,
            skin: None,
        }
    }
}

/// Transient status line surfaced to users (and skins)
#[derive(Debug, Clone, Default)]
pub struct StatusLine {
    pub text: String,
    pub emoji: String,
}

/// Derives elapsed playback position without polling the node.
///
/// `base_ms` is the last known position; while anchored, wall time since
/// the anchor accrues on top of it.
#[derive(Debug, Default)]
pub struct PositionClock {
    base_ms: u64,
    anchor: Option<Instant>,
}

impl PositionClock {
    pub fn reset(&mut self, at_ms: u64) {
        self.base_ms = at_ms;
        self.anchor = Some(Instant::now());
    }

    /// Stop accruing time, keeping the derived position
    pub fn freeze(&mut self) {
        self.base_ms = self.raw_ms();
        self.anchor = None;
    }

    pub fn resume(&mut self) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    pub fn clear(&mut self) {
        self.base_ms = 0;
        self.anchor = None;
    }

    fn raw_ms(&self) -> u64 {
        let elapsed = self
            .anchor
            .map(|a| a.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.base_ms.saturating_add(elapsed)
    }

    /// Derived position, duration-bounded unless the track is a stream
    pub fn position_ms(&self, duration_ms: u64, is_stream: bool) -> u64 {
        let raw = self.raw_ms();
        if is_stream {
            raw
        } else {
            raw.min(duration_ms)
        }
    }
}

/// Mutable session state behind the session's RwLock
pub struct PlayerState {
    pub current: Option<ResolvedTrack>,
    pub store: PlayQueue,
    pub loop_mode: LoopMode,
    pub autoplay: bool,
    pub persistent: bool,
    pub paused: bool,
    pub auto_paused: bool,
    pub phase: PlaybackPhase,
    pub volume: u16,
    pub filters: Filters,
    pub status_line: Option<StatusLine>,
    pub text_channel: Option<ChannelId>,
    pub voice_channel: ChannelId,
    pub voice_connected: bool,
    pub skin: String,
    pub owner: Option<u64>,
    pub clock: PositionClock,
    pub idle_deadline: Option<chrono::DateTime<chrono::Utc>>,
}

/// Background helper tasks owned by a session
#[derive(Default)]
struct Tasks {
    idle: Option<JoinHandle<()>>,
    members: Option<JoinHandle<()>>,
    node_wait: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    saver: Option<JoinHandle<()>>,
    event_loop: Option<JoinHandle<()>>,
}

/// Playback session for one voice room
pub struct Session {
    pub id: RoomId,
    pub(crate) params: Arc<PlayerParams>,
    pub(crate) platform: Arc<dyn ChatPlatform>,
    pub(crate) recommender: Option<Arc<dyn Recommender>>,
    pub(crate) pool: Arc<NodePool>,
    pub(crate) snapshots: Option<Arc<dyn SnapshotStore>>,
    pub(crate) presence: PresenceBroadcaster,
    pub(crate) state: tokio::sync::RwLock<PlayerState>,
    /// Sole intra-session mutual exclusion for queue advancement
    locked: AtomicBool,
    closing: AtomicBool,
    node: RwLock<Arc<Node>>,
    pub(crate) counters: tokio::sync::Mutex<RetryCounters>,
    tasks: Mutex<Tasks>,
    pub(crate) cancel: CancellationToken,
    pub(crate) events_tx: mpsc::UnboundedSender<NodeEvent>,
    watchdog_interventions: AtomicU64,
    registry: Weak<SessionRegistry>,
    /// Self-reference for handing owned clones to spawned tasks
    me: Weak<Session>,
}

impl Session {
    /// Create the session, bind it to a node, join voice, and start its
    /// background tasks.
    pub async fn spawn(
        id: RoomId,
        options: SessionOptions,
        node: Arc<Node>,
        pool: Arc<NodePool>,
        platform: Arc<dyn ChatPlatform>,
        recommender: Option<Arc<dyn Recommender>>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        params: Arc<PlayerParams>,
        registry: Weak<SessionRegistry>,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state = PlayerState {
            current: None,
            store: PlayQueue::new(&params),
            loop_mode: LoopMode::Off,
            autoplay: options.autoplay,
            persistent: options.persistent,
            paused: false,
            auto_paused: false,
            phase: PlaybackPhase::Idle,
            volume: params.default_volume,
            filters: Filters::default(),
            status_line: None,
            text_channel: options.text_channel,
            voice_channel: options.voice_channel,
            voice_connected: false,
            skin: options.skin.unwrap_or_else(|| "default".to_string()),
            owner: options.owner,
            clock: PositionClock::default(),
            idle_deadline: None,
        };

        let session = Arc::new_cyclic(|me| Self {
            id,
            params,
            platform,
            recommender,
            pool,
            snapshots,
            presence: PresenceBroadcaster::new(id),
            state: tokio::sync::RwLock::new(state),
            locked: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            counters: tokio::sync::Mutex::new(RetryCounters::new(&node.id)),
            node: RwLock::new(Arc::clone(&node)),
            tasks: Mutex::new(Tasks::default()),
            cancel: CancellationToken::new(),
            events_tx,
            watchdog_interventions: AtomicU64::new(0),
            registry,
            me: me.clone(),
        });

        node.attach(id, session.events_tx.clone());

        session
            .platform
            .join_voice(id, options.voice_channel)
            .await?;
        session.state.write().await.voice_connected = true;

        let event_loop = crate::session::events::spawn_event_loop(Arc::clone(&session), events_rx);
        let heartbeat = session.spawn_heartbeat();
        let saver = session.spawn_snapshot_saver();
        {
            let mut tasks = session.tasks.lock().expect("task set poisoned");
            tasks.event_loop = Some(event_loop);
            tasks.heartbeat = Some(heartbeat);
            tasks.saver = Some(saver);
        }

        info!(room = id, node = %node.id, "Session created");
        Ok(session)
    }

    // ---- small accessors -------------------------------------------------

    /// Owned handle to this session for spawned tasks.
    ///
    /// The weak self-reference always upgrades while a method runs: the
    /// caller necessarily holds a strong reference.
    pub(crate) fn arc(&self) -> Arc<Session> {
        self.me.upgrade().expect("session self-reference expired")
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub(crate) fn try_lock_advance(&self) -> bool {
        !self.locked.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn bound_node(&self) -> Arc<Node> {
        Arc::clone(&self.node.read().expect("node binding poisoned"))
    }

    pub fn watchdog_interventions(&self) -> u64 {
        self.watchdog_interventions.load(Ordering::Relaxed)
    }

    pub(crate) fn note_watchdog_intervention(&self) {
        self.watchdog_interventions.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribe to this session's presence updates
    pub fn subscribe_presence(&self) -> tokio::sync::broadcast::Receiver<PresenceUpdate> {
        self.presence.subscribe()
    }

    /// Register a named observer token for presence delivery
    pub fn register_observer(
        &self,
        token: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<PresenceUpdate> {
        self.presence.register_observer(token)
    }

    /// Store ring sizes: (queue, history, autoplay candidates, failed)
    pub async fn ring_lengths(&self) -> (usize, usize, usize, usize) {
        let state = self.state.read().await;
        (
            state.store.len(),
            state.store.history_len(),
            state.store.autoplay_len(),
            state.store.failed().count(),
        )
    }

    /// Derived playback position of the current track
    pub async fn position_ms(&self) -> u64 {
        let state = self.state.read().await;
        match &state.current {
            Some(track) => state.clock.position_ms(track.duration_ms, track.is_stream),
            None => 0,
        }
    }

    pub(crate) async fn sleep_cancellable(&self, duration: Duration) -> std::result::Result<(), ()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn set_status_line(&self, text: impl Into<String>, emoji: &str) {
        let mut state = self.state.write().await;
        state.status_line = Some(StatusLine {
            text: text.into(),
            emoji: emoji.to_string(),
        });
    }

    pub async fn clear_status_line(&self) {
        self.state.write().await.status_line = None;
    }

    // ---- command surface -------------------------------------------------

    /// Add tracks to the queue, starting playback if the session was idle.
    ///
    /// Returns the queue length after the insert.
    pub async fn enqueue_tracks(
        &self,
        tracks: Vec<Track>,
        position: QueuePosition,
    ) -> Result<usize> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        if tracks.is_empty() {
            return Err(Error::BadRequest("no tracks to enqueue".into()));
        }

        let (queue_len, was_idle) = {
            let mut state = self.state.write().await;
            match position {
                // Head inserts keep the given order at the front
                QueuePosition::Head => {
                    for track in tracks.into_iter().rev() {
                        state.store.enqueue(track, QueuePosition::Head);
                    }
                }
                QueuePosition::Index(base) => {
                    for (offset, track) in tracks.into_iter().enumerate() {
                        state.store.enqueue(track, QueuePosition::Index(base + offset));
                    }
                }
                QueuePosition::Tail => {
                    for track in tracks {
                        state.store.enqueue(track, QueuePosition::Tail);
                    }
                }
            }
            state.idle_deadline = None;
            (state.store.len(), state.current.is_none())
        };
        self.cancel_idle_timer();

        if was_idle {
            self.advance().await?;
        } else {
            self.broadcast_presence().await;
        }
        Ok(queue_len)
    }

    /// Search the bound node and enqueue everything the query resolved to.
    ///
    /// A playlist result enqueues all its tracks sharing one playlist ref.
    pub async fn enqueue_query(
        &self,
        query: &str,
        requested_by: Option<u64>,
        position: QueuePosition,
    ) -> Result<usize> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }

        let node = self.bound_node();
        let result = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().search(query),
        )
        .await
        .map_err(|_| Error::Node("search timed out".into()))??;

        if result.is_empty() {
            return Err(Error::Resolve(format!("no results for {query:?}")));
        }

        let playlist = result.playlist.map(Arc::new);
        let tracks: Vec<Track> = result
            .tracks
            .into_iter()
            .map(|mut track| {
                track.requested_by = requested_by;
                track.playlist = playlist.clone();
                Track::Resolved(track)
            })
            .collect();

        self.enqueue_tracks(tracks, position).await
    }

    pub async fn pause(&self) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        {
            let mut state = self.state.write().await;
            if state.current.is_none() {
                return Err(Error::InvalidState("nothing is playing".into()));
            }
            state.paused = true;
            state.phase = PlaybackPhase::Paused;
            state.clock.freeze();
        }
        let node = self.bound_node();
        tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().pause(self.id, true),
        )
        .await
        .map_err(|_| Error::Node("pause timed out".into()))??;
        self.broadcast_presence().await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        let auto_paused = self.state.read().await.auto_paused;
        if auto_paused {
            return self.resume_from_auto_pause().await;
        }
        {
            let mut state = self.state.write().await;
            if state.current.is_none() {
                return Err(Error::InvalidState("nothing is playing".into()));
            }
            state.paused = false;
            state.phase = PlaybackPhase::Playing;
            state.clock.resume();
        }
        let node = self.bound_node();
        tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().pause(self.id, false),
        )
        .await
        .map_err(|_| Error::Node("resume timed out".into()))??;
        self.arm_watchdog().await;
        self.broadcast_presence().await;
        Ok(())
    }

    /// Skip the current track.
    ///
    /// With queued (or autoplay-able) material the node's stop event drives
    /// the advance; with nothing left the session settles into Idle here.
    pub async fn skip(&self) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        let (has_current, queue_empty, continues) = {
            let state = self.state.read().await;
            (
                state.current.is_some(),
                state.store.is_empty(),
                !state.store.is_empty()
                    || state.autoplay
                    || state.persistent
                    || state.store.autoplay_len() > 0,
            )
        };
        if !has_current {
            return Err(Error::InvalidState("nothing is playing".into()));
        }

        if queue_empty && !continues {
            // Nothing will follow: finish bookkeeping and go idle directly
            // (enter_idle stops the node-side player)
            {
                let mut state = self.state.write().await;
                if let Some(track) = state.current.take() {
                    if !track.autoplay {
                        state.store.record_played(Track::Resolved(track));
                    }
                }
            }
            self.enter_idle().await;
            self.broadcast_presence().await;
            return Ok(());
        }

        let node = self.bound_node();
        tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().stop(self.id),
        )
        .await
        .map_err(|_| Error::Node("stop timed out".into()))??;
        Ok(())
    }

    /// Replay the most recently played track (the "back" operation)
    pub async fn play_previous(&self) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        let was_playing = {
            let mut state = self.state.write().await;
            let previous = state
                .store
                .take_previous()
                .ok_or_else(|| Error::InvalidState("history is empty".into()))?;
            state.store.enqueue(previous, QueuePosition::Head);
            state.current.is_some()
        };

        if was_playing {
            // Stop event performs the advance with the history entry at head
            let node = self.bound_node();
            tokio::time::timeout(
                self.params.node_request_timeout(),
                node.client().stop(self.id),
            )
            .await
            .map_err(|_| Error::Node("stop timed out".into()))??;
            Ok(())
        } else {
            self.advance().await
        }
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        self.state.write().await.loop_mode = mode;
        self.broadcast_presence().await;
        Ok(())
    }

    pub async fn set_autoplay(&self, enabled: bool) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        let idle = {
            let mut state = self.state.write().await;
            state.autoplay = enabled;
            state.current.is_none()
        };
        if enabled && idle {
            self.advance().await?;
        } else {
            self.broadcast_presence().await;
        }
        Ok(())
    }

    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        self.state.write().await.volume = volume.min(150);
        self.broadcast_presence().await;
        Ok(())
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        if self.is_closing() {
            return Err(Error::SessionClosing);
        }
        let node = self.bound_node();
        tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().set_filters(self.id, &filters),
        )
        .await
        .map_err(|_| Error::Node("filter update timed out".into()))??;
        self.state.write().await.filters = filters;
        Ok(())
    }

    // ---- queue advancement ----------------------------------------------

    /// Advance to the next track from position zero
    pub async fn advance(&self) -> Result<()> {
        self.advance_from(0).await
    }

    /// Core advance loop.
    ///
    /// Refuses while locked or closing; otherwise holds `locked` for the
    /// duration of each attempt and clears it exactly once per exit path.
    /// Resolution failures and play-request failures loop back in bounded
    /// fashion instead of recursing.
    // Returns a boxed future rather than `async fn` to break the async
    // Send-inference cycle through the watchdog task (arm_watchdog spawns a
    // task -> force_track_end -> advance -> advance_from -> play ->
    // arm_watchdog). Giving this one node in the cycle a concrete boxed type
    // removes its opaque from the inference graph. Behavior is unchanged.
    pub(crate) fn advance_from(
        &self,
        start_ms: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
        let mut start_ms = start_ms;

        loop {
            if self.is_closing() {
                return Ok(());
            }
            if !self.try_lock_advance() {
                debug!(room = self.id, "Advance refused: already in flight");
                return Ok(());
            }
            self.cancel_idle_timer();

            let popped = {
                let mut state = self.state.write().await;
                state.phase = PlaybackPhase::Resolving;
                state.store.pop_next()
            };

            let track = match popped {
                Some(track) => track,
                None => {
                    let autoplay_enabled = {
                        let state = self.state.read().await;
                        state.autoplay || state.persistent
                    };
                    let candidate = if autoplay_enabled {
                        self.next_autoplay_candidate().await
                    } else {
                        None
                    };
                    match candidate {
                        Some(track) => track,
                        None => {
                            self.enter_idle().await;
                            self.unlock();
                            self.broadcast_presence().await;
                            return Ok(());
                        }
                    }
                }
            };

            let resolved = match track {
                Track::Resolved(resolved) => resolved,
                Track::Unresolved(request) => match self.resolve(request.clone()).await {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        warn!(room = self.id, title = %request.title, error = %err, "Track resolution failed");
                        self.notify_channel(&format!(
                            "Could not resolve \"{}\"; skipping to the next entry",
                            request.title
                        ))
                        .await;
                        {
                            let mut state = self.state.write().await;
                            state.store.record_failed(Track::Unresolved(request));
                        }
                        self.unlock();
                        if self
                            .sleep_cancellable(self.params.resolve_failure_cooldown())
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                        start_ms = 0;
                        continue;
                    }
                },
            };

            if resolved.is_stream {
                start_ms = 0;
            }

            let node = self.bound_node();
            let play = tokio::time::timeout(
                self.params.node_request_timeout(),
                node.client().play(self.id, resolved.handle.as_str(), start_ms),
            )
            .await;

            match play {
                Ok(Ok(())) => {
                    {
                        let mut state = self.state.write().await;
                        if !resolved.autoplay {
                            state.store.clear_autoplay();
                        }
                        state.current = Some(resolved);
                        state.phase = PlaybackPhase::Playing;
                        state.paused = false;
                        state.auto_paused = false;
                        state.clock.reset(start_ms);
                        state.idle_deadline = None;
                    }
                    self.unlock();
                    self.arm_watchdog().await;
                    self.broadcast_presence().await;
                    return Ok(());
                }
                outcome => {
                    let reason = match outcome {
                        Ok(Err(e)) => e.to_string(),
                        _ => "play request timed out".to_string(),
                    };
                    warn!(room = self.id, node = %node.id, %reason, "Play request failed");

                    let resume = start_ms;
                    {
                        let mut state = self.state.write().await;
                        state.store.enqueue(Track::Resolved(resolved), QueuePosition::Head);
                    }
                    let action = {
                        let mut counters = self.counters.lock().await;
                        recovery::decide(
                            ErrorClass::Network,
                            &mut counters,
                            &self.params,
                            Instant::now(),
                        )
                    };
                    match action {
                        RecoveryAction::Retry {
                            cooldown,
                            resume_position,
                        } => {
                            self.unlock();
                            if self.sleep_cancellable(cooldown).await.is_err() {
                                return Ok(());
                            }
                            start_ms = if resume_position { resume } else { 0 };
                            continue;
                        }
                        _ => {
                            node.mark_degraded(ErrorClass::Network, self.params.retry_quiet_period());
                            // locked stays held until a usable node exists
                            self.begin_node_search(
                                ErrorClass::Network,
                                Some(node.id.clone()),
                                resume,
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }
        })
    }

    /// Resolve a request against the bound node's search call
    pub(crate) async fn resolve(&self, request: UnresolvedTrack) -> Result<ResolvedTrack> {
        let node = self.bound_node();
        let query = request.resolve_query();
        let result = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().search(&query),
        )
        .await
        .map_err(|_| Error::Resolve("resolution search timed out".into()))??;

        let chosen = pick_resolution(&request, result.tracks)
            .ok_or_else(|| Error::Resolve(format!("no playable result for {:?}", request.title)))?;

        Ok(bind_resolution(request, chosen))
    }

    /// Stop playback bookkeeping when nothing is left to play: clears
    /// current, arms the idle timer, stops the node-side player.
    pub(crate) async fn enter_idle(&self) {
        self.cancel_watchdog();
        let node = self.bound_node();
        let _ = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().stop(self.id),
        )
        .await;

        let voice_channel = {
            let mut state = self.state.write().await;
            state.current = None;
            state.phase = PlaybackPhase::Idle;
            state.paused = false;
            state.auto_paused = false;
            state.clock.clear();
            state.voice_channel
        };
        let _ = self.platform.set_voice_status(voice_channel, None).await;
        self.arm_idle_timer().await;
    }

    // ---- node failover ---------------------------------------------------

    /// Look for a replacement node until one is found or the session dies.
    ///
    /// Caller must hold `locked`; it stays held while the session has no
    /// usable node so no advance can run in the meantime.
    pub(crate) fn begin_node_search(
        &self,
        class: ErrorClass,
        exclude: Option<String>,
        resume_ms: u64,
    ) {
        let session = self.arc();
        let handle = tokio::spawn(async move {
            session
                .set_status_line(
                    "No rendering node available; waiting for one to come back",
                    "⏰",
                )
                .await;
            session.broadcast_presence().await;

            loop {
                if session.is_closing() {
                    return;
                }
                if let Some(node) = session
                    .pool
                    .select_replacement(exclude.as_deref(), Some(class))
                {
                    match session.migrate(node, resume_ms).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(room = session.id, error = %e, "Migration attempt failed");
                        }
                    }
                }
                if session
                    .sleep_cancellable(session.params.node_wait_interval())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(old) = tasks.node_wait.replace(handle) {
            old.abort();
        }
    }

    /// Rebind to a new node and re-arm playback from the carried position.
    pub(crate) async fn migrate(&self, new_node: Arc<Node>, resume_ms: u64) -> Result<()> {
        let old = {
            let mut bound = self.node.write().expect("node binding poisoned");
            let old = Arc::clone(&bound);
            *bound = Arc::clone(&new_node);
            old
        };
        old.detach(self.id);
        new_node.attach(self.id, self.events_tx.clone());
        self.counters.lock().await.bind_node(&new_node.id);

        let (voice_connected, voice_channel) = {
            let state = self.state.read().await;
            (state.voice_connected, state.voice_channel)
        };
        if !voice_connected {
            self.platform.join_voice(self.id, voice_channel).await?;
            self.state.write().await.voice_connected = true;
        }

        info!(room = self.id, node = %new_node.id, "Session migrated");
        self.set_status_line(format!("Reconnected on node {}", new_node.id), "🔰")
            .await;

        self.unlock();
        self.advance_from(resume_ms).await
    }

    // ---- presence ---------------------------------------------------------

    /// Snapshot current state into a presence update
    pub async fn presence_snapshot(&self) -> PresenceUpdate {
        let node = self.bound_node();
        let state = self.state.read().await;
        let now = chrono::Utc::now();

        match &state.current {
            None => PresenceUpdate::Idle {
                room: self.id,
                idle_deadline: state.idle_deadline,
                autoplay: state.autoplay,
                persistent: state.persistent,
                timestamp: now,
            },
            Some(track) => PresenceUpdate::Playing {
                room: self.id,
                phase: state.phase,
                track: PlayingTrackInfo {
                    request_id: track.request_id,
                    title: track.title.clone(),
                    author: track.author.clone(),
                    uri: track.uri.clone(),
                    source: track.source.clone(),
                    thumbnail: track.display_thumbnail().map(|s| s.to_string()),
                    duration_ms: track.duration_ms,
                    is_stream: track.is_stream,
                    autoplay: track.autoplay,
                    requested_by: track.requested_by,
                    playlist_name: track.playlist.as_ref().map(|p| p.name.clone()),
                },
                position_ms: state.clock.position_ms(track.duration_ms, track.is_stream),
                paused: state.paused,
                queue_len: state.store.len(),
                loop_mode: state.loop_mode,
                autoplay: state.autoplay,
                persistent: state.persistent,
                volume: state.volume,
                node: node.id.clone(),
                node_ping_ms: node.ping_ms(),
                status_line: state.status_line.as_ref().map(|s| {
                    if s.emoji.is_empty() {
                        s.text.clone()
                    } else {
                        format!("{} {}", s.emoji, s.text)
                    }
                }),
                timestamp: now,
            },
        }
    }

    pub(crate) async fn broadcast_presence(&self) {
        let update = self.presence_snapshot().await;
        self.presence.broadcast(update);
    }

    /// Post a transient line to the session's text channel, if it has one
    pub(crate) async fn notify_channel(&self, text: &str) {
        let channel = self.state.read().await.text_channel;
        if let Some(channel) = channel {
            if let Err(e) = self.platform.send_status(channel, text).await {
                debug!(room = self.id, error = %e, "Status message failed");
            }
        }
    }

    // ---- persistence -------------------------------------------------------

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            room: self.id,
            voice_channel: state.voice_channel,
            text_channel: state.text_channel,
            owner: state.owner,
            current: state.current.clone(),
            position_ms: state
                .current
                .as_ref()
                .map(|t| state.clock.position_ms(t.duration_ms, t.is_stream))
                .unwrap_or(0),
            queue: state.store.tracks().cloned().collect(),
            history: state.store.history().cloned().collect(),
            loop_mode: state.loop_mode,
            autoplay: state.autoplay,
            persistent: state.persistent,
            volume: state.volume,
            skin: state.skin.clone(),
            node_id: self.bound_node().id.clone(),
            saved_at: chrono::Utc::now(),
        }
    }

    pub(crate) async fn save_snapshot(&self) {
        if let Some(store) = &self.snapshots {
            let snapshot = self.snapshot().await;
            if let Err(e) = store.save(&snapshot).await {
                warn!(room = self.id, error = %e, "Snapshot save failed");
            }
        }
    }

    fn spawn_snapshot_saver(&self) -> JoinHandle<()> {
        let session = self.arc();
        tokio::spawn(async move {
            loop {
                if session
                    .sleep_cancellable(session.params.snapshot_interval())
                    .await
                    .is_err()
                {
                    return;
                }
                if session.is_closing() {
                    return;
                }
                let has_current = session.state.read().await.current.is_some();
                if has_current {
                    session.save_snapshot().await;
                }
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let session = self.arc();
        tokio::spawn(async move {
            loop {
                if session
                    .sleep_cancellable(session.params.presence_heartbeat())
                    .await
                    .is_err()
                {
                    return;
                }
                if session.is_closing() {
                    return;
                }
                let playing = {
                    let state = session.state.read().await;
                    state.phase == PlaybackPhase::Playing && !state.paused
                };
                if playing {
                    session.broadcast_presence().await;
                }
            }
        })
    }

    // ---- task bookkeeping (slots shared with timers.rs) --------------------

    pub(crate) fn store_idle_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(old) = tasks.idle.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_idle_timer(&self) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(handle) = tasks.idle.take() {
            handle.abort();
        }
    }

    pub(crate) fn store_members_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(old) = tasks.members.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_members_timer(&self) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(handle) = tasks.members.take() {
            handle.abort();
        }
    }

    pub(crate) fn store_watchdog_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(old) = tasks.watchdog.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_watchdog(&self) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        if let Some(handle) = tasks.watchdog.take() {
            handle.abort();
        }
    }

    /// Take the watchdog's own handle so it is not aborted mid-intervention
    pub(crate) fn disarm_watchdog_slot(&self) {
        let mut tasks = self.tasks.lock().expect("task set poisoned");
        tasks.watchdog.take();
    }

    // ---- teardown ----------------------------------------------------------

    /// Destroy from a background task without aborting ourselves mid-run
    pub(crate) fn spawn_destroy(&self, reason: &str) {
        let session = self.arc();
        let reason = reason.to_string();
        tokio::spawn(async move {
            session.destroy(&reason).await;
        });
    }

    /// Tear the session down: cancel background work, notify observers,
    /// release the node and the voice channel, drop persisted state.
    ///
    /// Idempotent; after the first call the session accepts no new work.
    pub async fn destroy(&self, reason: &str) {
        self.destroy_with(reason, true).await;
    }

    /// Destroy, choosing whether the stored snapshot is dropped.
    ///
    /// Service shutdown keeps snapshots so the next start can restore;
    /// user-facing destroys drop them.
    pub(crate) async fn destroy_with(&self, reason: &str, drop_snapshot: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room = self.id, reason, "Destroying session");

        self.state.write().await.phase = PlaybackPhase::Closing;
        self.cancel.cancel();

        // Cancellation order: idle timer, node-wait loop, periodic
        // broadcaster, auto-skip watchdog, then the rest
        {
            let mut tasks = self.tasks.lock().expect("task set poisoned");
            for handle in [
                tasks.idle.take(),
                tasks.node_wait.take(),
                tasks.heartbeat.take(),
                tasks.watchdog.take(),
                tasks.members.take(),
                tasks.saver.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
        }

        self.presence.broadcast(PresenceUpdate::Closed {
            room: self.id,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });

        let node = self.bound_node();
        let _ = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().destroy(self.id),
        )
        .await;
        node.detach(self.id);

        let voice_channel = self.state.read().await.voice_channel;
        let _ = self.platform.set_voice_status(voice_channel, None).await;
        let _ = self.platform.leave_voice(self.id).await;

        if drop_snapshot {
            if let Some(store) = &self.snapshots {
                if let Err(e) = store.delete(self.id).await {
                    warn!(room = self.id, error = %e, "Snapshot delete failed");
                }
            }
        }

        {
            let mut state = self.state.write().await;
            state.store.clear_all();
            state.current = None;
            state.clock.clear();
        }

        // Event loop goes last so ordered in-flight events observe Closing
        {
            let mut tasks = self.tasks.lock().expect("task set poisoned");
            if let Some(handle) = tasks.event_loop.take() {
                handle.abort();
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id).await;
        }
    }
}

/// Pick the search result that best matches a request: skips streams and
/// results that gained a non-canonical tag the request didn't have, prefers
/// a duration within ten seconds of the hint.
pub(crate) fn pick_resolution(
    request: &UnresolvedTrack,
    results: Vec<ResolvedTrack>,
) -> Option<ResolvedTrack> {
    let request_tagged = has_noncanonical_tag(&request.title);
    let mut fallback: Option<ResolvedTrack> = None;

    for candidate in results {
        if candidate.is_stream {
            continue;
        }
        if !request_tagged && has_noncanonical_tag(&candidate.title) {
            continue;
        }
        if let Some(hint) = request.duration_hint_ms {
            let delta = candidate.duration_ms.abs_diff(hint);
            if delta <= 10_000 {
                return Some(candidate);
            }
            if fallback.is_none() {
                fallback = Some(candidate);
            }
        } else {
            return Some(candidate);
        }
    }
    fallback
}

/// Merge a search hit into the original request, preserving request-scoped
/// identity and filling display gaps from the node's metadata.
pub(crate) fn bind_resolution(request: UnresolvedTrack, found: ResolvedTrack) -> ResolvedTrack {
    let mut resolved = request.clone().into_resolved(
        found.handle,
        found.duration_ms,
        found.is_stream,
        found.source,
    );
    if resolved.uri.is_none() {
        resolved.uri = found.uri;
    }
    if resolved.thumbnail.is_none() {
        resolved.thumbnail = found.thumbnail;
    }
    if resolved.external_id.is_none() {
        resolved.external_id = found.external_id;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_common::TrackHandle;

    fn found(title: &str, duration_ms: u64, is_stream: bool) -> ResolvedTrack {
        ResolvedTrack {
            request_id: uuid::Uuid::new_v4(),
            handle: TrackHandle(format!("h-{title}")),
            uri: Some(format!("https://example.com/{title}")),
            title: title.to_string(),
            author: "Artist".into(),
            duration_ms,
            is_stream,
            thumbnail: None,
            external_id: Some(format!("ext-{title}")),
            source: "soundcloud".into(),
            requested_by: None,
            loops: 0,
            autoplay: false,
            related: None,
            playlist: None,
        }
    }

    #[test]
    fn clock_position_is_duration_bounded() {
        let mut clock = PositionClock::default();
        clock.reset(150_000);
        let position = clock.position_ms(120_000, false);
        assert_eq!(position, 120_000);

        // Streams are unbounded
        let position = clock.position_ms(120_000, true);
        assert!(position >= 150_000);
    }

    #[test]
    fn clock_freeze_stops_accrual() {
        let mut clock = PositionClock::default();
        clock.reset(5_000);
        clock.freeze();
        let a = clock.position_ms(60_000, false);
        std::thread::sleep(Duration::from_millis(15));
        let b = clock.position_ms(60_000, false);
        assert_eq!(a, b);
    }

    #[test]
    fn clock_is_monotonic_while_anchored() {
        let mut clock = PositionClock::default();
        clock.reset(0);
        let a = clock.position_ms(60_000, false);
        std::thread::sleep(Duration::from_millis(10));
        let b = clock.position_ms(60_000, false);
        assert!(b >= a);
    }

    #[test]
    fn pick_resolution_skips_streams_and_tagged_results() {
        let mut request = UnresolvedTrack::new("Song", "Artist");
        request.duration_hint_ms = Some(180_000);

        let results = vec![
            found("Song (live)", 0, true),
            found("Song remix", 180_500, false),
            found("Song", 181_000, false),
        ];
        let picked = pick_resolution(&request, results).unwrap();
        assert_eq!(picked.title, "Song");
    }

    #[test]
    fn pick_resolution_prefers_duration_window() {
        let mut request = UnresolvedTrack::new("Song", "Artist");
        request.duration_hint_ms = Some(180_000);

        let results = vec![found("Song full album", 2_400_000, false), found("Song", 175_000, false)];
        let picked = pick_resolution(&request, results).unwrap();
        assert_eq!(picked.duration_ms, 175_000);
    }

    #[test]
    fn pick_resolution_falls_back_outside_window() {
        let mut request = UnresolvedTrack::new("Song", "Artist");
        request.duration_hint_ms = Some(180_000);

        let results = vec![found("Song extended cut", 2_400_000, false)];
        // Tagged title is excluded ("extend"), nothing remains
        assert!(pick_resolution(&request, results).is_none());

        let results = vec![found("Song full version", 2_400_000, false)];
        let picked = pick_resolution(&request, results).unwrap();
        assert_eq!(picked.duration_ms, 2_400_000);
    }

    #[test]
    fn bind_resolution_preserves_request_identity() {
        let mut request = UnresolvedTrack::new("Song", "Artist");
        request.requested_by = Some(99);
        request.loops = 2;
        let id = request.request_id;

        let resolved = bind_resolution(request, found("Song", 180_000, false));
        assert_eq!(resolved.request_id, id);
        assert_eq!(resolved.requested_by, Some(99));
        assert_eq!(resolved.loops, 2);
        assert_eq!(resolved.handle.as_str(), "h-Song");
        assert_eq!(resolved.external_id.as_deref(), Some("ext-Song"));
    }
}
