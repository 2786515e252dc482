//! Per-session node event handling
//!
//! One consumer loop per session reads that session's ordered event channel
//! and dispatches sequentially — two events for the same session are never
//! handled concurrently, and arrival order is processing order.

use crate::node::client::{NodeEvent, TrackEndReason};
use crate::session::player::Session;
use crate::session::recovery::{
    self, ErrorClass, RecoveryAction, TrackError, TransportAction,
};
use crate::session::store::QueuePosition;
use cadenza_common::events::LoopMode;
use cadenza_common::Track;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the session's single event-consumer loop
pub(crate) fn spawn_event_loop(
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => handle_event(&session, event).await,
                    None => return,
                }
            }
        }
    })
}

async fn handle_event(session: &Arc<Session>, event: NodeEvent) {
    if session.is_closing() {
        return;
    }
    debug!(room = session.id, ?event, "Node event");

    match event {
        NodeEvent::TrackStarted { handle } => on_track_started(session, handle).await,
        NodeEvent::TrackEnded { handle, reason } => on_track_ended(session, handle, reason).await,
        NodeEvent::TrackErrored { handle, error } => on_track_error(session, handle, error).await,
        NodeEvent::TrackStuck { handle, threshold_ms } => {
            warn!(room = session.id, %handle, threshold_ms, "Track stuck");
            let error = TrackError {
                message: format!("playback stuck past {threshold_ms}ms"),
                cause: "track stuck: no audio frames from decoder".into(),
                severity: recovery::Severity::Suspicious,
            };
            run_recovery(session, handle, ErrorClass::Decode, error).await;
        }
        NodeEvent::TransportClosed { code, reason } => {
            on_transport_closed(session, code, reason).await
        }
    }
}

async fn on_track_started(session: &Arc<Session>, handle: String) {
    let matches = {
        let state = session.state.read().await;
        state
            .current
            .as_ref()
            .map(|t| t.handle.as_str() == handle)
            .unwrap_or(false)
    };
    if !matches {
        debug!(room = session.id, %handle, "Start event for non-current track");
        return;
    }

    let (voice_channel, label) = {
        let state = session.state.read().await;
        let label = state
            .current
            .as_ref()
            .map(|t| format!("Playing: {} | {}", t.title, t.author));
        (state.voice_channel, label)
    };
    if let Some(label) = label {
        let _ = session
            .platform
            .set_voice_status(voice_channel, Some(&label))
            .await;
    }

    session.save_snapshot().await;
    session.broadcast_presence().await;
}

/// Apply end-of-track bookkeeping and pull the next entry.
///
/// A duplicate end event for a track that is no longer current is a no-op.
async fn on_track_ended(session: &Arc<Session>, handle: String, reason: TrackEndReason) {
    if session.is_locked() {
        debug!(room = session.id, "End event deferred: advance in flight");
        return;
    }
    let auto_paused = session.state.read().await.auto_paused;
    if auto_paused {
        return;
    }

    match reason {
        TrackEndReason::Finished => {
            if !finish_current(session, &handle, true).await {
                return;
            }
            session.clear_status_line().await;
        }
        TrackEndReason::Stopped => {
            let queue_empty = session.state.read().await.store.is_empty();
            if queue_empty {
                return;
            }
            if !finish_current(session, &handle, false).await {
                return;
            }
        }
        TrackEndReason::Other => return,
    }

    session.cancel_watchdog();
    if let Err(e) = session.advance().await {
        warn!(room = session.id, error = %e, "Advance after track end failed");
    }
}

/// Take the current track (if it matches the ended handle) and apply loop
/// and history rules. Returns false when the event was stale.
///
/// Loop rules apply only to natural completions; a stopped track was
/// explicitly replaced and just goes to history.
async fn finish_current(session: &Arc<Session>, handle: &str, apply_loop: bool) -> bool {
    let mut state = session.state.write().await;

    let matches = state
        .current
        .as_ref()
        .map(|t| t.handle.as_str() == handle)
        .unwrap_or(false);
    if !matches {
        debug!(room = session.id, %handle, "Stale end event ignored");
        return false;
    }

    let finished = match state.current.take() {
        Some(track) => track,
        None => return false,
    };
    state.clock.clear();

    if apply_loop && state.loop_mode == LoopMode::Track {
        state
            .store
            .enqueue(Track::Resolved(finished), QueuePosition::Head);
    } else if apply_loop && finished.loops > 0 {
        let mut repeat = finished;
        repeat.loops -= 1;
        state
            .store
            .enqueue(Track::Resolved(repeat), QueuePosition::Head);
    } else if apply_loop && state.loop_mode == LoopMode::Queue {
        state
            .store
            .enqueue(Track::Resolved(finished), QueuePosition::Tail);
    } else if !finished.autoplay {
        state.store.record_played(Track::Resolved(finished));
    }
    true
}

/// Synthesized advance used by the auto-skip watchdog when the node never
/// delivered the end event.
pub(crate) async fn force_track_end(session: &Arc<Session>) {
    if session.is_locked() || session.is_closing() {
        return;
    }
    let handle = {
        let state = session.state.read().await;
        match &state.current {
            Some(track) => track.handle.as_str().to_string(),
            None => return,
        }
    };
    if !finish_current(session, &handle, true).await {
        return;
    }
    if let Err(e) = session.advance().await {
        warn!(room = session.id, error = %e, "Watchdog advance failed");
    }
}

async fn on_track_error(session: &Arc<Session>, handle: String, error: TrackError) {
    warn!(
        room = session.id,
        %handle,
        cause = %error.cause,
        severity = ?error.severity,
        "Track error"
    );

    let class = recovery::classify(&error);
    run_recovery(session, handle, class, error).await;
}

async fn run_recovery(
    session: &Arc<Session>,
    handle: String,
    class: ErrorClass,
    error: TrackError,
) {
    // An advance already owns the session; duplicate error events during a
    // retry window only refresh the status line.
    if !session.try_lock_advance() {
        session
            .set_status_line(
                format!("Playback error while retrying: {}", error.cause),
                "⚠️",
            )
            .await;
        return;
    }

    let (current, position_ms) = {
        let mut state = session.state.write().await;
        let matches = state
            .current
            .as_ref()
            .map(|t| t.handle.as_str() == handle)
            .unwrap_or(false);
        if !matches {
            (None, 0)
        } else {
            let track = state.current.take();
            let position = track
                .as_ref()
                .map(|t| state.clock.position_ms(t.duration_ms, t.is_stream))
                .unwrap_or(0);
            (track, position)
        }
    };

    let current = match current {
        Some(track) => track,
        None => {
            // Error for a track we already moved past
            session.unlock();
            return;
        }
    };
    session.cancel_watchdog();

    if class == ErrorClass::Fatal {
        session
            .notify_channel(&format!(
                "Playback cannot continue: {} — shutting the player down",
                error.message
            ))
            .await;
        session.unlock();
        session.spawn_destroy("unrecoverable playback error");
        return;
    }

    let action = {
        let mut counters = session.counters.lock().await;
        recovery::decide(class, &mut counters, &session.params, Instant::now())
    };
    let resume_ms = if current.is_stream { 0 } else { position_ms };
    let title = current.title.clone();

    match action {
        RecoveryAction::Retry {
            cooldown,
            resume_position,
        } => {
            {
                let mut state = session.state.write().await;
                state
                    .store
                    .enqueue(Track::Resolved(current), QueuePosition::Head);
            }
            session
                .set_status_line(
                    format!("Retrying \"{}\" after an error: {}", title, error.cause),
                    "⚠️",
                )
                .await;
            session.broadcast_presence().await;

            let start = if resume_position { resume_ms } else { 0 };
            session.unlock();
            if session.sleep_cancellable(cooldown).await.is_err() {
                return;
            }
            if let Err(e) = session.advance_from(start).await {
                warn!(room = session.id, error = %e, "Retry advance failed");
            }
        }
        RecoveryAction::RotateNode => {
            let node = session.bound_node();
            node.mark_degraded(class, session.params.retry_quiet_period());
            {
                let mut state = session.state.write().await;
                state
                    .store
                    .enqueue(Track::Resolved(current), QueuePosition::Head);
            }
            info!(room = session.id, node = %node.id, ?class, "Rotating away from node");
            // locked stays held until migration finds a usable node
            session.begin_node_search(class, Some(node.id.clone()), resume_ms);
        }
        RecoveryAction::Skip => {
            {
                let mut state = session.state.write().await;
                state.store.record_failed(Track::Resolved(current));
            }
            session
                .notify_channel(&format!("\"{}\" could not be played; skipping", title))
                .await;
            session.unlock();
            if let Err(e) = session.advance().await {
                warn!(room = session.id, error = %e, "Advance after skip failed");
            }
        }
        RecoveryAction::Fatal => {
            session
                .notify_channel(&format!(
                    "Playback cannot continue: {} — shutting the player down",
                    error.message
                ))
                .await;
            session.unlock();
            session.spawn_destroy("unrecoverable playback error");
        }
    }
}

async fn on_transport_closed(session: &Arc<Session>, code: u16, reason: Option<String>) {
    match recovery::classify_transport(code) {
        TransportAction::Ignore => {
            debug!(room = session.id, code, "Benign transport close");
        }
        TransportAction::ReconnectVoice => {
            warn!(room = session.id, code, ?reason, "Voice session invalid; reconnecting");
            let voice_channel = {
                let mut state = session.state.write().await;
                state.voice_connected = false;
                state.voice_channel
            };
            if session
                .sleep_cancellable(std::time::Duration::from_secs(3))
                .await
                .is_err()
            {
                return;
            }
            if session.is_closing() {
                return;
            }
            match session.platform.join_voice(session.id, voice_channel).await {
                Ok(()) => {
                    session.state.write().await.voice_connected = true;
                }
                Err(e) => {
                    warn!(room = session.id, error = %e, "Voice reconnect failed");
                }
            }
        }
        TransportAction::RotateNode => {
            warn!(room = session.id, code, ?reason, "Transport closed; rotating node");
            if !session.try_lock_advance() {
                return;
            }
            session.state.write().await.voice_connected = false;

            let (position_ms, had_current) = {
                let mut state = session.state.write().await;
                match state.current.take() {
                    Some(track) => {
                        let pos = if track.is_stream {
                            0
                        } else {
                            state.clock.position_ms(track.duration_ms, track.is_stream)
                        };
                        state
                            .store
                            .enqueue(Track::Resolved(track), QueuePosition::Head);
                        (pos, true)
                    }
                    None => (0, false),
                }
            };
            if had_current {
                session.cancel_watchdog();
            }

            let node = session.bound_node();
            node.mark_degraded(ErrorClass::Network, session.params.retry_quiet_period());
            session.begin_node_search(ErrorClass::Network, Some(node.id.clone()), position_ms);
        }
    }
}
