//! Idle and empty-channel supervision, plus the auto-skip watchdog
//!
//! Two independent timers: the idle-queue timer tears the session down when
//! nothing was enqueued while idle, the empty-channel timer reacts to the
//! voice channel losing its last eligible listener. The watchdog covers for
//! a node that never delivers its end-of-track event.

use crate::session::events::force_track_end;
use crate::session::player::Session;
use cadenza_common::events::PlaybackPhase;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Session {
    /// Arm the idle-queue timer.
    ///
    /// Skipped in persistent mode and while autoplay is on — those sessions
    /// stay alive with an empty queue.
    pub(crate) async fn arm_idle_timer(&self) {
        let skip = {
            let state = self.state.read().await;
            state.persistent || state.autoplay
        };
        if skip || self.is_closing() {
            return;
        }

        let timeout = self.params.idle_timeout();
        {
            let mut state = self.state.write().await;
            state.idle_deadline = Some(
                chrono::Utc::now()
                    + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
            );
        }

        let session = self.arc();
        let handle = tokio::spawn(async move {
            if session.sleep_cancellable(timeout).await.is_err() {
                return;
            }
            if session.is_closing() {
                return;
            }
            let still_idle = session.state.read().await.current.is_none();
            if still_idle {
                info!(room = session.id, "Idle timeout expired");
                session
                    .notify_channel("Player shut down after inactivity")
                    .await;
                session.spawn_destroy("idle timeout");
            }
        });
        self.store_idle_task(handle);
    }

    /// React to a change in the voice channel's eligible listener count.
    ///
    /// Zero listeners arms the empty-channel timer; a listener reappearing
    /// cancels it and resumes auto-paused playback.
    pub async fn on_voice_membership(&self, listeners: usize) {
        if self.is_closing() {
            return;
        }

        if listeners > 0 {
            self.cancel_members_timer();
            let auto_paused = self.state.read().await.auto_paused;
            if auto_paused {
                if let Err(e) = self.resume_from_auto_pause().await {
                    warn!(room = self.id, error = %e, "Auto-resume failed");
                }
            }
            return;
        }

        let already_auto_paused = self.state.read().await.auto_paused;
        if already_auto_paused {
            return;
        }

        debug!(room = self.id, "Voice channel empty; arming members timer");
        let session = self.arc();
        let grace = self.params.members_timeout();
        let handle = tokio::spawn(async move {
            if session.sleep_cancellable(grace).await.is_err() {
                return;
            }
            if session.is_closing() {
                return;
            }

            // Re-check before acting: listeners may have rejoined without a
            // membership report reaching us
            let voice_channel = session.state.read().await.voice_channel;
            match session.platform.eligible_listeners(voice_channel).await {
                Ok(n) if n > 0 => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(room = session.id, error = %e, "Listener census failed");
                    return;
                }
            }

            let persistent = session.state.read().await.persistent;
            if persistent {
                if let Err(e) = session.enter_auto_pause().await {
                    warn!(room = session.id, error = %e, "Auto-pause failed");
                }
            } else {
                session
                    .notify_channel("Player shut down: the voice channel is empty")
                    .await;
                session.spawn_destroy("empty voice channel");
            }
        });
        self.store_members_task(handle);
    }

    /// Pause because the channel emptied; position freezes for the resume.
    pub(crate) async fn enter_auto_pause(&self) -> crate::error::Result<()> {
        {
            let mut state = self.state.write().await;
            if state.auto_paused || state.paused {
                return Ok(());
            }
            state.auto_paused = true;
            state.phase = PlaybackPhase::AutoPaused;
            state.clock.freeze();
        }
        self.cancel_watchdog();

        let node = self.bound_node();
        let _ = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().pause(self.id, true),
        )
        .await;

        info!(room = self.id, "Auto-paused: empty voice channel");
        self.set_status_line(
            "Paused while the channel is empty; playback resumes when someone joins",
            "🔋",
        )
        .await;
        self.broadcast_presence().await;
        Ok(())
    }

    /// A listener came back: restart the current track from the frozen
    /// position (zero for streams), or pull the next entry if none.
    pub(crate) async fn resume_from_auto_pause(&self) -> crate::error::Result<()> {
        let (current, resume_ms) = {
            let mut state = self.state.write().await;
            if !state.auto_paused {
                return Ok(());
            }
            state.auto_paused = false;
            state.paused = false;
            let (current, resume_ms, phase) = match &state.current {
                Some(track) => {
                    let pos = if track.is_stream {
                        0
                    } else {
                        state.clock.position_ms(track.duration_ms, track.is_stream)
                    };
                    (Some(track.clone()), pos, PlaybackPhase::Playing)
                }
                None => (None, 0, PlaybackPhase::Idle),
            };
            state.phase = phase;
            (current, resume_ms)
        };

        match current {
            Some(track) => {
                let node = self.bound_node();
                tokio::time::timeout(
                    self.params.node_request_timeout(),
                    node.client().play(self.id, track.handle.as_str(), resume_ms),
                )
                .await
                .map_err(|_| crate::error::Error::Node("resume play timed out".into()))??;

                self.state.write().await.clock.reset(resume_ms);
                self.set_status_line("Playback resumed", "🔰").await;
                self.arm_watchdog().await;
                self.broadcast_presence().await;
                Ok(())
            }
            None => self.advance().await,
        }
    }

    /// Arm the auto-skip watchdog for the current track.
    ///
    /// Sleeps until the expected end plus slack; if the end event never
    /// arrived it synthesizes the advance and counts the intervention.
    pub(crate) async fn arm_watchdog(&self) {
        let remaining = {
            let state = self.state.read().await;
            match &state.current {
                Some(track) if !track.is_stream => {
                    let position = state.clock.position_ms(track.duration_ms, track.is_stream);
                    Some(Duration::from_millis(
                        track.duration_ms.saturating_sub(position),
                    ))
                }
                _ => None,
            }
        };
        let Some(remaining) = remaining else {
            self.cancel_watchdog();
            return;
        };

        let slack = Duration::from_secs(self.params.watchdog_slack_secs);
        let session = self.arc();
        let handle = tokio::spawn(async move {
            if session.sleep_cancellable(remaining + slack).await.is_err() {
                return;
            }
            if session.is_closing() {
                return;
            }
            let stalled = {
                let state = session.state.read().await;
                state.phase == PlaybackPhase::Playing && !state.paused && state.current.is_some()
            };
            if !stalled {
                return;
            }

            // Own handle out of the slot first, so the advance we trigger
            // can arm a fresh watchdog without aborting us mid-run
            session.disarm_watchdog_slot();
            session.note_watchdog_intervention();
            warn!(
                room = session.id,
                interventions = session.watchdog_interventions(),
                "End event never arrived; forcing advance"
            );
            force_track_end(&session).await;
        });
        self.store_watchdog_task(handle);
    }
}
