//! Orchestrator scenario tests
//!
//! Drive sessions through a scriptable mock node and assert the state
//! machine's observable behavior: advancement, loop modes, idempotent
//! event handling, autoplay fallback, idle teardown, and position
//! bookkeeping.

mod helpers;

use cadenza_common::events::{LoopMode, PlaybackPhase, PresenceUpdate};
use cadenza_common::{Track, UnresolvedTrack};
use cadenza_player::node::client::{NodeEvent, TrackEndReason};
use cadenza_player::session::player::SessionOptions;
use cadenza_player::session::store::QueuePosition;
use helpers::{build_harness, build_harness_with, resolved, test_params, wait_until, wait_until_async};
use std::sync::Arc;

const ROOM: u64 = 42;

fn options() -> SessionOptions {
    SessionOptions {
        voice_channel: 100,
        text_channel: Some(200),
        owner: Some(7),
        autoplay: false,
        persistent: false,
        skin: None,
    }
}

/// Current track title and phase as seen by observers
async fn playing_title(session: &Arc<cadenza_player::session::Session>) -> Option<String> {
    match session.presence_snapshot().await {
        PresenceUpdate::Playing { track, .. } => Some(track.title),
        _ => None,
    }
}

#[tokio::test]
async fn finish_and_advance_moves_through_the_queue() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(
            vec![
                Track::Resolved(resolved("A", 180_000)),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();

    // advance() pulled the head
    wait_until(|| harness.client().play_count() == 1).await;
    assert_eq!(playing_title(&session).await.as_deref(), Some("A"));
    assert!(!session.is_locked());

    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );

    wait_until(|| harness.client().play_count() == 2).await;
    assert_eq!(playing_title(&session).await.as_deref(), Some("B"));

    // A landed in history, queue is empty
    let (queue, history, _, _) = session.ring_lengths().await;
    assert_eq!(queue, 0);
    assert_eq!(history, 1);
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.history[0].title(), "A");
}

#[tokio::test]
async fn duplicate_track_end_is_a_no_op() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(
            vec![
                Track::Resolved(resolved("A", 180_000)),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );
    wait_until(|| harness.client().play_count() == 2).await;

    // A second end event for A arrives late; B is current, nothing changes
    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(harness.client().play_count(), 2);
    assert_eq!(playing_title(&session).await.as_deref(), Some("B"));
    let (_, history, _, _) = session.ring_lengths().await;
    assert_eq!(history, 1);
}

#[tokio::test]
async fn repeat_queue_preserves_order() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();
    session.set_loop_mode(LoopMode::Queue).await.unwrap();

    session
        .enqueue_tracks(
            vec![
                Track::Resolved(resolved("A", 180_000)),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    for expected in ["h-A", "h-B"] {
        let count = harness.client().play_count();
        harness.client().inject(
            ROOM,
            NodeEvent::TrackEnded {
                handle: expected.into(),
                reason: TrackEndReason::Finished,
            },
        );
        wait_until(|| harness.client().play_count() == count + 1).await;
    }

    // Two completions later the rotation is back at A with B queued behind
    let handles: Vec<String> = harness
        .client()
        .plays
        .lock()
        .unwrap()
        .iter()
        .map(|(_, handle, _)| handle.clone())
        .collect();
    assert_eq!(handles, vec!["h-A", "h-B", "h-A"]);

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.queue.len(), 1);
    assert_eq!(snapshot.queue[0].title(), "B");
    // Repeat-queue reinsertions never leak into history
    let (_, history, _, _) = session.ring_lengths().await;
    assert_eq!(history, 0);
}

#[tokio::test]
async fn track_loop_counter_reinserts_at_head_and_decrements() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    let mut repeated = resolved("A", 180_000);
    repeated.loops = 2;
    session
        .enqueue_tracks(
            vec![
                Track::Resolved(repeated),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );
    wait_until(|| harness.client().play_count() == 2).await;

    // A replays ahead of B with one fewer repeat left
    assert_eq!(playing_title(&session).await.as_deref(), Some("A"));
    match session.presence_snapshot().await {
        PresenceUpdate::Playing { .. } => {}
        other => panic!("expected playing, got {other:?}"),
    }
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.current.as_ref().unwrap().loops, 1);
    assert_eq!(snapshot.queue[0].title(), "B");
}

#[tokio::test]
async fn autoplay_fallback_feeds_from_the_candidate_buffer() {
    let mut recommendation = UnresolvedTrack::new("Rec Song", "RecArtist");
    recommendation.duration_hint_ms = Some(200_000);
    recommendation.external_id = Some("ext-rec".into());
    let recommender = helpers::MockRecommender::new(vec![recommendation]);

    let harness = build_harness_with(
        test_params(),
        1,
        Some(Arc::clone(&recommender) as Arc<dyn cadenza_player::session::Recommender>),
        None,
    );
    let mut opts = options();
    opts.autoplay = true;
    let session = harness.registry.get_or_create(ROOM, opts).await.unwrap();

    // Resolution target for the recommended track
    let mut rec_resolved = resolved("Rec Song", 200_000);
    rec_resolved.external_id = Some("ext-rec-resolved".into());
    harness
        .client()
        .add_search("RecArtist - Rec Song", vec![rec_resolved]);

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 200_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );

    // Queue was empty: the next current comes out of the autoplay pipeline
    wait_until(|| harness.client().play_count() == 2).await;
    match session.presence_snapshot().await {
        PresenceUpdate::Playing { track, .. } => {
            assert_eq!(track.title, "Rec Song");
            assert!(track.autoplay);
        }
        other => panic!("expected playing, got {other:?}"),
    }
    assert!(recommender.calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn idle_teardown_after_timeout() {
    let mut params = test_params();
    params.idle_timeout_secs = 1;
    let harness = build_harness(params, 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );

    // Queue empty, autoplay off: idle timer arms and expires
    let registry = Arc::clone(&harness.registry);
    wait_until_async(|| {
        let registry = Arc::clone(&registry);
        async move { registry.get(ROOM).await.is_none() }
    })
    .await;

    assert!(session.is_closing());
    assert!(!harness.client().destroys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_into_idle_session_starts_playback_and_cancels_teardown() {
    let mut params = test_params();
    params.idle_timeout_secs = 1;
    let harness = build_harness(params, 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    // Session sits idle with the timer armed
    session.advance().await.unwrap();
    match session.presence_snapshot().await {
        PresenceUpdate::Idle { idle_deadline, .. } => assert!(idle_deadline.is_some()),
        other => panic!("expected idle, got {other:?}"),
    }

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    // Well past the original idle deadline the session is still alive
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert!(harness.registry.get(ROOM).await.is_some());
    assert!(!session.is_closing());
}

#[tokio::test]
async fn position_is_monotonic_and_duration_bounded() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    let first = session.position_ms().await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = session.position_ms().await;

    assert!(second >= first);
    assert!(second <= 180_000);
}

#[tokio::test]
async fn pause_freezes_the_position_clock() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    session.pause().await.unwrap();
    wait_until(|| {
        harness
            .client()
            .pauses
            .lock()
            .unwrap()
            .contains(&(ROOM, true))
    })
    .await;

    let frozen = session.position_ms().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(session.position_ms().await, frozen);

    session.resume().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(session.position_ms().await >= frozen);
}

#[tokio::test]
async fn skip_with_queued_material_advances_via_stop_event() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(
            vec![
                Track::Resolved(resolved("A", 180_000)),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    session.skip().await.unwrap();
    wait_until(|| !harness.client().stops.lock().unwrap().is_empty()).await;

    // The node acknowledges the stop with an end event
    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Stopped,
        },
    );

    wait_until(|| harness.client().play_count() == 2).await;
    assert_eq!(playing_title(&session).await.as_deref(), Some("B"));
}

#[tokio::test]
async fn back_replays_the_previous_track() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    session
        .enqueue_tracks(
            vec![
                Track::Resolved(resolved("A", 180_000)),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;
    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-A".into(),
            reason: TrackEndReason::Finished,
        },
    );
    wait_until(|| harness.client().play_count() == 2).await;

    session.play_previous().await.unwrap();
    harness.client().inject(
        ROOM,
        NodeEvent::TrackEnded {
            handle: "h-B".into(),
            reason: TrackEndReason::Stopped,
        },
    );

    wait_until(|| harness.client().play_count() == 3).await;
    assert_eq!(playing_title(&session).await.as_deref(), Some("A"));
}

#[tokio::test]
async fn auto_pause_and_resume_on_membership_changes() {
    let harness = build_harness(test_params(), 1);
    let mut opts = options();
    opts.persistent = true;
    let session = harness.registry.get_or_create(ROOM, opts).await.unwrap();

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    // Channel empties: persistent sessions pause instead of dying
    harness
        .platform
        .listeners
        .store(0, std::sync::atomic::Ordering::SeqCst);
    session.on_voice_membership(0).await;

    wait_until(|| {
        harness
            .client()
            .pauses
            .lock()
            .unwrap()
            .contains(&(ROOM, true))
    })
    .await;
    match session.presence_snapshot().await {
        PresenceUpdate::Playing { phase, .. } => assert_eq!(phase, PlaybackPhase::AutoPaused),
        other => panic!("expected auto-paused, got {other:?}"),
    }

    // A listener returns: playback restarts from the frozen position
    harness
        .platform
        .listeners
        .store(1, std::sync::atomic::Ordering::SeqCst);
    session.on_voice_membership(1).await;

    wait_until(|| harness.client().play_count() == 2).await;
    match session.presence_snapshot().await {
        PresenceUpdate::Playing { phase, .. } => assert_eq!(phase, PlaybackPhase::Playing),
        other => panic!("expected playing, got {other:?}"),
    }
    assert!(harness.registry.get(ROOM).await.is_some());
}

#[tokio::test]
async fn destroy_rejects_new_work_and_clears_state() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();
    let mut presence = session.subscribe_presence();

    session
        .enqueue_tracks(vec![Track::Resolved(resolved("A", 180_000))], QueuePosition::Tail)
        .await
        .unwrap();
    wait_until(|| harness.client().play_count() == 1).await;

    session.destroy("stopped by owner").await;

    assert!(session.is_closing());
    assert!(harness.registry.get(ROOM).await.is_none());
    let (queue, history, autoplay, failed) = session.ring_lengths().await;
    assert_eq!((queue, history, autoplay, failed), (0, 0, 0, 0));

    let err = session
        .enqueue_tracks(vec![Track::Resolved(resolved("B", 180_000))], QueuePosition::Tail)
        .await
        .unwrap_err();
    assert!(matches!(err, cadenza_player::Error::SessionClosing));

    // Observers saw the Closed update
    let mut saw_closed = false;
    while let Ok(update) = presence.try_recv() {
        if matches!(update, PresenceUpdate::Closed { .. }) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
}

#[tokio::test]
async fn unresolved_tracks_resolve_through_node_search() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    harness
        .client()
        .add_search("Artist - Needle", vec![resolved("Needle", 180_000)]);

    let mut request = UnresolvedTrack::new("Needle", "Artist");
    request.duration_hint_ms = Some(180_000);
    session
        .enqueue_tracks(vec![Track::Unresolved(request)], QueuePosition::Tail)
        .await
        .unwrap();

    wait_until(|| harness.client().play_count() == 1).await;
    let (_, handle, start) = harness.client().last_play().unwrap();
    assert_eq!(handle, "h-Needle");
    assert_eq!(start, 0);
}

#[tokio::test]
async fn failed_resolution_skips_to_the_next_entry() {
    let harness = build_harness(test_params(), 1);
    let session = harness
        .registry
        .get_or_create(ROOM, options())
        .await
        .unwrap();

    // No search result registered for the first request
    let request = UnresolvedTrack::new("Ghost", "Artist");
    session
        .enqueue_tracks(
            vec![
                Track::Unresolved(request),
                Track::Resolved(resolved("B", 180_000)),
            ],
            QueuePosition::Tail,
        )
        .await
        .unwrap();

    wait_until(|| harness.client().play_count() == 1).await;
    assert_eq!(playing_title(&session).await.as_deref(), Some("B"));

    let (_, _, _, failed) = session.ring_lengths().await;
    assert_eq!(failed, 1);
    // The user heard about it
    assert!(harness
        .platform
        .statuses
        .lock()
        .unwrap()
        .iter()
        .any(|(_, text)| text.contains("Ghost")));
}
