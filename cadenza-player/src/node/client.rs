//! Rendering-node client abstraction
//!
//! The orchestrator treats a rendering node as a black box behind the
//! `NodeClient` trait: request/response control calls plus one ordered
//! event stream. `Node` wraps a client with the bookkeeping the pool and
//! the sessions need — per-room event routing, availability, degraded-class
//! marking, and bound-player counts.

use crate::error::{Error, Result};
use crate::session::recovery::{ErrorClass, TrackError};
use crate::RoomId;
use async_trait::async_trait;
use cadenza_common::{PlaylistInfo, ResolvedTrack};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why the node reported a track as ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackEndReason {
    /// Ran to completion
    Finished,
    /// Stopped by a control call (skip, replace, destroy)
    Stopped,
    /// Anything else the node reports (cleanup, replaced upstream)
    Other,
}

/// Lifecycle event for one session's playback on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum NodeEvent {
    TrackStarted {
        handle: String,
    },
    TrackEnded {
        handle: String,
        reason: TrackEndReason,
    },
    TrackErrored {
        handle: String,
        error: TrackError,
    },
    TrackStuck {
        handle: String,
        threshold_ms: u64,
    },
    TransportClosed {
        code: u16,
        reason: Option<String>,
    },
}

/// Event plus the room it belongs to, as read off the node's stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMessage {
    pub room: RoomId,
    #[serde(flatten)]
    pub event: NodeEvent,
}

/// Result of a search/load call against a node
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    /// Set when the query resolved to a whole playlist
    pub playlist: Option<PlaylistInfo>,
    pub tracks: Vec<ResolvedTrack>,
}

impl SearchResult {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Load/health statistics reported by a node
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub players: u32,
    pub ping_ms: Option<u32>,
}

/// Audio filter settings passed through to the node verbatim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(pub serde_json::Value);

/// Request/response surface of a rendering node.
///
/// Implementations own their transport; the one ordered event stream is
/// handed out once via `take_events` and pumped by `Node::start_event_pump`.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Resolve a query (search terms or URI) into playable tracks
    async fn search(&self, query: &str) -> Result<SearchResult>;

    /// Start or restart playback for a room at the given offset
    async fn play(&self, room: RoomId, handle: &str, start_ms: u64) -> Result<()>;

    /// Stop the room's playback; the node emits TrackEnded(stopped)
    async fn stop(&self, room: RoomId) -> Result<()>;

    async fn pause(&self, room: RoomId, paused: bool) -> Result<()>;

    async fn set_filters(&self, room: RoomId, filters: &Filters) -> Result<()>;

    /// Tear down all node-side state for the room
    async fn destroy(&self, room: RoomId) -> Result<()>;

    async fn stats(&self) -> Result<NodeStats>;

    /// The node's ordered event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeMessage>>;
}

/// A rendering node as seen by the pool and the sessions bound to it.
pub struct Node {
    pub id: String,
    client: Arc<dyn NodeClient>,
    /// Per-room event routes; the pump forwards each message to the
    /// session that registered the room
    routes: Mutex<HashMap<RoomId, mpsc::UnboundedSender<NodeEvent>>>,
    players: AtomicUsize,
    available: AtomicBool,
    /// Error classes this node is considered degraded for, with expiry
    degraded: Mutex<HashMap<ErrorClass, Instant>>,
    /// Last transport latency reported by the stats poll
    ping_ms: Mutex<Option<u32>>,
    me: std::sync::Weak<Node>,
}

impl Node {
    pub fn new(id: impl Into<String>, client: Arc<dyn NodeClient>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: id.into(),
            client,
            routes: Mutex::new(HashMap::new()),
            players: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            degraded: Mutex::new(HashMap::new()),
            ping_ms: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn ping_ms(&self) -> Option<u32> {
        *self.ping_ms.lock().expect("ping poisoned")
    }

    pub fn record_ping(&self, ping_ms: Option<u32>) {
        *self.ping_ms.lock().expect("ping poisoned") = ping_ms;
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of sessions currently bound to this node
    pub fn player_count(&self) -> usize {
        self.players.load(Ordering::Acquire)
    }

    /// Mark this node degraded for one error class until the deadline
    pub fn mark_degraded(&self, class: ErrorClass, ttl: Duration) {
        let mut degraded = self.degraded.lock().expect("degraded map poisoned");
        degraded.insert(class, Instant::now() + ttl);
        warn!(node = %self.id, ?class, "Node marked degraded");
    }

    pub fn is_degraded(&self, class: ErrorClass) -> bool {
        let mut degraded = self.degraded.lock().expect("degraded map poisoned");
        match degraded.get(&class) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                degraded.remove(&class);
                false
            }
            None => false,
        }
    }

    /// Register a session's event route and count it as a bound player
    pub fn attach(&self, room: RoomId, tx: mpsc::UnboundedSender<NodeEvent>) {
        let mut routes = self.routes.lock().expect("routes poisoned");
        if routes.insert(room, tx).is_none() {
            self.players.fetch_add(1, Ordering::AcqRel);
        }
        debug!(node = %self.id, room, "Session attached");
    }

    pub fn detach(&self, room: RoomId) {
        let mut routes = self.routes.lock().expect("routes poisoned");
        if routes.remove(&room).is_some() {
            self.players.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(node = %self.id, room, "Session detached");
    }

    /// Pump the client's event stream into per-room routes.
    ///
    /// One pump per node for its whole lifetime; per-room ordering is
    /// preserved because a single task forwards into single-consumer
    /// channels. When the stream ends the node is marked unavailable.
    pub fn start_event_pump(&self) -> Result<tokio::task::JoinHandle<()>> {
        let mut events = self
            .client
            .take_events()
            .ok_or_else(|| Error::Node(format!("event stream for {} already taken", self.id)))?;

        let node = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Node("node dropped before pump start".into()))?;
        Ok(tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                let tx = {
                    let routes = node.routes.lock().expect("routes poisoned");
                    routes.get(&message.room).cloned()
                };
                match tx {
                    Some(tx) => {
                        // Session gone mid-delivery is fine; route cleanup
                        // happens on detach
                        let _ = tx.send(message.event);
                    }
                    None => {
                        debug!(node = %node.id, room = message.room, "Dropping event for unrouted room");
                    }
                }
            }
            warn!(node = %node.id, "Event stream ended; marking node unavailable");
            node.set_available(false);
        }))
    }

    /// Poll the node's stats at a fixed interval, keeping ping and
    /// availability fresh. One poll task per node.
    pub fn start_stats_poll(&self, interval: Duration) -> Result<tokio::task::JoinHandle<()>> {
        let node = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Node("node dropped before stats poll start".into()))?;

        Ok(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match node.client.stats().await {
                    Ok(stats) => {
                        node.record_ping(stats.ping_ms);
                        node.set_available(true);
                    }
                    Err(e) => {
                        debug!(node = %node.id, error = %e, "Stats poll failed");
                        node.record_ping(None);
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("players", &self.player_count())
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::recovery::Severity;

    struct NoopClient {
        events: Mutex<Option<mpsc::UnboundedReceiver<NodeMessage>>>,
    }

    impl NoopClient {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<NodeMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    events: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl NodeClient for NoopClient {
        async fn search(&self, _query: &str) -> Result<SearchResult> {
            Ok(SearchResult::default())
        }
        async fn play(&self, _room: RoomId, _handle: &str, _start_ms: u64) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _room: RoomId) -> Result<()> {
            Ok(())
        }
        async fn pause(&self, _room: RoomId, _paused: bool) -> Result<()> {
            Ok(())
        }
        async fn set_filters(&self, _room: RoomId, _filters: &Filters) -> Result<()> {
            Ok(())
        }
        async fn destroy(&self, _room: RoomId) -> Result<()> {
            Ok(())
        }
        async fn stats(&self) -> Result<NodeStats> {
            Ok(NodeStats::default())
        }
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeMessage>> {
            self.events.lock().unwrap().take()
        }
    }

    #[tokio::test]
    async fn pump_routes_events_by_room() {
        let (client, events_tx) = NoopClient::new();
        let node = Node::new("n1", client);
        let _pump = node.start_event_pump().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        node.attach(7, tx);

        events_tx
            .send(NodeMessage {
                room: 7,
                event: NodeEvent::TrackStarted {
                    handle: "h1".into(),
                },
            })
            .unwrap();
        // Event for a room nobody registered is dropped
        events_tx
            .send(NodeMessage {
                room: 9,
                event: NodeEvent::TrackStarted {
                    handle: "h2".into(),
                },
            })
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, NodeEvent::TrackStarted { ref handle } if handle == "h1"));
    }

    #[tokio::test]
    async fn attach_detach_tracks_player_count() {
        let (client, _events_tx) = NoopClient::new();
        let node = Node::new("n1", client);

        let (tx, _rx) = mpsc::unbounded_channel();
        node.attach(1, tx.clone());
        node.attach(1, tx.clone()); // re-attach same room does not double count
        assert_eq!(node.player_count(), 1);

        node.attach(2, tx);
        assert_eq!(node.player_count(), 2);

        node.detach(1);
        assert_eq!(node.player_count(), 1);
    }

    #[tokio::test]
    async fn degraded_marking_expires() {
        let (client, _events_tx) = NoopClient::new();
        let node = Node::new("n1", client);

        node.mark_degraded(ErrorClass::RateLimited, Duration::from_millis(10));
        assert!(node.is_degraded(ErrorClass::RateLimited));
        assert!(!node.is_degraded(ErrorClass::Network));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!node.is_degraded(ErrorClass::RateLimited));
    }

    #[test]
    fn node_message_serde_shape() {
        let msg = NodeMessage {
            room: 3,
            event: NodeEvent::TrackErrored {
                handle: "h".into(),
                error: TrackError {
                    message: "failed".into(),
                    cause: "read timed out".into(),
                    severity: Severity::Suspicious,
                },
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["room"], 3);
        assert_eq!(json["event"], "TrackErrored");
    }
}
