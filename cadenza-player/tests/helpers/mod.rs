//! Test helpers: scriptable mock node, platform, and recommender
#![allow(dead_code)]

use async_trait::async_trait;
use cadenza_common::{PlayerParams, ResolvedTrack, TrackHandle, UnresolvedTrack};
use cadenza_player::error::{Error, Result};
use cadenza_player::node::client::{
    Filters, Node, NodeClient, NodeEvent, NodeMessage, NodeStats, SearchResult,
};
use cadenza_player::node::pool::NodePool;
use cadenza_player::persist::SnapshotStore;
use cadenza_player::platform::{ChannelId, ChatPlatform};
use cadenza_player::registry::SessionRegistry;
use cadenza_player::session::{Recommender, SeedInfo};
use cadenza_player::RoomId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scriptable rendering-node client: records control calls, serves canned
/// search results, and lets tests inject lifecycle events.
pub struct MockNodeClient {
    pub plays: Mutex<Vec<(RoomId, String, u64)>>,
    pub stops: Mutex<Vec<RoomId>>,
    pub pauses: Mutex<Vec<(RoomId, bool)>>,
    pub destroys: Mutex<Vec<RoomId>>,
    searches: Mutex<HashMap<String, Vec<ResolvedTrack>>>,
    fail_plays: AtomicUsize,
    events_tx: mpsc::UnboundedSender<NodeMessage>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeMessage>>>,
}

impl MockNodeClient {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            plays: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            pauses: Mutex::new(Vec::new()),
            destroys: Mutex::new(Vec::new()),
            searches: Mutex::new(HashMap::new()),
            fail_plays: AtomicUsize::new(0),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn add_search(&self, query: &str, tracks: Vec<ResolvedTrack>) {
        self.searches
            .lock()
            .unwrap()
            .insert(query.to_string(), tracks);
    }

    /// Make the next `n` play requests fail
    pub fn fail_next_plays(&self, n: usize) {
        self.fail_plays.store(n, Ordering::SeqCst);
    }

    pub fn inject(&self, room: RoomId, event: NodeEvent) {
        self.events_tx
            .send(NodeMessage { room, event })
            .expect("event pump gone");
    }

    pub fn play_count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }

    pub fn last_play(&self) -> Option<(RoomId, String, u64)> {
        self.plays.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn search(&self, query: &str) -> Result<SearchResult> {
        let tracks = self
            .searches
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default();
        Ok(SearchResult {
            playlist: None,
            tracks,
        })
    }

    async fn play(&self, room: RoomId, handle: &str, start_ms: u64) -> Result<()> {
        if self
            .fail_plays
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Node("injected play failure".into()));
        }
        self.plays
            .lock()
            .unwrap()
            .push((room, handle.to_string(), start_ms));
        Ok(())
    }

    async fn stop(&self, room: RoomId) -> Result<()> {
        self.stops.lock().unwrap().push(room);
        Ok(())
    }

    async fn pause(&self, room: RoomId, paused: bool) -> Result<()> {
        self.pauses.lock().unwrap().push((room, paused));
        Ok(())
    }

    async fn set_filters(&self, _room: RoomId, _filters: &Filters) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, room: RoomId) -> Result<()> {
        self.destroys.lock().unwrap().push(room);
        Ok(())
    }

    async fn stats(&self) -> Result<NodeStats> {
        Ok(NodeStats::default())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeMessage>> {
        self.events_rx.lock().unwrap().take()
    }
}

/// Chat platform recording status lines, with a settable listener count
pub struct MockPlatform {
    pub statuses: Mutex<Vec<(ChannelId, String)>>,
    pub listeners: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(Vec::new()),
            listeners: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    async fn send_status(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((channel, text.to_string()));
        Ok(())
    }

    async fn join_voice(&self, _room: RoomId, _channel: ChannelId) -> Result<()> {
        Ok(())
    }

    async fn leave_voice(&self, _room: RoomId) -> Result<()> {
        Ok(())
    }

    async fn eligible_listeners(&self, _channel: ChannelId) -> Result<usize> {
        Ok(self.listeners.load(Ordering::SeqCst))
    }

    async fn set_voice_status(&self, _channel: ChannelId, _status: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Recommender returning a canned list (empty means "nothing found")
pub struct MockRecommender {
    pub results: Mutex<Vec<UnresolvedTrack>>,
    pub calls: AtomicUsize,
}

impl MockRecommender {
    pub fn new(results: Vec<UnresolvedTrack>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Recommender for MockRecommender {
    async fn recommend(&self, _seeds: &[SeedInfo]) -> Result<Vec<UnresolvedTrack>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.lock().unwrap().clone())
    }
}

/// One mock node plus everything a session needs around it
pub struct TestHarness {
    pub registry: Arc<SessionRegistry>,
    pub pool: Arc<NodePool>,
    pub clients: Vec<Arc<MockNodeClient>>,
    pub platform: Arc<MockPlatform>,
}

impl TestHarness {
    pub fn client(&self) -> &Arc<MockNodeClient> {
        &self.clients[0]
    }
}

/// Fast-running parameter set for scenario tests
pub fn test_params() -> PlayerParams {
    PlayerParams {
        idle_timeout_secs: 60,
        members_timeout_secs: 0,
        retry_cooldown_base_secs: 0,
        resolve_failure_cooldown_secs: 0,
        node_wait_interval_secs: 0,
        node_request_timeout_secs: 5,
        autoplay_recommend_backoff_secs: 0,
        watchdog_slack_secs: 60,
        snapshot_interval_secs: 3600,
        presence_heartbeat_secs: 3600,
        ..PlayerParams::default()
    }
}

pub fn build_harness(params: PlayerParams, node_count: usize) -> TestHarness {
    build_harness_with(params, node_count, None, None)
}

pub fn build_harness_with(
    params: PlayerParams,
    node_count: usize,
    recommender: Option<Arc<dyn Recommender>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
) -> TestHarness {
    let pool = Arc::new(NodePool::new());
    let mut clients = Vec::new();
    for i in 0..node_count {
        let client = MockNodeClient::new();
        let node = Node::new(format!("n{}", i + 1), Arc::clone(&client) as Arc<dyn NodeClient>);
        node.start_event_pump().expect("event pump");
        pool.register(node);
        clients.push(client);
    }

    let platform = MockPlatform::new();
    let registry = SessionRegistry::new(
        Arc::clone(&pool),
        Arc::clone(&platform) as Arc<dyn ChatPlatform>,
        recommender,
        snapshots,
        Arc::new(params),
    );

    TestHarness {
        registry,
        pool,
        clients,
        platform,
    }
}

/// A resolved track ready to enqueue
pub fn resolved(title: &str, duration_ms: u64) -> ResolvedTrack {
    ResolvedTrack {
        request_id: uuid::Uuid::new_v4(),
        handle: TrackHandle(format!("h-{title}")),
        uri: Some(format!("https://example.com/{title}")),
        title: title.to_string(),
        author: "Artist".into(),
        duration_ms,
        is_stream: false,
        thumbnail: None,
        external_id: Some(format!("ext-{title}")),
        source: "soundcloud".into(),
        requested_by: Some(1),
        loops: 0,
        autoplay: false,
        related: None,
        playlist: None,
    }
}

/// Poll until the condition holds or two seconds pass
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

/// Poll an async probe until it returns true or two seconds pass
pub async fn wait_until_async<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}
