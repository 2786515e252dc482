//! REST + SSE rendering-node client
//!
//! Control calls go over plain REST; lifecycle events arrive on a
//! server-sent-event stream that a background reader task parses and feeds
//! into the client's ordered event channel. The reader reconnects with
//! truncated exponential backoff and gives up only when the client is
//! dropped.

use super::client::{Filters, NodeClient, NodeMessage, NodeStats, SearchResult};
use crate::error::{Error, Result};
use crate::RoomId;
use async_trait::async_trait;
use cadenza_common::{PlaylistInfo, ResolvedTrack, TrackHandle};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection settings for one rendering node
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Base URL, e.g. `http://10.0.0.5:2333`
    pub url: String,
    pub password: Option<String>,
}

/// Wire form of a loaded track
#[derive(Debug, Deserialize)]
struct LoadedTrack {
    handle: String,
    title: String,
    author: String,
    duration_ms: u64,
    #[serde(default)]
    is_stream: bool,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    source: String,
}

/// Wire form of a load/search response
#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    playlist: Option<PlaylistWire>,
    #[serde(default)]
    tracks: Vec<LoadedTrack>,
}

#[derive(Debug, Deserialize)]
struct PlaylistWire {
    name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
}

impl LoadedTrack {
    fn into_resolved(self) -> ResolvedTrack {
        ResolvedTrack {
            request_id: uuid::Uuid::new_v4(),
            handle: TrackHandle(self.handle),
            uri: self.uri,
            title: self.title,
            author: self.author,
            duration_ms: self.duration_ms,
            is_stream: self.is_stream,
            thumbnail: self.thumbnail,
            external_id: self.external_id,
            source: self.source,
            requested_by: None,
            loops: 0,
            autoplay: false,
            related: None,
            playlist: None,
        }
    }
}

/// REST client for one rendering node
pub struct RestNodeClient {
    http: reqwest::Client,
    base: String,
    password: Option<String>,
    events: Mutex<Option<mpsc::UnboundedReceiver<NodeMessage>>>,
    cancel: CancellationToken,
}

impl RestNodeClient {
    /// Build the client and start the background event-stream reader.
    pub fn connect(config: &NodeConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let client = Arc::new(Self {
            http: reqwest::Client::new(),
            base: config.url.trim_end_matches('/').to_string(),
            password: config.password.clone(),
            events: Mutex::new(Some(rx)),
            cancel: cancel.clone(),
        });

        tokio::spawn(event_stream_reader(
            client.http.clone(),
            format!("{}/v1/events", client.base),
            client.password.clone(),
            tx,
            cancel,
        ));

        client
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.password {
            Some(password) => req.header("Authorization", password),
            None => req,
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}{}", self.base, path);
        self.authorized(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Node(format!("POST {path}: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Node(format!("POST {path}: {e}")))?;
        Ok(())
    }
}

impl Drop for RestNodeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl NodeClient for RestNodeClient {
    async fn search(&self, query: &str) -> Result<SearchResult> {
        let url = format!("{}/v1/loadtracks", self.base);
        let response = self
            .authorized(self.http.get(&url).query(&[("query", query)]))
            .send()
            .await
            .map_err(|e| Error::Node(format!("search: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Node(format!("search: {e}")))?
            .json::<LoadResponse>()
            .await
            .map_err(|e| Error::Node(format!("search decode: {e}")))?;

        let playlist = response.playlist.map(|p| PlaylistInfo {
            name: p.name,
            url: p.url,
            thumbnail: p.thumbnail,
        });

        Ok(SearchResult {
            playlist,
            tracks: response
                .tracks
                .into_iter()
                .map(LoadedTrack::into_resolved)
                .collect(),
        })
    }

    async fn play(&self, room: RoomId, handle: &str, start_ms: u64) -> Result<()> {
        self.post_json(
            &format!("/v1/rooms/{room}/play"),
            &serde_json::json!({ "handle": handle, "start_ms": start_ms }),
        )
        .await
    }

    async fn stop(&self, room: RoomId) -> Result<()> {
        self.post_json(&format!("/v1/rooms/{room}/stop"), &serde_json::json!({}))
            .await
    }

    async fn pause(&self, room: RoomId, paused: bool) -> Result<()> {
        self.post_json(
            &format!("/v1/rooms/{room}/pause"),
            &serde_json::json!({ "paused": paused }),
        )
        .await
    }

    async fn set_filters(&self, room: RoomId, filters: &Filters) -> Result<()> {
        self.post_json(
            &format!("/v1/rooms/{room}/filters"),
            &serde_json::json!({ "filters": filters }),
        )
        .await
    }

    async fn destroy(&self, room: RoomId) -> Result<()> {
        let url = format!("{}/v1/rooms/{room}", self.base);
        self.authorized(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| Error::Node(format!("destroy: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Node(format!("destroy: {e}")))?;
        Ok(())
    }

    async fn stats(&self) -> Result<NodeStats> {
        let url = format!("{}/v1/stats", self.base);
        self.authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::Node(format!("stats: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Node(format!("stats: {e}")))?
            .json::<NodeStats>()
            .await
            .map_err(|e| Error::Node(format!("stats decode: {e}")))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeMessage>> {
        self.events.lock().expect("events receiver poisoned").take()
    }
}

/// Read the node's SSE stream forever, reconnecting with backoff.
///
/// Each `data:` line is one JSON-encoded `NodeMessage`. Per-connection
/// ordering is preserved; messages lost between connections are gone, which
/// downstream handles the same way as any missed event (watchdog advance).
async fn event_stream_reader(
    http: reqwest::Client,
    url: String,
    password: Option<String>,
    tx: mpsc::UnboundedSender<NodeMessage>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let request = {
            let req = http.get(&url);
            match &password {
                Some(p) => req.header("Authorization", p.clone()),
                None => req,
            }
        };

        match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                info!(%url, "Node event stream connected");
                attempt = 0;
                let mut stream = response.bytes_stream();
                let mut buffer = String::new();

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(pos) = buffer.find('\n') {
                                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                                    buffer.drain(..=pos);
                                    if let Some(data) = line.strip_prefix("data:") {
                                        match serde_json::from_str::<NodeMessage>(data.trim()) {
                                            Ok(message) => {
                                                if tx.send(message).is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => {
                                                debug!(%url, error = %e, "Skipping unparsable event line");
                                            }
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(%url, error = %e, "Node event stream read error");
                                break;
                            }
                            None => {
                                warn!(%url, "Node event stream closed");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "Node event stream connect failed");
            }
        }

        // Truncated exponential backoff before reconnecting
        attempt = (attempt + 1).min(6);
        let delay = Duration::from_secs(1u64 << attempt);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
