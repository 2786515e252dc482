//! Autoplay engine
//!
//! Derives continuation candidates from recent listening history: pop from
//! the precomputed buffer when possible, otherwise seed the recommendation
//! collaborator with recent history samples (falling back to a same-source
//! related-content search on the bound node), filter, buffer, and return
//! the first candidate.

use crate::error::{Error, Result};
use crate::session::player::Session;
use async_trait::async_trait;
use cadenza_common::track::RelatedTrack;
use cadenza_common::{Track, UnresolvedTrack};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tags that mark a result as a non-canonical rendition
const NON_CANONICAL_TAGS: [&str; 5] = ["remix", "edit", "extend", "compilation", "mashup"];

pub(crate) fn has_noncanonical_tag(title: &str) -> bool {
    let lower = title.to_ascii_lowercase();
    NON_CANONICAL_TAGS.iter().any(|tag| lower.contains(tag))
}

/// Seed handed to the recommendation collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedInfo {
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub source: String,
    pub uri: Option<String>,
}

/// Recommendation collaborator: seeds in, continuation candidates out.
/// Ranking is the collaborator's business.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, seeds: &[SeedInfo]) -> Result<Vec<UnresolvedTrack>>;
}

/// HTTP-backed recommender
pub struct HttpRecommender {
    http: reqwest::Client,
    url: String,
}

impl HttpRecommender {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecommendationWire {
    title: String,
    author: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[async_trait]
impl Recommender for HttpRecommender {
    async fn recommend(&self, seeds: &[SeedInfo]) -> Result<Vec<UnresolvedTrack>> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "seeds": seeds }))
            .send()
            .await
            .map_err(|e| Error::Recommend(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Recommend(e.to_string()))?
            .json::<Vec<RecommendationWire>>()
            .await
            .map_err(|e| Error::Recommend(format!("decode: {e}")))?;

        Ok(response
            .into_iter()
            .map(|r| {
                let mut track = UnresolvedTrack::new(r.title, r.author);
                track.uri = r.uri;
                track.duration_hint_ms = r.duration_ms;
                track.thumbnail = r.thumbnail;
                track.external_id = r.external_id;
                track.source = r.source;
                track
            })
            .collect())
    }
}

/// Filter raw continuation candidates against the seeds: drop streams and
/// short clips, drop anything already in the seed set (by external id),
/// and drop non-canonical renditions when at least one clean match exists.
pub(crate) fn filter_candidates(
    candidates: Vec<Track>,
    seeds: &[SeedInfo],
    min_duration_ms: u64,
) -> Vec<Track> {
    let surviving: Vec<Track> = candidates
        .into_iter()
        .filter(|t| !t.is_stream())
        .filter(|t| t.duration_ms().map_or(true, |d| d >= min_duration_ms))
        .filter(|t| {
            t.external_id()
                .map_or(true, |id| !seeds.iter().any(|s| s.external_id == id))
        })
        .collect();

    let has_clean = surviving.iter().any(|t| !has_noncanonical_tag(t.title()));
    if has_clean {
        surviving
            .into_iter()
            .filter(|t| !has_noncanonical_tag(t.title()))
            .collect()
    } else {
        surviving
    }
}

impl Session {
    /// Produce the next autoplay candidate, or None when nothing can be
    /// derived. Caller holds the advance lock.
    pub(crate) async fn next_autoplay_candidate(&self) -> Option<Track> {
        {
            let mut state = self.state.write().await;
            if let Some(track) = state.store.pop_autoplay_candidate() {
                return Some(track);
            }
        }

        let seeds = self.collect_seeds().await;
        if seeds.is_empty() {
            debug!(room = self.id, "No eligible autoplay seeds");
            return None;
        }

        let mut candidates = self.recommend_with_retries(&seeds).await;
        if candidates.is_empty() {
            candidates = self.related_search_fallback(&seeds).await;
        }

        let related = RelatedTrack {
            title: seeds[0].title.clone(),
            uri: seeds[0].uri.clone(),
        };
        let mut filtered =
            filter_candidates(candidates, &seeds, self.params.autoplay_min_seed_ms);
        for track in &mut filtered {
            match track {
                Track::Unresolved(t) => {
                    t.autoplay = true;
                }
                Track::Resolved(t) => {
                    t.autoplay = true;
                    t.related = Some(related.clone());
                }
            }
        }

        if filtered.is_empty() {
            self.notify_channel("Could not fetch autoplay suggestions; going idle")
                .await;
            return None;
        }

        let mut state = self.state.write().await;
        state.store.record_autoplay_candidates(filtered);
        state.store.pop_autoplay_candidate()
    }

    /// Sample recent history (and buffered candidates) for seeds: most
    /// recent first, long enough to carry a signal, bounded count.
    async fn collect_seeds(&self) -> Vec<SeedInfo> {
        let state = self.state.read().await;
        let min = self.params.autoplay_min_seed_ms;
        let max = self.params.autoplay_seed_count;

        state
            .store
            .history()
            .chain(state.store.autoplay_candidates())
            .filter(|t| t.duration_ms().map_or(false, |d| d >= min))
            .filter_map(|t| {
                let external_id = t.external_id()?;
                Some(SeedInfo {
                    external_id: external_id.to_string(),
                    title: t.title().to_string(),
                    author: t.author().to_string(),
                    source: match t {
                        Track::Resolved(r) => r.source.clone(),
                        Track::Unresolved(u) => u.source.clone().unwrap_or_default(),
                    },
                    uri: t.uri().map(|u| u.to_string()),
                })
            })
            .take(max)
            .collect()
    }

    /// Bounded attempts against the recommendation collaborator
    async fn recommend_with_retries(&self, seeds: &[SeedInfo]) -> Vec<Track> {
        let Some(recommender) = &self.recommender else {
            return Vec::new();
        };

        let attempts = self.params.autoplay_recommend_attempts.max(1);
        for attempt in 1..=attempts {
            let call = tokio::time::timeout(
                self.params.node_request_timeout(),
                recommender.recommend(seeds),
            )
            .await;

            match call {
                Ok(Ok(tracks)) if !tracks.is_empty() => {
                    return tracks.into_iter().map(Track::Unresolved).collect();
                }
                Ok(Ok(_)) => {
                    debug!(room = self.id, "Recommender returned nothing");
                    return Vec::new();
                }
                outcome => {
                    let reason = match outcome {
                        Ok(Err(e)) => e.to_string(),
                        _ => "recommendation call timed out".to_string(),
                    };
                    warn!(room = self.id, attempt, %reason, "Recommendation attempt failed");
                    self.set_status_line(
                        format!("Fetching suggestions failed, retrying {attempt}/{attempts}"),
                        "⚠️",
                    )
                    .await;
                    if attempt < attempts {
                        let backoff = std::time::Duration::from_secs(
                            self.params.autoplay_recommend_backoff_secs,
                        );
                        if self.sleep_cancellable(backoff).await.is_err() {
                            return Vec::new();
                        }
                    }
                }
            }
        }
        Vec::new()
    }

    /// Same-source related-content search keyed on the most recent seed
    async fn related_search_fallback(&self, seeds: &[SeedInfo]) -> Vec<Track> {
        let seed = &seeds[0];
        let node = self.bound_node();
        let query = if seed.source.is_empty() {
            format!("search:{}", seed.author)
        } else {
            format!("related:{}:{}", seed.source, seed.external_id)
        };

        let result = tokio::time::timeout(
            self.params.node_request_timeout(),
            node.client().search(&query),
        )
        .await;

        match result {
            Ok(Ok(found)) => found.tracks.into_iter().map(Track::Resolved).collect(),
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => "related search timed out".to_string(),
                };
                warn!(room = self.id, %reason, "Related-content fallback failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_common::{ResolvedTrack, TrackHandle};

    fn seed(id: &str) -> SeedInfo {
        SeedInfo {
            external_id: id.to_string(),
            title: format!("Seed {id}"),
            author: "Artist".into(),
            source: "soundcloud".into(),
            uri: None,
        }
    }

    fn candidate(title: &str, external_id: &str, duration_ms: u64, is_stream: bool) -> Track {
        Track::Resolved(ResolvedTrack {
            request_id: uuid::Uuid::new_v4(),
            handle: TrackHandle(format!("h-{external_id}")),
            uri: None,
            title: title.to_string(),
            author: "Artist".into(),
            duration_ms,
            is_stream,
            thumbnail: None,
            external_id: Some(external_id.to_string()),
            source: "soundcloud".into(),
            requested_by: None,
            loops: 0,
            autoplay: false,
            related: None,
            playlist: None,
        })
    }

    #[test]
    fn filter_drops_streams_shorts_and_seed_matches() {
        let seeds = vec![seed("s1")];
        let candidates = vec![
            candidate("Live show", "c1", 200_000, true),
            candidate("Short clip", "c2", 30_000, false),
            candidate("Seed itself", "s1", 200_000, false),
            candidate("Keeper", "c3", 200_000, false),
        ];

        let filtered = filter_candidates(candidates, &seeds, 90_000);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title(), "Keeper");
    }

    #[test]
    fn filter_prefers_clean_matches_over_remixes() {
        let seeds = vec![seed("s1")];
        let candidates = vec![
            candidate("Song (Remix)", "c1", 200_000, false),
            candidate("Song", "c2", 200_000, false),
        ];

        let filtered = filter_candidates(candidates, &seeds, 90_000);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title(), "Song");
    }

    #[test]
    fn filter_keeps_remixes_when_nothing_clean_exists() {
        let seeds = vec![seed("s1")];
        let candidates = vec![
            candidate("Song (Remix)", "c1", 200_000, false),
            candidate("Song Mashup", "c2", 200_000, false),
        ];

        let filtered = filter_candidates(candidates, &seeds, 90_000);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn noncanonical_tag_detection() {
        assert!(has_noncanonical_tag("Song (Extended Mix)"));
        assert!(has_noncanonical_tag("Best Of Compilation"));
        assert!(!has_noncanonical_tag("Plain Song"));
    }
}
