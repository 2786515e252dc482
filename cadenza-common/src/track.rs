//! Track and playlist value objects
//!
//! A track is either *unresolved* (identified by search terms or an external
//! URI, carrying only display metadata) or *resolved* (carrying the playable
//! handle issued by a rendering node plus an authoritative duration). A track
//! resolves at most once; handle and duration never change afterwards.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque playable handle issued by a rendering node.
///
/// The orchestrator never inspects the contents; it only passes the handle
/// back to the node that issued it (or a replacement node, which accepts the
/// same encoded form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackHandle(pub String);

impl TrackHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Playlist-level metadata shared read-only by the queue entries that came
/// from the same playlist load. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub name: String,
    pub url: Option<String>,
    /// Fallback artwork when an individual track has none
    pub thumbnail: Option<String>,
}

/// Metadata of the track an autoplay candidate was derived from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedTrack {
    pub title: String,
    pub uri: Option<String>,
}

/// A track known only by its search terms or external URI.
///
/// `request_id` is assigned when the request enters the system and survives
/// resolution, so queue operations and diagnostics can refer to the same
/// entry before and after the node lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedTrack {
    pub request_id: Uuid,
    /// External URI when the request came from a link, otherwise empty
    pub uri: Option<String>,
    /// Search terms used when no URI is present
    pub search_terms: Option<String>,
    pub title: String,
    pub author: String,
    /// Duration claimed by the external source; used to pick the closest
    /// search result during resolution
    pub duration_hint_ms: Option<u64>,
    pub thumbnail: Option<String>,
    /// Stable identifier on the external source (used for autoplay dedup)
    pub external_id: Option<String>,
    pub source: Option<String>,
    pub requested_by: Option<u64>,
    /// Remaining repeat count requested for this entry
    pub loops: u32,
    /// True when this entry was derived by the autoplay engine
    pub autoplay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<Arc<PlaylistInfo>>,
}

impl UnresolvedTrack {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            uri: None,
            search_terms: None,
            title: title.into(),
            author: author.into(),
            duration_hint_ms: None,
            thumbnail: None,
            external_id: None,
            source: None,
            requested_by: None,
            loops: 0,
            autoplay: false,
            playlist: None,
        }
    }

    /// Query string handed to the rendering node's search call
    pub fn resolve_query(&self) -> String {
        if let Some(uri) = &self.uri {
            uri.clone()
        } else if let Some(terms) = &self.search_terms {
            terms.clone()
        } else {
            format!("{} - {}", self.author, self.title)
        }
    }

    /// Consume this request and bind it to a playable handle.
    ///
    /// This is the only Unresolved -> Resolved transition; display metadata
    /// is kept, duration becomes authoritative.
    pub fn into_resolved(
        self,
        handle: TrackHandle,
        duration_ms: u64,
        is_stream: bool,
        source: impl Into<String>,
    ) -> ResolvedTrack {
        ResolvedTrack {
            request_id: self.request_id,
            handle,
            uri: self.uri,
            title: self.title,
            author: self.author,
            duration_ms,
            is_stream,
            thumbnail: self.thumbnail,
            external_id: self.external_id,
            source: source.into(),
            requested_by: self.requested_by,
            loops: self.loops,
            autoplay: self.autoplay,
            related: None,
            playlist: self.playlist,
        }
    }
}

/// A track with a playable handle and an authoritative duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTrack {
    pub request_id: Uuid,
    pub handle: TrackHandle,
    pub uri: Option<String>,
    pub title: String,
    pub author: String,
    pub duration_ms: u64,
    /// Live/continuous stream; position is not bounded by duration
    pub is_stream: bool,
    pub thumbnail: Option<String>,
    pub external_id: Option<String>,
    /// Which provider the node loaded this from (e.g. "soundcloud")
    pub source: String,
    pub requested_by: Option<u64>,
    /// Remaining repeat count; decremented on each completed play
    pub loops: u32,
    pub autoplay: bool,
    /// Set on autoplay candidates: the track this one was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<RelatedTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<Arc<PlaylistInfo>>,
}

impl ResolvedTrack {
    /// Artwork for display, falling back to the owning playlist's thumbnail
    pub fn display_thumbnail(&self) -> Option<&str> {
        self.thumbnail
            .as_deref()
            .or_else(|| self.playlist.as_ref().and_then(|p| p.thumbnail.as_deref()))
    }
}

/// Queue entry: either still a request or already playable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Track {
    Unresolved(UnresolvedTrack),
    Resolved(ResolvedTrack),
}

impl Track {
    pub fn request_id(&self) -> Uuid {
        match self {
            Track::Unresolved(t) => t.request_id,
            Track::Resolved(t) => t.request_id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Track::Unresolved(t) => &t.title,
            Track::Resolved(t) => &t.title,
        }
    }

    pub fn author(&self) -> &str {
        match self {
            Track::Unresolved(t) => &t.author,
            Track::Resolved(t) => &t.author,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match self {
            Track::Unresolved(t) => t.uri.as_deref(),
            Track::Resolved(t) => t.uri.as_deref(),
        }
    }

    /// Authoritative duration for resolved tracks, hint for unresolved ones
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Track::Unresolved(t) => t.duration_hint_ms,
            Track::Resolved(t) => Some(t.duration_ms),
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            Track::Unresolved(_) => false,
            Track::Resolved(t) => t.is_stream,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            Track::Unresolved(t) => t.external_id.as_deref(),
            Track::Resolved(t) => t.external_id.as_deref(),
        }
    }

    pub fn autoplay(&self) -> bool {
        match self {
            Track::Unresolved(t) => t.autoplay,
            Track::Resolved(t) => t.autoplay,
        }
    }

    pub fn loops(&self) -> u32 {
        match self {
            Track::Unresolved(t) => t.loops,
            Track::Resolved(t) => t.loops,
        }
    }

    pub fn set_loops(&mut self, loops: u32) {
        match self {
            Track::Unresolved(t) => t.loops = loops,
            Track::Resolved(t) => t.loops = loops,
        }
    }

    pub fn playlist(&self) -> Option<&Arc<PlaylistInfo>> {
        match self {
            Track::Unresolved(t) => t.playlist.as_ref(),
            Track::Resolved(t) => t.playlist.as_ref(),
        }
    }

    pub fn as_resolved(&self) -> Option<&ResolvedTrack> {
        match self {
            Track::Resolved(t) => Some(t),
            Track::Unresolved(_) => None,
        }
    }
}

impl From<UnresolvedTrack> for Track {
    fn from(t: UnresolvedTrack) -> Self {
        Track::Unresolved(t)
    }
}

impl From<ResolvedTrack> for Track {
    fn from(t: ResolvedTrack) -> Self {
        Track::Resolved(t)
    }
}
