//! Skin renderers
//!
//! A skin is a pure function from a presence snapshot to a display payload;
//! it never touches session state. Implementations are selected by
//! configuration key, and unknown keys fall back to the default skin
//! rather than erroring.

pub mod compact;
pub mod default;

use cadenza_common::events::PresenceUpdate;
use serde::{Deserialize, Serialize};

/// Renderer-agnostic display payload handed to whatever frontend shows it
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisplayPayload {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<DisplayField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayField {
    pub name: String,
    pub value: String,
}

/// Capability interface for interchangeable skins
pub trait SkinRenderer: Send + Sync {
    fn key(&self) -> &'static str;
    fn render(&self, snapshot: &PresenceUpdate) -> DisplayPayload;
}

static DEFAULT_SKIN: default::DefaultSkin = default::DefaultSkin;
static COMPACT_SKIN: compact::CompactSkin = compact::CompactSkin;

/// All registered skins
pub fn all() -> [&'static dyn SkinRenderer; 2] {
    [&DEFAULT_SKIN, &COMPACT_SKIN]
}

/// Look a skin up by key; unknown keys get the default skin
pub fn resolve(key: &str) -> &'static dyn SkinRenderer {
    all()
        .into_iter()
        .find(|s| s.key() == key)
        .unwrap_or(&DEFAULT_SKIN)
}

/// Render `duration_ms` as `m:ss` / `h:mm:ss`
pub(crate) fn format_duration(duration_ms: u64) -> String {
    let total_secs = duration_ms / 1000;
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
