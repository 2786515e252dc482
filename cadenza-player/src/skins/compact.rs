//! Compact skin: single description line with a text progress bar

use super::{format_duration, DisplayPayload, SkinRenderer};
use cadenza_common::events::PresenceUpdate;

const BAR_WIDTH: usize = 12;

pub struct CompactSkin;

fn progress_bar(position_ms: u64, duration_ms: u64) -> String {
    if duration_ms == 0 {
        return "─".repeat(BAR_WIDTH);
    }
    let filled = ((position_ms as f64 / duration_ms as f64) * BAR_WIDTH as f64) as usize;
    let filled = filled.min(BAR_WIDTH.saturating_sub(1));
    let mut bar = String::with_capacity(BAR_WIDTH * 3);
    for i in 0..BAR_WIDTH {
        bar.push(if i == filled { '●' } else { '─' });
    }
    bar
}

impl SkinRenderer for CompactSkin {
    fn key(&self) -> &'static str {
        "compact"
    }

    fn render(&self, snapshot: &PresenceUpdate) -> DisplayPayload {
        match snapshot {
            PresenceUpdate::Idle { .. } => DisplayPayload {
                title: String::new(),
                description: "💤 waiting for tracks".into(),
                fields: Vec::new(),
                thumbnail: None,
                footer: None,
            },

            PresenceUpdate::Playing {
                track,
                position_ms,
                paused,
                queue_len,
                ..
            } => {
                let line = if track.is_stream {
                    format!("🔴 {} — {} (live)", track.title, track.author)
                } else {
                    format!(
                        "{} {} — {}\n{} {} / {}",
                        if *paused { "⏸" } else { "▶" },
                        track.title,
                        track.author,
                        progress_bar(*position_ms, track.duration_ms),
                        format_duration(*position_ms),
                        format_duration(track.duration_ms),
                    )
                };
                DisplayPayload {
                    title: String::new(),
                    description: line,
                    fields: Vec::new(),
                    thumbnail: track.thumbnail.clone(),
                    footer: Some(format!("{queue_len} queued")),
                }
            }

            PresenceUpdate::Closed { reason, .. } => DisplayPayload {
                title: String::new(),
                description: format!("🛑 {reason}"),
                fields: Vec::new(),
                thumbnail: None,
                footer: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_reflects_progress() {
        let start = progress_bar(0, 100_000);
        let end = progress_bar(100_000, 100_000);
        assert_eq!(start.chars().count(), BAR_WIDTH);
        assert_ne!(start, end);
        // Marker never runs off the end even at/past full duration
        assert_eq!(end.chars().filter(|c| *c == '●').count(), 1);
    }

    #[test]
    fn playing_line_includes_progress() {
        let payload = CompactSkin.render(&crate::skins::tests::playing_snapshot());
        assert!(payload.description.contains("1:00 / 3:00"));
        assert_eq!(payload.footer.as_deref(), Some("2 queued"));
    }
}
