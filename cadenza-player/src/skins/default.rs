//! Default skin: full field set, one field per fact

use super::{format_duration, DisplayField, DisplayPayload, SkinRenderer};
use cadenza_common::events::{LoopMode, PlaybackPhase, PresenceUpdate};

pub struct DefaultSkin;

impl SkinRenderer for DefaultSkin {
    fn key(&self) -> &'static str {
        "default"
    }

    fn render(&self, snapshot: &PresenceUpdate) -> DisplayPayload {
        match snapshot {
            PresenceUpdate::Idle {
                idle_deadline,
                autoplay,
                ..
            } => {
                let mut description =
                    "Nothing in the queue. Add a track to start playback.".to_string();
                if let Some(deadline) = idle_deadline {
                    description.push_str(&format!(
                        "\nThe player shuts down at {} if nothing is added.",
                        deadline.format("%H:%M:%S")
                    ));
                }
                DisplayPayload {
                    title: "Waiting for music".into(),
                    description,
                    fields: vec![DisplayField {
                        name: "Autoplay".into(),
                        value: if *autoplay { "on" } else { "off" }.into(),
                    }],
                    thumbnail: None,
                    footer: None,
                }
            }

            PresenceUpdate::Playing {
                phase,
                track,
                position_ms,
                paused,
                queue_len,
                loop_mode,
                autoplay,
                volume,
                node,
                node_ping_ms,
                status_line,
                ..
            } => {
                let state = match (phase, paused) {
                    (PlaybackPhase::AutoPaused, _) => "paused (empty channel)",
                    (_, true) => "paused",
                    _ => "playing",
                };
                let position = if track.is_stream {
                    "live".to_string()
                } else {
                    format!(
                        "{} / {}",
                        format_duration(*position_ms),
                        format_duration(track.duration_ms)
                    )
                };

                let mut fields = vec![
                    DisplayField {
                        name: "Author".into(),
                        value: track.author.clone(),
                    },
                    DisplayField {
                        name: "Position".into(),
                        value: position,
                    },
                    DisplayField {
                        name: "Queue".into(),
                        value: format!("{queue_len} track(s)"),
                    },
                    DisplayField {
                        name: "Loop".into(),
                        value: match loop_mode {
                            LoopMode::Off => "off",
                            LoopMode::Track => "current track",
                            LoopMode::Queue => "whole queue",
                        }
                        .into(),
                    },
                    DisplayField {
                        name: "Volume".into(),
                        value: format!("{volume}%"),
                    },
                ];
                if let Some(playlist) = &track.playlist_name {
                    fields.push(DisplayField {
                        name: "Playlist".into(),
                        value: playlist.clone(),
                    });
                }
                if *autoplay || track.autoplay {
                    fields.push(DisplayField {
                        name: "Autoplay".into(),
                        value: "on".into(),
                    });
                }

                DisplayPayload {
                    title: format!("{} ({state})", track.title),
                    description: track
                        .uri
                        .clone()
                        .unwrap_or_else(|| format!("from {}", track.source)),
                    fields,
                    thumbnail: track.thumbnail.clone(),
                    footer: Some({
                        let node_info = match node_ping_ms {
                            Some(ping) => format!("node {node} ({ping}ms)"),
                            None => format!("node {node}"),
                        };
                        match status_line {
                            Some(line) => format!("{line} · {node_info}"),
                            None => node_info,
                        }
                    }),
                }
            }

            PresenceUpdate::Closed { reason, .. } => DisplayPayload {
                title: "Player closed".into(),
                description: reason.clone(),
                fields: Vec::new(),
                thumbnail: None,
                footer: None,
            },
        }
    }
}
