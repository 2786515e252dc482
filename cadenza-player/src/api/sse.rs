//! Server-Sent Events presence stream
//!
//! Streams a session's presence updates to connected clients, one SSE event
//! per update, with the update type in the SSE `event:` field.

use super::AppState;
use crate::error::{Error, Result};
use crate::RoomId;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// GET /sessions/:room/events - SSE presence stream
pub async fn presence_stream(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let session = state
        .registry
        .get(room)
        .await
        .ok_or(Error::SessionNotFound(room))?;

    debug!(room, "New SSE presence client");
    let rx = session.presence.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(update) => match serde_json::to_string(&update) {
                Ok(json) => Some(Ok(Event::default().event(update.event_type()).data(json))),
                Err(e) => {
                    warn!("Failed to serialize presence update: {}", e);
                    None
                }
            },
            Err(e) => {
                // Lagged or closed receiver
                warn!("SSE presence stream error: {:?}", e);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
