//! API request/response types and handlers

use super::AppState;
use crate::error::{Error, Result};
use crate::node::client::Filters;
use crate::session::player::{Session, SessionOptions};
use crate::session::store::QueuePosition;
use crate::skins;
use crate::RoomId;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use cadenza_common::events::{LoopMode, PlaybackPhase, PresenceUpdate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Create-session request body
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub room: RoomId,
    pub voice_channel: u64,
    #[serde(default)]
    pub text_channel: Option<u64>,
    #[serde(default)]
    pub owner: Option<u64>,
    #[serde(default)]
    pub autoplay: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub skin: Option<String>,
}

/// Enqueue request body: a query resolved through the bound node
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub query: String,
    #[serde(default)]
    pub requested_by: Option<u64>,
    /// "head" jumps the line; anything else appends
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub queue_len: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoopRequest {
    pub mode: LoopMode,
}

#[derive(Debug, Deserialize)]
pub struct AutoplayRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub volume: u16,
}

#[derive(Debug, Deserialize)]
pub struct VoiceMembersRequest {
    /// Eligible (non-bot, non-deafened) listener count
    pub listeners: usize,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Deserialize)]
pub struct DisplayQuery {
    #[serde(default)]
    pub skin: Option<String>,
}

/// Queue entry summary in state views
#[derive(Debug, Serialize)]
pub struct QueueEntryView {
    pub title: String,
    pub author: String,
    pub resolved: bool,
    pub autoplay: bool,
    pub requested_by: Option<u64>,
}

/// Full session state view
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub room: RoomId,
    pub phase: PlaybackPhase,
    pub presence: PresenceUpdate,
    pub queue: Vec<QueueEntryView>,
    pub history_len: usize,
    pub failed_len: usize,
    pub node: String,
    pub watchdog_interventions: u64,
}

async fn session_view(session: &Arc<Session>) -> SessionView {
    let presence = session.presence_snapshot().await;
    let state = session.state.read().await;

    SessionView {
        room: session.id,
        phase: state.phase,
        presence,
        queue: state
            .store
            .tracks()
            .map(|t| QueueEntryView {
                title: t.title().to_string(),
                author: t.author().to_string(),
                resolved: t.as_resolved().is_some(),
                autoplay: t.autoplay(),
                requested_by: match t {
                    cadenza_common::Track::Resolved(r) => r.requested_by,
                    cadenza_common::Track::Unresolved(u) => u.requested_by,
                },
            })
            .collect(),
        history_len: state.store.history_len(),
        failed_len: state.store.failed().count(),
        node: session.bound_node().id.clone(),
        watchdog_interventions: session.watchdog_interventions(),
    }
}

async fn lookup(state: &AppState, room: RoomId) -> Result<Arc<Session>> {
    state
        .registry
        .get(room)
        .await
        .ok_or(Error::SessionNotFound(room))
}

// ---- session lifecycle ------------------------------------------------------

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<RoomId>> {
    Json(state.registry.rooms().await)
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionView>> {
    let options = SessionOptions {
        voice_channel: request.voice_channel,
        text_channel: request.text_channel,
        owner: request.owner,
        autoplay: request.autoplay,
        persistent: request.persistent,
        skin: request.skin.or_else(|| Some(state.default_skin.clone())),
    };
    let session = state.registry.get_or_create(request.room, options).await?;
    Ok(Json(session_view(&session).await))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<SessionView>> {
    let session = lookup(&state, room).await?;
    Ok(Json(session_view(&session).await))
}

pub async fn destroy_session(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<serde_json::Value>> {
    let session = lookup(&state, room).await?;
    session.destroy("stopped via API").await;
    Ok(Json(serde_json::json!({ "destroyed": room })))
}

pub async fn restore_session(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<SessionView>> {
    let session = state.registry.restore(room, request.resume).await?;
    Ok(Json(session_view(&session).await))
}

// ---- queue ------------------------------------------------------------------

pub async fn enqueue(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>> {
    let session = lookup(&state, room).await?;
    let position = match request.position.as_deref() {
        Some("head") => QueuePosition::Head,
        _ => QueuePosition::Tail,
    };
    let queue_len = session
        .enqueue_query(&request.query, request.requested_by, position)
        .await?;
    Ok(Json(EnqueueResponse { queue_len }))
}

// ---- playback control -------------------------------------------------------

pub async fn pause(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.pause().await?;
    Ok(Json(serde_json::json!({ "paused": true })))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.resume().await?;
    Ok(Json(serde_json::json!({ "paused": false })))
}

pub async fn skip(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.skip().await?;
    Ok(Json(serde_json::json!({ "skipped": true })))
}

pub async fn back(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.play_previous().await?;
    Ok(Json(serde_json::json!({ "back": true })))
}

pub async fn set_loop(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<LoopRequest>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.set_loop_mode(request.mode).await?;
    Ok(Json(serde_json::json!({ "loop": request.mode })))
}

pub async fn set_autoplay(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<AutoplayRequest>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room)
        .await?
        .set_autoplay(request.enabled)
        .await?;
    Ok(Json(serde_json::json!({ "autoplay": request.enabled })))
}

pub async fn set_volume(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<VolumeRequest>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.set_volume(request.volume).await?;
    Ok(Json(serde_json::json!({ "volume": request.volume })))
}

pub async fn set_filters(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(filters): Json<Filters>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room).await?.set_filters(filters).await?;
    Ok(Json(serde_json::json!({ "filters": "applied" })))
}

pub async fn voice_members(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Json(request): Json<VoiceMembersRequest>,
) -> Result<Json<serde_json::Value>> {
    lookup(&state, room)
        .await?
        .on_voice_membership(request.listeners)
        .await;
    Ok(Json(serde_json::json!({ "listeners": request.listeners })))
}

// ---- display ----------------------------------------------------------------

pub async fn display(
    State(state): State<AppState>,
    Path(room): Path<RoomId>,
    Query(query): Query<DisplayQuery>,
) -> Result<Json<skins::DisplayPayload>> {
    let session = lookup(&state, room).await?;
    let snapshot = session.presence_snapshot().await;
    let key = match &query.skin {
        Some(key) => key.clone(),
        None => session.state.read().await.skin.clone(),
    };
    Ok(Json(skins::resolve(&key).render(&snapshot)))
}
