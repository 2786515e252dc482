//! REST + SSE control surface
//!
//! The service's own control plane: session lifecycle, queue operations,
//! playback control, state snapshots, skin-rendered display payloads, and
//! a presence event stream. Whatever command frontend exists (a chat bot,
//! a dashboard) talks to this.

pub mod handlers;
pub mod sse;

use crate::registry::SessionRegistry;
use axum::{
    extract::State,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub default_skin: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Session lifecycle
                .route("/sessions", get(handlers::list_sessions))
                .route("/sessions", post(handlers::create_session))
                .route("/sessions/:room", get(handlers::get_session))
                .route("/sessions/:room", delete(handlers::destroy_session))
                .route("/sessions/:room/restore", post(handlers::restore_session))
                // Queue operations
                .route("/sessions/:room/queue", post(handlers::enqueue))
                // Playback control
                .route("/sessions/:room/pause", post(handlers::pause))
                .route("/sessions/:room/resume", post(handlers::resume))
                .route("/sessions/:room/skip", post(handlers::skip))
                .route("/sessions/:room/back", post(handlers::back))
                .route("/sessions/:room/loop", post(handlers::set_loop))
                .route("/sessions/:room/autoplay", post(handlers::set_autoplay))
                .route("/sessions/:room/volume", post(handlers::set_volume))
                .route("/sessions/:room/filters", post(handlers::set_filters))
                // Voice-channel membership reports from the integration
                .route(
                    "/sessions/:room/voice-members",
                    post(handlers::voice_members),
                )
                // Rendered display payload
                .route("/sessions/:room/display", get(handlers::display))
                // SSE presence stream
                .route("/sessions/:room/events", get(sse::presence_stream)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "cadenza-player",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": state.registry.node_pool().len(),
    }))
}
