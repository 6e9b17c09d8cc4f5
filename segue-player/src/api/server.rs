//! HTTP server setup and routing
//!
//! Axum router exposing the pipeline's control surface. The GUI (or any
//! other collaborator) talks to these endpoints; the pipeline itself never
//! depends on them.

use crate::player::Player;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub player: Arc<Player>,
}

/// Build the control-surface router
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        // Health endpoint
        .route("/health", get(super::handlers::health))
        // Snapshots
        .route("/status", get(super::handlers::get_status))
        .route("/queue", get(super::handlers::get_queue))
        // Transport control
        .route("/playback/play", post(super::handlers::play))
        .route("/playback/pause", post(super::handlers::pause))
        .route("/playback/stop", post(super::handlers::stop))
        .route("/playback/next", post(super::handlers::skip_next))
        .route("/playback/previous", post(super::handlers::skip_back))
        .route("/playback/seek", post(super::handlers::seek))
        // Configuration
        .route("/config", get(super::handlers::get_config))
        .route("/config", put(super::handlers::put_config))
        .route("/volume", get(super::handlers::get_volume))
        .route("/volume", post(super::handlers::set_volume))
        // SSE event stream
        .route("/events", get(super::sse::event_stream))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
