//! Control-surface request handlers

use super::server::AppContext;
use crate::error::Error;
use crate::playback::ready_queue::SlotInfo;
use crate::state::StatusSnapshot;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use segue_common::Settings;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Pipeline errors rendered as HTTP responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Config(_) | Error::Playlist(_) => StatusCode::BAD_REQUEST,
            Error::Unavailable(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /status - transport, current clip, buffer health
pub async fn get_status(State(ctx): State<AppContext>) -> Json<StatusSnapshot> {
    Json(ctx.player.scheduler.status().await)
}

/// GET /queue - pipeline slots in order (filling/ready/draining)
pub async fn get_queue(State(ctx): State<AppContext>) -> Json<Vec<SlotInfo>> {
    Json(ctx.player.queue.slots_snapshot())
}

/// POST /playback/play
pub async fn play(State(ctx): State<AppContext>) -> ApiResult<StatusCode> {
    ctx.player.scheduler.play().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /playback/pause
pub async fn pause(State(ctx): State<AppContext>) -> ApiResult<StatusCode> {
    ctx.player.scheduler.pause().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /playback/stop
pub async fn stop(State(ctx): State<AppContext>) -> StatusCode {
    ctx.player.scheduler.stop().await;
    StatusCode::NO_CONTENT
}

/// POST /playback/next
pub async fn skip_next(State(ctx): State<AppContext>) -> StatusCode {
    ctx.player.scheduler.skip_next().await;
    StatusCode::NO_CONTENT
}

/// POST /playback/previous
pub async fn skip_back(State(ctx): State<AppContext>) -> StatusCode {
    ctx.player.scheduler.skip_back().await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub position_secs: f64,
}

/// POST /playback/seek - reposition within the active clip
pub async fn seek(
    State(ctx): State<AppContext>,
    Json(request): Json<SeekRequest>,
) -> ApiResult<StatusCode> {
    ctx.player.scheduler.seek(request.position_secs).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /config - current settings
pub async fn get_config(State(ctx): State<AppContext>) -> Json<Settings> {
    Json(ctx.player.settings.read().await.clone())
}

/// PUT /config - live settings update
///
/// Output format fields are fixed for the session; everything else applies
/// to clips prepared after the swap.
pub async fn put_config(
    State(ctx): State<AppContext>,
    Json(new_settings): Json<Settings>,
) -> ApiResult<StatusCode> {
    new_settings
        .validate()
        .map_err(|e| Error::Config(e.to_string()))?;

    {
        let current = ctx.player.settings.read().await;
        if new_settings.sample_rate != current.sample_rate
            || new_settings.channels != current.channels
        {
            return Err(Error::Config(
                "sample_rate and channels are fixed for the session".into(),
            )
            .into());
        }
    }

    info!("Applying live configuration update");
    *ctx.player.settings.write().await = new_settings;
    ctx.player.prebuffer.wake();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeBody {
    pub volume: f32,
}

/// GET /volume
pub async fn get_volume(State(ctx): State<AppContext>) -> Json<VolumeBody> {
    Json(VolumeBody {
        volume: ctx.player.state.volume(),
    })
}

/// POST /volume
pub async fn set_volume(
    State(ctx): State<AppContext>,
    Json(body): Json<VolumeBody>,
) -> StatusCode {
    ctx.player.state.set_volume(body.volume);
    StatusCode::NO_CONTENT
}
