use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ffmpeg_ts::StreamerConfig;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::SharedManager;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
            ApiError::Internal(e) => {
                log::error!("api error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)).into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    manager: SharedManager,
}

impl AppState {
    pub(crate) fn new(manager: SharedManager) -> Self {
        Self { manager }
    }

    /// Settings as the streamers hold them, applied on the next start.
    fn settings(&self) -> Result<StreamerConfig, ApiError> {
        let mut manager = self.manager.lock().unwrap_or_else(|p| p.into_inner());
        manager
            .encoder_settings()
            .ok_or_else(|| ApiError::NotFound("no streamer exposes encoder settings".into()))
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route(
            "/api/v1/streaming/settings",
            get(get_settings).post(update_settings),
        )
        .route("/api/v1/streaming/control", post(control))
        .with_state(state)
}

pub(crate) fn start_api_server(port: u16, state: AppState, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = router(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("bind api server on {}: {}", addr, e);
                return;
            }
        };
        log::info!("API server started on port {}", port);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("api server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down API server");
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub active: bool,
    pub stream_urls: Vec<String>,
    pub clients: u32,
}

async fn status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let manager = state.manager.lock().unwrap_or_else(|p| p.into_inner());
    Ok(Json(StatusResponse {
        active: manager.is_active(),
        stream_urls: manager.stream_urls(),
        clients: manager.total_client_count(),
    }))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<StreamerConfig> {
    Ok(Json(state.settings()?))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub video_bitrate: Option<u64>,
    pub audio_bitrate: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub video_preset: Option<String>,
    pub keyframe_interval: Option<u32>,
}

impl SettingsUpdate {
    fn apply(&self, controls: &mut dyn ffmpeg_ts::EncoderControls) {
        if let Some(bps) = self.video_bitrate {
            controls.set_video_bitrate(bps);
        }
        if let Some(bps) = self.audio_bitrate {
            controls.set_audio_bitrate(bps);
        }
        if let Some(name) = &self.video_codec {
            controls.set_video_codec(name);
        }
        if let Some(name) = &self.audio_codec {
            controls.set_audio_codec(name);
        }
        if let Some(preset) = &self.video_preset {
            controls.set_video_preset(preset);
        }
        if let Some(frames) = self.keyframe_interval {
            controls.set_keyframe_interval(frames);
        }
    }
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<StreamerConfig> {
    if update.video_bitrate == Some(0) || update.audio_bitrate == Some(0) {
        return Err(ApiError::BadRequest("bitrate must be positive".into()));
    }
    let configured = {
        let mut manager = state.manager.lock().unwrap_or_else(|p| p.into_inner());
        manager.configure_encoders(|controls| update.apply(controls))
    };
    log::info!("settings updated on {} streamer(s), applied on next start", configured);
    Ok(Json(state.settings()?))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

async fn control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<StatusResponse> {
    let manager = state.manager.clone();
    // start opens encoders and stop joins threads, keep both off the runtime
    let (ok, active) = tokio::task::spawn_blocking(move || {
        let mut manager = manager.lock().unwrap_or_else(|p| p.into_inner());
        let ok = match request.action {
            ControlAction::Start => manager.start(),
            ControlAction::Stop => {
                manager.stop();
                true
            }
        };
        (ok, manager.is_active())
    })
    .await?;
    if !ok {
        return Err(ApiError::Internal(anyhow::anyhow!("failed to start streaming")));
    }
    log::info!("streaming {}", if active { "started" } else { "stopped" });
    status(State(state)).await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ffmpeg_ts::{StreamManager, TsStreamer};

    use super::*;

    fn state(with_streamer: bool) -> AppState {
        let mut manager = StreamManager::new();
        if with_streamer {
            manager.add_streamer(Box::new(TsStreamer::default()));
        }
        AppState::new(Arc::new(Mutex::new(manager)))
    }

    #[tokio::test]
    async fn settings_are_read_back_from_streamers() {
        let state = state(true);
        let update = SettingsUpdate {
            video_bitrate: Some(3_000_000),
            video_codec: Some("hevc".into()),
            ..Default::default()
        };
        let Ok(Json(updated)) = update_settings(State(state.clone()), Json(update)).await else {
            panic!("update rejected");
        };
        assert_eq!(updated.video_bitrate, 3_000_000);
        assert_eq!(updated.video_codec, "hevc");

        let Ok(Json(current)) = get_settings(State(state)).await else {
            panic!("settings unavailable");
        };
        assert_eq!(current.video_bitrate, 3_000_000);
        assert_eq!(current.video_codec, "hevc");
    }

    #[tokio::test]
    async fn zero_bitrate_is_rejected() {
        let update = SettingsUpdate {
            audio_bitrate: Some(0),
            ..Default::default()
        };
        let result = update_settings(State(state(true)), Json(update)).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn settings_need_a_configurable_streamer() {
        let result = get_settings(State(state(false))).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
