//! HTTP API: recorder control, status, the recordings archive and live
//! HLS playback.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use aircheck_core::follow::{serve_file_range, FollowStreamer};
use aircheck_core::hls::{is_safe_segment, HlsManager};
use aircheck_core::process::KillSignal;
use aircheck_core::recorder::files::resolve_recording_path;
use aircheck_core::recorder::{
    ChannelCheck, MonitorStatus, Recorder, RecordingItem, RunningRecording, StartOutcome,
    StatusPayload, StopOutcome,
};
use aircheck_core::Error as CoreError;

#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<Recorder>,
    pub hls: Arc<HlsManager>,
    pub follow: FollowStreamer,
}

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// Error response JSON structure
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ChannelNotLive => AppError::not_found("Channel not live"),
            CoreError::PlaylistNotReady => {
                AppError::service_unavailable("Stream is starting, retry shortly")
            }
            CoreError::InvalidPath => AppError::bad_request("Invalid path"),
            CoreError::Io(e) if e.kind() == ErrorKind::NotFound => {
                AppError::not_found("Not found")
            }
            other => {
                tracing::error!("Request failed: {}", other);
                AppError::internal_server_error("Internal server error")
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/recorder/monitor/start", post(start_monitoring))
        .route("/api/recorder/monitor/stop", post(stop_monitoring))
        .route("/api/recorder/refresh", post(refresh_channels))
        .route("/api/recorder/running", get(get_running))
        .route("/api/recorder/start", post(start_channel))
        .route("/api/recorder/stop", post(stop_channel))
        .route("/api/recorder/stop-all", post(stop_all))
        .route("/api/recordings", get(list_recordings))
        .route("/api/stream", get(stream_recording))
        .route("/api/stream/recording", get(stream_running_recording))
        .route("/recordings/{*path}", get(download_recording))
        .route("/api/live/hls/{channel}", get(start_hls))
        .route("/api/live/hls/{channel}/stop", post(stop_hls))
        .route("/live/{channel}/{file}", get(serve_hls_file))
        .with_state(state)
}

/// Basic health check (always returns OK if server is running)
async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn get_status(State(state): State<AppState>) -> Json<StatusPayload> {
    Json(state.recorder.build_status_payload().await)
}

#[derive(Debug, Deserialize)]
struct MonitorStartRequest {
    channels: Option<Vec<String>>,
}

async fn start_monitoring(
    State(state): State<AppState>,
    body: Option<Json<MonitorStartRequest>>,
) -> Json<MonitorStatus> {
    let channels = body.and_then(|Json(req)| req.channels);
    Json(state.recorder.start_monitoring(channels))
}

#[derive(Debug, Deserialize)]
struct MonitorStopRequest {
    stop_recordings: Option<bool>,
}

async fn stop_monitoring(
    State(state): State<AppState>,
    body: Option<Json<MonitorStopRequest>>,
) -> Json<MonitorStatus> {
    let stop_recordings = body
        .and_then(|Json(req)| req.stop_recordings)
        .unwrap_or(true);
    state.recorder.stop_monitoring(stop_recordings).await;
    Json(state.recorder.monitor_status())
}

async fn refresh_channels(State(state): State<AppState>) -> Json<Vec<ChannelCheck>> {
    Json(state.recorder.check_channels().await)
}

async fn get_running(State(state): State<AppState>) -> Json<Vec<RunningRecording>> {
    Json(state.recorder.get_running().await)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    channel: String,
}

async fn start_channel(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> AppResult<Json<StartOutcome>> {
    let channel = req.channel.trim();
    if channel.is_empty() {
        return Err(AppError::bad_request("channel is required"));
    }
    Ok(Json(state.recorder.start_channel(channel).await?))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    stage: Option<String>,
    channel: Option<String>,
}

async fn stop_channel(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> AppResult<Json<StopOutcome>> {
    let key = req
        .stage
        .or(req.channel)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request("stage or channel is required"))?;
    Ok(Json(state.recorder.stop_recording(&key, KillSignal::Interrupt)))
}

#[derive(Debug, Serialize)]
struct StopAllResponse {
    stopped: usize,
}

async fn stop_all(State(state): State<AppState>) -> Json<StopAllResponse> {
    let stopped = state.recorder.running_count();
    state.recorder.stop_all(KillSignal::Interrupt).await;
    Json(StopAllResponse { stopped })
}

async fn list_recordings(State(state): State<AppState>) -> AppResult<Json<Vec<RecordingItem>>> {
    Ok(Json(state.recorder.list_recordings().await?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    path: String,
    follow: Option<String>,
    live: Option<String>,
}

impl StreamQuery {
    fn wants_follow(&self) -> bool {
        matches!(self.follow.as_deref(), Some("1" | "true" | "yes"))
    }
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

async fn stream_recording(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let root = state.recorder.recordings_root();
    let abs = resolve_recording_path(&root, &query.path)?;
    if let Err(err) = tokio::fs::metadata(&abs).await {
        if err.kind() == ErrorKind::NotFound {
            return Err(AppError::not_found("Recording not found"));
        }
        return Err(CoreError::from(err).into());
    }

    if query.wants_follow() {
        Ok(state.follow.follow(abs, 0)?)
    } else {
        Ok(serve_file_range(&abs, range_header(&headers)).await?)
    }
}

/// Like `stream_recording`, but for a capture that may still be in
/// progress: when the local file is gone the client is redirected to the
/// upstream source URL supplied in `live`.
async fn stream_running_recording(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let root = state.recorder.recordings_root();
    let abs = resolve_recording_path(&root, &query.path)?;

    match tokio::fs::metadata(&abs).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let upstream = query
                .live
                .as_deref()
                .filter(|url| url.starts_with("http://") || url.starts_with("https://"));
            if let Some(url) = upstream {
                return Ok(Redirect::temporary(url).into_response());
            }
            return Err(AppError::not_found("Recording not found"));
        }
        Err(err) => return Err(CoreError::from(err).into()),
    }

    if query.wants_follow() {
        Ok(state.follow.follow(abs, 0)?)
    } else {
        Ok(serve_file_range(&abs, range_header(&headers)).await?)
    }
}

async fn download_recording(
    State(state): State<AppState>,
    Path(rel): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let root = state.recorder.recordings_root();
    let abs = resolve_recording_path(&root, &rel)?;
    let mut response = serve_file_range(&abs, range_header(&headers)).await?;

    if let Some(name) = abs.file_name().and_then(|n| n.to_str()) {
        let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "_"));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
struct HlsStartResponse {
    channel: String,
    playlist: String,
}

async fn start_hls(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> AppResult<Json<HlsStartResponse>> {
    let session = state.hls.start_session(&channel).await?;
    let cache_buster = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    Ok(Json(HlsStartResponse {
        channel: session.channel().to_string(),
        playlist: format!("{}?t={}", session.playlist_url(), cache_buster),
    }))
}

#[derive(Debug, Serialize)]
struct HlsStopResponse {
    stopped: bool,
}

async fn stop_hls(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Json<HlsStopResponse> {
    let stopped = state.hls.stop_session(&channel).await;
    Json(HlsStopResponse { stopped })
}

fn hls_content_type(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

/// Serve playlist and segment files for a live session. Every hit counts
/// as activity for the idle reaper.
async fn serve_hls_file(
    State(state): State<AppState>,
    Path((channel, file)): Path<(String, String)>,
) -> AppResult<Response> {
    if !is_safe_segment(&file) {
        return Err(AppError::bad_request("Invalid file name"));
    }
    let Some(session) = state.hls.touch(&channel) else {
        return Err(AppError::not_found("No live session for channel"));
    };

    let path = session.dir().join(&file);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::not_found("No such segment"));
        }
        Err(err) => return Err(CoreError::from(err).into()),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, hls_content_type(&file))
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(bytes))
        .map_err(|err| AppError::internal_server_error(err.to_string()))
}
