#![forbid(unsafe_code)]

//! Axum backend for the tubevault video archive.
//!
//! Clients POST a URL, we drive the external downloader for it, expose the
//! live progress stream, and serve the finished files (with byte-range
//! support) plus their stored metadata.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
    sync::broadcast::error::RecvError,
};
use tokio_util::io::ReaderStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tubevault::config::{RuntimeOverrides, resolve_runtime_paths};
use tubevault::events::DownloadEvent;
use tubevault::gc;
use tubevault::manager::{self, DownloadManager};
use tubevault::metadata::{MetadataStore, PlaybackPosition, VideoRecord, VideoWithStatus};
use tubevault::registry::SessionRegistry;
use tubevault::security::ensure_not_root;
use tubevault::session::SessionEvent;
use url::Url;

#[derive(Debug, Clone)]
struct BackendArgs {
    downloads_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
    downloader: PathBuf,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut downloader_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--downloads-dir=") {
                root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--downloader=") {
                downloader_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--downloads-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloads-dir requires a value"))?;
                    root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--downloader" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloader requires a value"))?;
                    downloader_override = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_paths(RuntimeOverrides {
            downloads_root: root_override,
            port: port_override,
            downloader: downloader_override,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&runtime.host)?,
        };

        Ok(Self {
            downloads_root: runtime.downloads_root,
            port: runtime.port,
            listen_host,
            downloader: runtime.downloader,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEVAULT_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    store: MetadataStore,
    manager: DownloadManager,
    videos_dir: Arc<PathBuf>,
    http: reqwest::Client,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        downloads_root,
        port,
        listen_host,
        downloader,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tubevault=info")),
        )
        .init();

    let videos_dir = downloads_root.join(tubevault::config::VIDEOS_SUBDIR);
    std::fs::create_dir_all(&videos_dir)
        .with_context(|| format!("creating {}", videos_dir.display()))?;

    let db_path = downloads_root.join(tubevault::config::METADATA_DB_FILE);
    let store = MetadataStore::open(&db_path)
        .await
        .context("initializing metadata store")?;

    gc::spawn(store.clone(), videos_dir.clone());

    let manager = DownloadManager::new(
        store.clone(),
        SessionRegistry::new(),
        videos_dir.clone(),
        downloader,
    );

    let state = AppState {
        store,
        manager,
        videos_dir: Arc::new(videos_dir),
        http: reqwest::Client::new(),
    };

    let app = router(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/downloads", post(start_download))
        .route("/api/downloads/{id}/progress", get(download_progress))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}", get(get_video).delete(delete_video))
        .route("/api/videos/{id}/playback", put(update_playback))
        .route("/api/videos/{id}/file", get(stream_video_file))
        .route("/api/thumbnail/{id}", get(proxy_thumbnail))
        .with_state(state)
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn health() -> Response {
    let mut response = format!("Ok\n\n{}", Utc::now().to_rfc3339()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        "no-store, no-cache, must-revalidate, private".parse().unwrap(),
    );
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    headers.insert(header::EXPIRES, "0".parse().unwrap());
    response
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<VideoRecord>> {
    let url = Url::parse(payload.url.trim())
        .map_err(|_| ApiError::bad_request("invalid download URL"))?;

    let record = state.manager.initiate_download(&url).await.map_err(|err| {
        if err.message == manager::ERR_VIDEO_NOT_FOUND {
            ApiError::not_found(err.message)
        } else {
            ApiError::internal(err.message)
        }
    })?;

    Ok(Json(record))
}

/// Streams the session's progress events as newline-delimited JSON. The
/// body ends when the download does; clients treat that as the cue to
/// refresh their video list.
async fn download_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let stream = state
        .manager
        .registry()
        .lookup(&id)
        .ok_or_else(|| ApiError::not_found("download not found"))?;

    // Subscribe before the closed check: if the flag is still unset here,
    // the terminal event is guaranteed to reach this receiver.
    let receiver = stream.subscribe();
    if stream.is_closed() {
        return Ok(ndjson_response(Body::empty()));
    }

    let body = Body::from_stream(futures::stream::unfold(
        receiver,
        |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(SessionEvent::Event(DownloadEvent::Progress(update))) => {
                        let Ok(mut line) = serde_json::to_vec(&update) else {
                            continue;
                        };
                        line.push(b'\n');
                        return Some((
                            Ok::<_, std::convert::Infallible>(Bytes::from(line)),
                            receiver,
                        ));
                    }
                    Ok(SessionEvent::Event(_)) => {}
                    Ok(SessionEvent::Failed(_)) | Ok(SessionEvent::Closed) => return None,
                    Err(RecvError::Closed) => return None,
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        },
    ));

    Ok(ndjson_response(body))
}

fn ndjson_response(body: Body) -> Response {
    let mut response = body.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/x-ndjson".parse().unwrap(),
    );
    response
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoWithStatus>>> {
    let videos = state
        .manager
        .list_videos()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(videos))
}

/// Stored record plus derived status and, when present, the resume
/// position.
#[derive(Serialize)]
struct VideoDetail {
    #[serde(flatten)]
    video: VideoWithStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    playback: Option<PlaybackPosition>,
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoDetail>> {
    let video = state
        .manager
        .get_video(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    let playback = state
        .store
        .get_playback(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(VideoDetail { video, playback }))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .manager
        .delete_video(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !deleted {
        return Err(ApiError::not_found("video not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PlaybackUpdate {
    time: f64,
    #[serde(default)]
    updated_at: Option<i64>,
}

async fn update_playback(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(payload): Json<PlaybackUpdate>,
) -> ApiResult<Json<PlaybackPosition>> {
    let exists = state
        .store
        .get_video(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .is_some();
    if !exists {
        return Err(ApiError::not_found("video not found"));
    }

    let position = PlaybackPosition {
        time: payload.time,
        updated_at: payload
            .updated_at
            .unwrap_or_else(|| Utc::now().timestamp_millis()),
    };
    state
        .store
        .upsert_playback(&id, &position)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(position))
}

async fn stream_video_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&id)?;

    let record = state
        .store
        .get_video(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("video not found"))?;

    // Filenames come from the downloader's restricted charset, but a stored
    // record is still never allowed to point outside the videos directory.
    ensure_safe_path_segment(&record.filename)?;
    let path = state.videos_dir.join(&record.filename);
    stream_file(path, None, Some(&headers)).await
}

async fn proxy_thumbnail(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let record = state
        .store
        .get_video(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    let thumbnail = record
        .thumbnail
        .ok_or_else(|| ApiError::not_found("video has no thumbnail"))?;

    let upstream = state.http.get(&thumbnail).send().await.map_err(|err| {
        warn!(%err, video_id = %id, "thumbnail fetch failed");
        ApiError::internal("failed to fetch thumbnail")
    })?;
    if !upstream.status().is_success() {
        return Err(ApiError::not_found("thumbnail not available"));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE.as_str())
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned());

    let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        "max-age=31536000, immutable".parse().unwrap(),
    );
    if let Some(content_type) = content_type
        && let Ok(value) = content_type.parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Validates that a single dynamic path segment never escapes its base
/// folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
