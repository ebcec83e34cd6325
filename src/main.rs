use std::{
    cmp::Ordering,
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::LazyLock,
    task::{Context, Poll},
};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf},
    net::TcpListener,
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    downloads_dir: PathBuf,
    ytdlp_bin: String,
}

const MAX_TITLE_CHARS: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const SHORT_FORM_SOCKET_TIMEOUT_SECS: &str = "60";

#[derive(Debug, Deserialize)]
struct FormatsRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: String,
    format_id: String,
    #[serde(default)]
    is_audio_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatsResponse {
    title: String,
    thumbnail: Option<String>,
    video_options: Vec<FormatOption>,
    audio_options: Vec<FormatOption>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatOption {
    format_id: String,
    label: String,
    resolution: Option<String>,
    ext: String,
    has_audio: bool,
}

/// One frame of the download event stream. Serialized with a lowercase
/// `status` tag and camelCase fields, which is the wire format the frontend
/// consumes off the SSE channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Downloading {
        percent: f64,
        total_size: String,
        speed: String,
        eta: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        filename: String,
        download_path: String,
    },
    Error { message: String },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    format_note: Option<String>,
    tbr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    abr: Option<f32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdlp_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let downloads_dir = resolve_downloads_dir();
    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the downloads directory: {error}"))
        })?;
    info!("Downloads directory ready at {:?}", downloads_dir);

    let state = AppState {
        downloads_dir: downloads_dir.clone(),
        ytdlp_bin: resolve_ytdlp_bin(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/fetch-formats", post(fetch_formats))
        .route("/api/download-video", post(download_video))
        .route("/api/direct-download", post(direct_download))
        .nest_service("/downloads", ServeDir::new(downloads_dir))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind to {addr}: {error}")))?;

    info!("Backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn fetch_formats(
    State(state): State<AppState>,
    Json(payload): Json<FormatsRequest>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    if !is_http_url(url) {
        return Err(ApiError::bad_request("A valid http(s) URL is required."));
    }

    let output = run_tool_output(
        &state.ytdlp_bin,
        vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ],
    )
    .await?;

    let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
        warn!("Could not parse yt-dlp metadata for URL {:?}: {error}", url);
        ApiError::internal("Failed to fetch video formats")
    })?;

    let mut video_options = build_video_options(&info.formats);
    let mut audio_options = build_audio_options(&info.formats);

    if video_options.is_empty() {
        video_options.push(FormatOption {
            format_id: "bestvideo+bestaudio/best".to_string(),
            label: "Best available quality".to_string(),
            resolution: Some("Auto".to_string()),
            ext: "mp4".to_string(),
            has_audio: true,
        });
    }

    if audio_options.is_empty() {
        audio_options.push(FormatOption {
            format_id: "bestaudio".to_string(),
            label: "Best available audio".to_string(),
            resolution: None,
            ext: "m4a".to_string(),
            has_audio: true,
        });
    }

    Ok(Json(FormatsResponse {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: info.thumbnail,
        video_options,
        audio_options,
    }))
}

/// Starts one download job and answers with an SSE stream of progress events.
///
/// The subprocess is owned by a spawned worker task; the response only holds
/// the receiving end of the event channel plus a drop guard that cancels the
/// job when the client side of the stream goes away.
async fn download_video(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim().to_string();
    let format_id = payload.format_id.trim().to_string();
    if url.is_empty() || format_id.is_empty() {
        return Err(ApiError::bad_request("URL and format ID are required"));
    }
    if !is_http_url(&url) {
        return Err(ApiError::bad_request("A valid http(s) URL is required."));
    }

    let title = fetch_video_title(&state.ytdlp_bin, &url).await?;
    let sanitized_title = sanitize_title(&title);
    let unique_id = new_unique_id(&format_id);
    let artifact_prefix = format!("{sanitized_title}-{unique_id}");
    let output_template = state
        .downloads_dir
        .join(format!("{artifact_prefix}.%(ext)s"));

    let args = build_download_args(
        &url,
        &format_id,
        payload.is_audio_only,
        &output_template.to_string_lossy(),
    );
    info!(
        "Processing download for {:?}: yt-dlp {:?}",
        sanitized_title, args
    );

    let (tx, rx) = mpsc::channel::<ProgressEvent>(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(run_download_job(
        state.ytdlp_bin.clone(),
        args,
        state.downloads_dir.clone(),
        artifact_prefix,
        tx,
        cancel.clone(),
    ));

    let guard = DisconnectGuard { cancel };
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _held = &guard;
        Event::default().json_data(&event)
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Pipes yt-dlp stdout straight into the response body instead of writing an
/// artifact to disk. The child handle travels inside the body stream, so a
/// client disconnect drops it and kill-on-drop reaps the process.
async fn direct_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim().to_string();
    let format_id = payload.format_id.trim().to_string();
    if url.is_empty() || format_id.is_empty() {
        return Err(ApiError::bad_request("URL and format ID are required"));
    }
    if !is_http_url(&url) {
        return Err(ApiError::bad_request("A valid http(s) URL is required."));
    }

    let title = fetch_video_title(&state.ytdlp_bin, &url).await?;
    let sanitized_title = sanitize_title(&title);
    let extension = if payload.is_audio_only { "mp3" } else { "mp4" };
    let filename = format!("{sanitized_title}.{extension}");

    let args = build_pipe_args(&url, &format_id, payload.is_audio_only);
    info!("Direct download started: yt-dlp {:?}", args);

    let mut child = spawn_tool(&state.ytdlp_bin, &args)
        .map_err(|error| ApiError::internal(spawn_error_message(&error)))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_tool_stderr(stderr));
    }
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ApiError::internal("Could not capture yt-dlp stdout"))?;

    let body = Body::from_stream(ReaderStream::new(PipedChild {
        _child: child,
        stdout,
    }));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(if payload.is_audio_only {
            "audio/mpeg"
        } else {
            "video/mp4"
        }),
    );
    let content_disposition = build_content_disposition(&filename);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, body).into_response())
}

/// Cancels the job token when dropped. The SSE stream owns one of these, so
/// dropping the response body (client disconnect or normal stream end) is the
/// single signal the worker watches for.
struct DisconnectGuard {
    cancel: CancellationToken,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keeps the child handle alive for as long as the response body is being
/// read. The child is spawned with kill-on-drop, so the subprocess dies as
/// soon as the body is dropped.
struct PipedChild {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for PipedChild {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

/// Owns one subprocess from spawn to terminal event.
///
/// Reads stdout incrementally, forwards every parsed progress record over the
/// channel, then emits exactly one terminal event: `Completed` when the
/// process exits cleanly and the artifact is found, `Error` otherwise. A
/// cancelled token means the client is gone; the child is killed and nothing
/// further is sent.
async fn run_download_job(
    bin: String,
    args: Vec<String>,
    downloads_dir: PathBuf,
    artifact_prefix: String,
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
) {
    let mut child = match spawn_tool(&bin, &args) {
        Ok(child) => child,
        Err(error) => {
            warn!("Could not spawn yt-dlp: {error}");
            let _ = tx
                .send(ProgressEvent::Error {
                    message: spawn_error_message(&error),
                })
                .await;
            return;
        }
    };

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_tool_stderr(stderr));
    }

    if let Some(mut stdout) = child.stdout.take() {
        let mut parser = ProgressParser::new();
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    kill_child(&mut child).await;
                    return;
                }
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]);
                            debug!("yt-dlp output: {}", chunk.trim_end());
                            for event in parser.push_chunk(&chunk) {
                                let _ = tx.send(event).await;
                            }
                        }
                        Err(error) => {
                            warn!("Could not read yt-dlp stdout: {error}");
                            break;
                        }
                    }
                }
            }
        }
        if let Some(event) = parser.finish() {
            let _ = tx.send(event).await;
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            kill_child(&mut child).await;
            return;
        }
        status = child.wait() => status,
    };

    let terminal = match status {
        Ok(status) if status.success() => {
            match find_artifact(&downloads_dir, &artifact_prefix).await {
                Some(filename) => {
                    info!("Download completed: {filename}");
                    ProgressEvent::Completed {
                        download_path: format!("/downloads/{filename}"),
                        filename,
                    }
                }
                None => {
                    warn!("yt-dlp exited cleanly but no file matches {artifact_prefix:?}");
                    ProgressEvent::Error {
                        message: "File not found after download".to_string(),
                    }
                }
            }
        }
        Ok(status) => {
            let code = status
                .code()
                .map_or_else(|| "unknown".to_string(), |code| code.to_string());
            ProgressEvent::Error {
                message: format!("Download failed with code {code}"),
            }
        }
        Err(error) => ProgressEvent::Error {
            message: format!("Could not wait for yt-dlp: {error}"),
        },
    };

    let _ = tx.send(terminal).await;
}

fn spawn_tool(bin: &str, args: &[String]) -> Result<Child, std::io::Error> {
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Idempotent kill: signalling a child that already exited (or was already
/// killed) is a no-op, never an error.
async fn kill_child(child: &mut Child) {
    if child.start_kill().is_ok() {
        let _ = child.wait().await;
        info!("yt-dlp process killed after client disconnect");
    }
}

async fn log_tool_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            debug!("yt-dlp stderr: {line}");
        }
    }
}

fn spawn_error_message(error: &std::io::Error) -> String {
    if error.kind() == ErrorKind::NotFound {
        "yt-dlp is not installed on this server. Install yt-dlp and restart the backend."
            .to_string()
    } else {
        format!("Could not run yt-dlp: {error}")
    }
}

async fn run_tool_output(bin: &str, args: Vec<String>) -> Result<std::process::Output, ApiError> {
    let output = Command::new(bin)
        .args(&args)
        .output()
        .await
        .map_err(|error| ApiError::internal(spawn_error_message(&error)))?;

    if !output.status.success() {
        return Err(ApiError::bad_request(last_stderr_line(&output.stderr)));
    }

    Ok(output)
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

/// Resolves the human-readable title used for the artifact filename. One
/// yt-dlp invocation, no retry; a failure rejects the whole job before the
/// event stream opens.
async fn fetch_video_title(bin: &str, url: &str) -> Result<String, ApiError> {
    let output = Command::new(bin)
        .args(["--get-title", "--restrict-filenames", url])
        .output()
        .await
        .map_err(|error| ApiError::internal(spawn_error_message(&error)))?;

    if !output.status.success() {
        let stderr = last_stderr_line(&output.stderr);
        return Err(ApiError::internal(format!(
            "Failed to get video title: {stderr}"
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Strips filesystem-hostile characters, collapses whitespace runs to single
/// underscores and bounds the length. Idempotent, so a sanitized title passes
/// through unchanged.
fn sanitize_title(title: &str) -> String {
    let mut sanitized = String::with_capacity(title.len());
    let mut in_whitespace = false;
    for character in title.chars() {
        if matches!(
            character,
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
        ) {
            continue;
        }
        if character.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
                in_whitespace = true;
            }
        } else {
            sanitized.push(character);
            in_whitespace = false;
        }
    }
    sanitized.chars().take(MAX_TITLE_CHARS).collect()
}

/// Job identifier carried in the artifact filename. The creation timestamp
/// alone can collide for rapid retries of the same format, so a short random
/// tail widens the uniqueness guarantee.
fn new_unique_id(format_id: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        format_id,
        Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}

/// Argument list for a streamed download. The branches mirror how source
/// sites actually behave: short-form hosts serve progressive streams over
/// flaky CDNs, everything else needs a separate audio stream merged in.
fn build_download_args(
    url: &str,
    format_id: &str,
    audio_only: bool,
    output_template: &str,
) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "-o".to_string(),
        output_template.to_string(),
        "--newline".to_string(),
    ];

    if audio_only {
        args.push("-f".to_string());
        args.push(format_id.to_string());
    } else if is_short_form_host(url) {
        args.push("--socket-timeout".to_string());
        args.push(SHORT_FORM_SOCKET_TIMEOUT_SECS.to_string());
        args.push("--no-check-certificates".to_string());
        args.push("-f".to_string());
        args.push(format_id.to_string());
    } else {
        args.push("-f".to_string());
        args.push(format!("{format_id}+bestaudio[ext=m4a]/bestaudio"));
        args.push("--merge-output-format".to_string());
        args.push("mp4".to_string());
    }

    args.push(url.to_string());
    args
}

/// Argument list for the direct-pipe mode (`-o -`). YouTube-family URLs get
/// the audio-merge selector; everything else takes the format id verbatim.
fn build_pipe_args(url: &str, format_id: &str, audio_only: bool) -> Vec<String> {
    let selector = if is_domain_match(url, "youtube.com") || is_domain_match(url, "youtu.be") {
        format!("{format_id}+bestaudio[ext=m4a]/bestaudio")
    } else {
        format_id.to_string()
    };

    let mut args = vec![
        "--no-playlist".to_string(),
        "-f".to_string(),
        selector,
        "-o".to_string(),
        "-".to_string(),
    ];
    if !audio_only {
        args.push("--merge-output-format".to_string());
        args.push("mp4".to_string());
    }
    args.push(url.to_string());
    args
}

fn is_short_form_host(input: &str) -> bool {
    is_domain_match(input, "tiktok.com")
}

fn is_domain_match(input: &str, domain: &str) -> bool {
    Url::parse(input)
        .ok()
        .and_then(|parsed| parsed.host_str().map(ToString::to_string))
        .map(|host| {
            let host = host.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
        .unwrap_or(false)
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
        .unwrap_or(false)
}

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[download\]\s+(\d+\.\d+)%\s+of\s+([\d.]+\w+)\s+at\s+([\d.]+\w+/s)\s+ETA\s+(\d+:\d+)",
    )
    .expect("progress pattern is valid")
});

/// Accumulates yt-dlp stdout and extracts progress records line by line.
///
/// Chunks may split lines at any byte, so matching only ever runs on complete
/// lines and the trailing partial line stays buffered; the events produced
/// are independent of how the text was chunked. Lines that are not progress
/// records produce nothing.
struct ProgressParser {
    pending: String,
}

impl ProgressParser {
    fn new() -> Self {
        Self {
            pending: String::new(),
        }
    }

    fn push_chunk(&mut self, chunk: &str) -> Vec<ProgressEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(event) = parse_progress_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes the buffer at stdout EOF; the final line may not be
    /// newline-terminated.
    fn finish(self) -> Option<ProgressEvent> {
        parse_progress_line(&self.pending)
    }
}

fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent = caps[1].parse::<f64>().ok()?;
    Some(ProgressEvent::Downloading {
        percent,
        total_size: caps[2].to_string(),
        speed: caps[3].to_string(),
        eta: caps[4].to_string(),
    })
}

/// Scans the downloads directory for the single file carrying this job's
/// unique prefix. yt-dlp picks the final extension, so the name is only
/// known by prefix.
async fn find_artifact(downloads_dir: &Path, prefix: &str) -> Option<String> {
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not open the downloads directory: {error}");
            return None;
        }
    };

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(prefix) {
                    return Some(name.to_string());
                }
            }
            Ok(None) => return None,
            Err(error) => {
                warn!("Could not read the downloads directory: {error}");
                return None;
            }
        }
    }
}

fn resolve_downloads_dir() -> PathBuf {
    if let Some(configured) = std::env::var("DOWNLOADS_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
    {
        return configured;
    }

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("public")
        .join("downloads")
}

fn resolve_ytdlp_bin() -> String {
    std::env::var("YTDLP_BIN")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| "yt-dlp".to_string())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8080".to_string()
}

fn build_video_options(formats: &[YtDlpFormat]) -> Vec<FormatOption> {
    let mut options: Vec<(u32, f32, f32, FormatOption)> = formats
        .iter()
        .filter(|item| has_video(item))
        .map(|item| {
            let ext = item.ext.clone().unwrap_or_else(|| "mp4".to_string());
            let resolution = item
                .height
                .map(|height| format!("{height}p"))
                .or_else(|| item.format_note.clone())
                .unwrap_or_else(|| "Video".to_string());

            let with_audio = has_audio(item);
            let size_label = item
                .filesize
                .or(item.filesize_approx)
                .map(format_filesize_mb)
                .unwrap_or_else(|| "variable size".to_string());

            let label = format!(
                "{resolution} · {} · {size_label} · {}",
                ext.to_uppercase(),
                if with_audio { "with audio" } else { "video only" }
            );

            let option = FormatOption {
                format_id: item.format_id.clone(),
                label,
                resolution: Some(resolution),
                ext,
                has_audio: with_audio,
            };

            (
                item.height.unwrap_or_default(),
                item.fps.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                option,
            )
        })
        .collect();

    options.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
    });

    dedup_options(options.into_iter().map(|(_, _, _, option)| option))
}

fn build_audio_options(formats: &[YtDlpFormat]) -> Vec<FormatOption> {
    let mut options: Vec<(f32, f32, FormatOption)> = formats
        .iter()
        .filter(|item| has_audio_only(item))
        .map(|item| {
            let ext = item.ext.clone().unwrap_or_else(|| "m4a".to_string());
            let bitrate = item.abr.unwrap_or(item.tbr.unwrap_or_default());
            let bitrate_label = if bitrate > 0.0 {
                format!("{} kbps", bitrate.round() as u32)
            } else {
                "variable bitrate".to_string()
            };
            let size_label = item
                .filesize
                .or(item.filesize_approx)
                .map(format_filesize_mb)
                .unwrap_or_else(|| "variable size".to_string());

            let label = format!(
                "Audio · {} · {bitrate_label} · {size_label}",
                ext.to_uppercase()
            );

            (
                item.abr.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                FormatOption {
                    format_id: item.format_id.clone(),
                    label,
                    resolution: None,
                    ext,
                    has_audio: true,
                },
            )
        })
        .collect();

    options.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });

    dedup_options(options.into_iter().map(|(_, _, option)| option))
}

fn dedup_options(options: impl Iterator<Item = FormatOption>) -> Vec<FormatOption> {
    let mut deduped = Vec::new();
    let mut seen_ids = HashSet::new();
    for option in options {
        if seen_ids.insert(option.format_id.clone()) {
            deduped.push(option);
        }
    }
    deduped
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn has_audio_only(format: &YtDlpFormat) -> bool {
    !has_video(format) && has_audio(format)
}

fn format_filesize_mb(bytes: f64) -> String {
    let mb = bytes / 1_048_576.0;
    if mb > 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{mb:.1} MB")
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
