//! HTTP surface: a form page, the download endpoint, and artifact retrieval.
//!
//! Each `POST /download` blocks (on the blocking pool) until the engine is
//! done; there is no queue and no progress reporting. Failures are logged in
//! full and answered with a generic message per error kind.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    error::RetrievalError,
    retrieval::{DownloadRequest, JobRunner, MediaFormat},
    store::{ArtifactStore, StoreError},
};

#[derive(Clone)]
pub struct AppState {
    runner: Arc<JobRunner>,
    store: Arc<ArtifactStore>,
}

impl AppState {
    pub fn new(runner: JobRunner, store: ArtifactStore) -> Self {
        Self {
            runner: Arc::new(runner),
            store: Arc::new(store),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download", post(download))
        .route("/downloads/{filename}", get(serve_artifact))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
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
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

impl From<RetrievalError> for ApiError {
    fn from(err: RetrievalError) -> Self {
        error!(error = %err, "retrieval failed");
        let (status, message) = match err {
            RetrievalError::SourceUnavailable(_) => (
                StatusCode::BAD_GATEWAY,
                "The requested media is unavailable.",
            ),
            RetrievalError::NetworkFailure(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Could not reach the media source. Please try again.",
            ),
            RetrievalError::Collision { .. } => (
                StatusCode::CONFLICT,
                "A file with the same name already exists.",
            ),
            RetrievalError::ArtifactMissing { .. }
            | RetrievalError::Filesystem { .. }
            | RetrievalError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "The download failed. Please try again later.",
            ),
        };
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidName(name) => {
                warn!(name, "rejected artifact name");
                Self::not_found("file not found")
            }
            StoreError::NotFound(_) => Self::not_found("file not found"),
            io @ StoreError::Io { .. } => {
                error!(error = %io, "artifact lookup failed");
                Self::internal("could not read file")
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Body of `POST /download`. Both fields are optional at the parsing stage so
/// a missing URL gets a readable message instead of a deserializer error.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadForm {
    #[serde(default)]
    pub url: Option<String>,
    /// Only a string naming a known format selects it; anything else, a
    /// number included, is unrecognised and means video.
    #[serde(default)]
    pub format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub filename: String,
    pub artist: String,
    pub song: String,
}

/// RECEIVED -> VALIDATING. The format falls back to video when missing or
/// unrecognised.
pub fn validate_form(form: DownloadForm) -> ApiResult<DownloadRequest> {
    let url = form
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("Please provide a URL."))?;

    let parsed = Url::parse(url).map_err(|_| ApiError::bad_request("The URL is not valid."))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::bad_request("Only http and https URLs are supported."));
    }

    Ok(DownloadRequest {
        url: parsed.to_string(),
        format: MediaFormat::from_choice(form.format.as_ref().and_then(|value| value.as_str())),
    })
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadForm>, JsonRejection>,
) -> ApiResult<Json<DownloadResponse>> {
    let Json(form) = payload.map_err(|rejection| ApiError {
        status: rejection.status(),
        message: rejection.body_text(),
    })?;
    let request = validate_form(form)?;

    let retrieval = state.runner.run(request).await?;
    info!(job_id = %retrieval.artifact.job_id, file = %retrieval.artifact.file_name, "download ready");

    Ok(Json(DownloadResponse {
        filename: retrieval.artifact.file_name,
        artist: retrieval.metadata.artist,
        song: retrieval.metadata.song,
    }))
}

async fn serve_artifact(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    let artifact = state.store.open(&filename).await?;

    let stream = ReaderStream::new(artifact.file);
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    if let Some(mime) = MimeGuess::from_path(&artifact.path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.len));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// in RFC 5987 `filename*` form.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = urlencoding::encode(filename);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>mediagrab</title>
<style>
  body { font-family: sans-serif; max-width: 40rem; margin: 3rem auto; }
  input[type=text] { width: 100%; }
  .error { color: #b00020; }
</style>
</head>
<body>
<h2>Download audio or video</h2>
<form id="grab">
  <p><label>URL <input type="text" name="url" required></label></p>
  <p>
    <label><input type="radio" name="format" value="mp3"> MP3 (audio)</label>
    <label><input type="radio" name="format" value="mp4" checked> MP4 (video)</label>
  </p>
  <p><button type="submit">Download</button></p>
</form>
<p id="status"></p>
<script>
const form = document.getElementById("grab");
const status = document.getElementById("status");
form.addEventListener("submit", async (event) => {
  event.preventDefault();
  const data = new FormData(form);
  status.className = "";
  status.textContent = "Working, this can take a while...";
  try {
    const res = await fetch("/download", {
      method: "POST",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify({ url: data.get("url"), format: data.get("format") }),
    });
    const body = await res.json();
    if (!res.ok) {
      status.className = "error";
      status.textContent = body.error;
      return;
    }
    status.textContent = "";
    const link = document.createElement("a");
    link.href = "/downloads/" + encodeURIComponent(body.filename);
    link.textContent = "Download " + body.filename;
    const meta = document.createElement("div");
    meta.textContent = "Artist: " + body.artist + " / Song: " + body.song;
    status.append(link, meta);
  } catch (err) {
    status.className = "error";
    status.textContent = "Request failed: " + err;
  }
});
</script>
</body>
</html>
"#;
