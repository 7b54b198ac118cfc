//! HTTP client for the streaming backend's command API.
//!
//! Covers the contracts the client consumes: auth login, video/playlist
//! listing, video upload, and the stream start/stop/active/status
//! endpoints. Telemetry itself does not flow through here — that is the
//! per-session WebSocket channel in [`crate::channel`].

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::SessionId;

/// Errors from backend command requests.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("could not connect to backend at {0} — is the server running?")]
    Connect(String),
    #[error("request to backend at {0} timed out")]
    Timeout(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response from backend: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("failed to read {0}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Source kind for a stream start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Video,
    Playlist,
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "playlist" => Ok(Self::Playlist),
            other => Err(format!("invalid source type '{}' (expected 'video' or 'playlist')", other)),
        }
    }
}

/// Playback mode for a stream start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Once,
    LoopVideo,
    LoopPlaylist,
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "loop_video" => Ok(Self::LoopVideo),
            "loop_playlist" => Ok(Self::LoopPlaylist),
            other => Err(format!(
                "invalid mode '{}' (expected 'once', 'loop_video' or 'loop_playlist')",
                other
            )),
        }
    }
}

/// Body of `POST /api/streams/start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartStreamRequest {
    pub source_type: SourceType,
    pub source_id: u64,
    pub destination: String,
    pub mode: StreamMode,
}

/// A streaming session as reported by the backend. Returned by start,
/// status and the active list; most fields are optional since the backend
/// only enriches them once ffmpeg is producing progress output.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSession {
    pub id: SessionId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub rtmp_url: Option<String>,
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub dropped_frames: Option<u64>,
    #[serde(default)]
    pub start_time: Option<String>,
}

/// An uploaded video source.
#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub id: u64,
    pub filename: String,
    #[serde(default)]
    pub filepath: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistItem {
    pub id: u64,
    pub video_id: u64,
    pub order_index: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playlist {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client for the backend command API. Cheap to clone; the underlying
/// connection pool is shared.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    /// Build a client for the given base URL (e.g. `http://localhost:8000`)
    /// and optional bearer token.
    pub fn new(server: &str, token: Option<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Backend base URL, without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The configured bearer token, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Telemetry channel endpoint for a session: the HTTP base with the
    /// scheme swapped to ws/wss.
    pub fn ws_url_for(&self, id: SessionId) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", self.base)
        };
        format!("{}/ws/streams/{}", ws_base, id)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(ref tok) = self.token {
            req = req.bearer_auth(tok);
        }
        req
    }

    /// Convert a transport-level error into a human-friendly variant.
    fn transport_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_connect() {
            ApiError::Connect(self.base.clone())
        } else if e.is_timeout() {
            ApiError::Timeout(self.base.clone())
        } else if e.is_decode() {
            ApiError::Decode(e)
        } else {
            ApiError::Http(e)
        }
    }

    /// Turn a non-2xx response into `ApiError::Status`, extracting the
    /// backend's `detail` message when the body carries one.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
            .unwrap_or(body);
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Log in and return the bearer token. Does not mutate this client;
    /// the caller persists the token and builds a fresh client with it.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let resp = self
            .request(Method::POST, "/api/auth/login")
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        let token: TokenResponse = resp.json().await.map_err(|e| self.transport_error(e))?;
        Ok(token.access_token)
    }

    pub async fn list_videos(&self) -> Result<Vec<Video>, ApiError> {
        let resp = self
            .request(Method::GET, "/api/videos/")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }

    /// Upload an mp4 as a multipart form.
    pub async fn upload_video(&self, path: &Path) -> Result<Video, ApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ApiError::Io(path.to_path_buf(), e))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.mp4")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("video/mp4")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .request(Method::POST, "/api/videos/upload")
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }

    pub async fn list_playlists(&self) -> Result<Vec<Playlist>, ApiError> {
        let resp = self
            .request(Method::GET, "/api/playlists/")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }

    /// Start a streaming session. Returns the backend's view of the new
    /// session; its id is what telemetry channels attach to.
    pub async fn start_stream(&self, req: &StartStreamRequest) -> Result<StreamSession, ApiError> {
        let resp = self
            .request(Method::POST, "/api/streams/start")
            .json(req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }

    /// Stop a streaming session on the backend.
    pub async fn stop_stream(&self, id: SessionId) -> Result<(), ApiError> {
        let resp = self
            .request(Method::POST, &format!("/api/streams/stop/{}", id))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Sessions the backend currently reports as running.
    pub async fn active_streams(&self) -> Result<Vec<StreamSession>, ApiError> {
        let resp = self
            .request(Method::GET, "/api/streams/active")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }

    /// Status probe for a single session.
    pub async fn stream_status(&self, id: SessionId) -> Result<StreamSession, ApiError> {
        let resp = self
            .request(Method::GET, &format!("/api/streams/status/{}", id))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(|e| self.transport_error(e))
    }
}
