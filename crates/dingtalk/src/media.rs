//! Media upload and session-scoped download.
//!
//! Expected failures (missing file, oversized file, HTTP errors) are logged
//! and reported as `None`; callers carry on without the media.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    reqwest::multipart::{Form, Part},
    serde::Deserialize,
    serde_json::json,
    tracing::{debug, warn},
};

use crate::{
    client::{DingTalkClient, check_errcode},
    error::{Error, Result},
    message::MediaKind,
};

const DOWNLOAD_PATH: &str = "/v1.0/robot/messageFiles/download";

/// Upload categories of the legacy media endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    Image,
    Voice,
    Video,
    #[default]
    File,
}

impl MediaType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    /// Largest upload the platform accepts for this type.
    #[must_use]
    pub fn max_bytes(self) -> u64 {
        const MB: u64 = 1024 * 1024;
        match self {
            Self::Voice => 2 * MB,
            Self::Image | Self::Video | Self::File => 20 * MB,
        }
    }

    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => Self::Image,
            "amr" | "mp3" | "wav" | "ogg" | "m4a" | "aac" | "opus" => Self::Voice,
            "mp4" | "mov" | "avi" | "mkv" | "webm" => Self::Video,
            _ => Self::File,
        }
    }

    /// Concrete type for `path`: an explicit non-file type is kept, the
    /// generic `File` is refined from the extension.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        if self != Self::File {
            return self;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::File)
    }
}

/// Map a file extension to its MIME type.
#[must_use]
pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "amr" => "audio/amr",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "m4a" | "aac" => "audio/aac",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    match base {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "audio/amr" => Some("amr"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "video/mp4" => Some("mp4"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

fn default_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "jpg",
        MediaKind::Audio => "amr",
        MediaKind::Video => "mp4",
        MediaKind::File => "bin",
    }
}

/// Keep only characters that are safe in a file name.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let sanitized: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect();
    // Strip leading dots to prevent hidden files / traversal remnants.
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized.is_empty() {
        "media".to_string()
    } else {
        sanitized.to_string()
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub media_id: String,
    pub media_type: MediaType,
    /// Upload time, epoch milliseconds.
    pub created_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    media_id: String,
    #[serde(default)]
    created_at: Option<i64>,
}

/// Inbound media written to local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMediaFile {
    pub local_path: PathBuf,
    pub mime_type: String,
    pub original_file_name: Option<String>,
    pub downloaded_at: SystemTime,
    pub expires_at: SystemTime,
}

/// One file to fetch for a session.
#[derive(Debug, Clone)]
pub struct DownloadRequest<'a> {
    pub download_code: &'a str,
    pub kind: MediaKind,
    pub session_key: &'a str,
    /// Root under which per-session directories are created.
    pub store_dir: &'a Path,
    pub file_name: Option<&'a str>,
    /// How long the file is kept.
    pub retention: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlResponse {
    #[serde(default)]
    download_url: String,
}

/// Directory holding a session's media under `store_dir`.
#[must_use]
pub fn session_media_dir(store_dir: &Path, session_key: &str) -> PathBuf {
    store_dir.join(sanitize_file_name(session_key))
}

#[derive(Clone)]
pub struct MediaTransfer {
    client: DingTalkClient,
}

impl MediaTransfer {
    pub fn new(client: DingTalkClient) -> Self {
        Self { client }
    }

    /// Upload a local file. Returns `None` when the file is missing, too
    /// large for its type, or the platform rejects it.
    pub async fn upload(&self, path: &Path, declared: MediaType) -> Option<UploadedMedia> {
        match self.try_upload(path, declared).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "dingtalk media upload failed");
                None
            },
        }
    }

    async fn try_upload(&self, path: &Path, declared: MediaType) -> Result<Option<UploadedMedia>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                warn!(path = %path.display(), "media file not found");
                return Ok(None);
            },
        };
        let media_type = declared.resolve(path);
        if metadata.len() > media_type.max_bytes() {
            warn!(
                path = %path.display(),
                size = metadata.len(),
                limit = media_type.max_bytes(),
                media_type = media_type.as_str(),
                "media file exceeds upload limit"
            );
            return Ok(None);
        }

        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("media")
            .to_string();
        let mime = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(mime_from_extension)
            .unwrap_or("application/octet-stream");
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)?;
        let form = Form::new().part("media", part);

        let token = self.client.access_token().await?;
        let url = format!("{}/media/upload", self.client.oapi_base());
        let resp = self
            .client
            .http()
            .post(url)
            .query(&[("access_token", token.as_str()), ("type", media_type.as_str())])
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Error::api("media upload", status.as_u16(), text));
        }
        check_errcode("media upload", &text)?;

        let body: UploadResponse = serde_json::from_str(&text)?;
        if body.media_id.is_empty() {
            return Err(Error::message("dingtalk media upload returned no media_id"));
        }
        let created_at_ms = body
            .created_at
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or_else(now_ms);
        debug!(media_id = %body.media_id, media_type = media_type.as_str(), "media uploaded");
        Ok(Some(UploadedMedia {
            media_id: body.media_id,
            media_type,
            created_at_ms,
        }))
    }

    /// Fetch an inbound file into the session's media directory. Returns
    /// `None` if any step fails.
    pub async fn download(&self, request: &DownloadRequest<'_>) -> Option<SessionMediaFile> {
        match self.try_download(request).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(
                    session_key = request.session_key,
                    kind = request.kind.as_str(),
                    error = %e,
                    "dingtalk media download failed"
                );
                None
            },
        }
    }

    async fn try_download(&self, request: &DownloadRequest<'_>) -> Result<SessionMediaFile> {
        let resolved: DownloadUrlResponse = self
            .client
            .post_json(
                "media download",
                DOWNLOAD_PATH,
                &json!({
                    "downloadCode": request.download_code,
                    "robotCode": self.client.robot_code(),
                }),
            )
            .await?;
        if resolved.download_url.is_empty() {
            return Err(Error::message("dingtalk returned no download url"));
        }

        let resp = self.client.http().get(&resolved.download_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::api("media fetch", status.as_u16(), body));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?;

        let file_name = local_file_name(request, content_type.as_deref());
        let dir = prepare_session_dir(request.store_dir, request.session_key).await;
        let local_path = dir.join(&file_name);
        tokio::fs::write(&local_path, &bytes).await?;

        let mime_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
            .unwrap_or_else(|| {
                let ext = Path::new(&file_name)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or_default();
                mime_from_extension(ext).to_string()
            });
        let downloaded_at = SystemTime::now();
        debug!(
            path = %local_path.display(),
            bytes = bytes.len(),
            mime_type = %mime_type,
            "media downloaded"
        );
        Ok(SessionMediaFile {
            local_path,
            mime_type,
            original_file_name: request.file_name.map(str::to_string),
            downloaded_at,
            expires_at: downloaded_at + request.retention,
        })
    }
}

fn local_file_name(request: &DownloadRequest<'_>, content_type: Option<&str>) -> String {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let prefix = &unique[..8];
    match request.file_name.filter(|name| !name.trim().is_empty()) {
        Some(name) => format!("{prefix}-{}", sanitize_file_name(name)),
        None => {
            let ext = content_type
                .and_then(extension_for_content_type)
                .unwrap_or_else(|| default_extension(request.kind));
            format!("{}-{prefix}.{ext}", request.kind.as_str())
        },
    }
}

/// Create the session directory, falling back to the system temp dir.
async fn prepare_session_dir(store_dir: &Path, session_key: &str) -> PathBuf {
    let dir = session_media_dir(store_dir, session_key);
    match tokio::fs::create_dir_all(&dir).await {
        Ok(()) => dir,
        Err(e) => {
            let fallback = std::env::temp_dir().join("dingbridge-media");
            warn!(
                dir = %dir.display(),
                fallback = %fallback.display(),
                error = %e,
                "cannot create session media dir, using temp dir"
            );
            if let Err(e) = tokio::fs::create_dir_all(&fallback).await {
                warn!(error = %e, "cannot create temp media dir");
            }
            fallback
        },
    }
}

/// Delete files in `dir` whose modification time is older than `retention`.
/// Returns how many files were removed.
pub async fn cleanup_session_media(dir: &Path, retention: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let expired = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > retention);
        if expired {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "media cleanup failed"),
            }
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "expired session media removed");
    }
    removed
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
