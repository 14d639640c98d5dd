#![forbid(unsafe_code)]

// Image upload endpoint - accepts a single image and serves it back
// under /uploads/ as an opaque URL that clients paste into chat.

use crate::signaling::SignalingServer;
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

/// Default upload size cap (5 MiB).
const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Upload storage configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory uploaded images are written to
    pub dir: PathBuf,
    /// Per-file size cap in bytes
    pub max_bytes: usize,
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let dir = std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string());
        let max_bytes = std::env::var("MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        Self {
            dir: PathBuf::from(dir),
            max_bytes,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub url: String,
}

/// Checks the client-supplied filename extension and MIME type against the
/// accepted image formats. Returns the extension to store the file under.
fn image_extension(file_name: &str, content_type: Option<&str>) -> Option<&'static str> {
    let ext = std::path::Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    let canonical = match ext.as_str() {
        "jpg" => "jpg",
        "jpeg" => "jpeg",
        "png" => "png",
        "gif" => "gif",
        _ => return None,
    };
    if let Some(ct) = content_type {
        if !matches!(ct, "image/jpeg" | "image/png" | "image/gif") {
            return None;
        }
    }
    Some(canonical)
}

/// POST /upload — multipart form with a single "image" field.
/// The stored filename is a fresh UUID; the client-supplied name is used
/// only for extension sniffing and never touches the filesystem.
pub async fn upload_handler(
    State(server): State<SignalingServer>,
    mut multipart: Multipart,
) -> Response {
    let config = server.upload_config().clone();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("Malformed upload: {e}"));
            }
        };

        if field.name() != Some("image") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);

        let Some(ext) = image_extension(&file_name, content_type.as_deref()) else {
            return json_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Only jpeg, jpg, png and gif images are accepted",
            );
        };

        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("Failed to read upload: {e}"));
            }
        };
        if data.is_empty() {
            return json_error(StatusCode::BAD_REQUEST, "Empty upload");
        }
        if data.len() > config.max_bytes {
            return json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("Image exceeds the {} byte limit", config.max_bytes),
            );
        }

        if let Err(e) = tokio::fs::create_dir_all(&config.dir).await {
            error!("Failed to create upload directory {:?}: {}", config.dir, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload");
        }

        let stored_name = format!("{}.{ext}", Uuid::new_v4());
        let path = config.dir.join(&stored_name);
        if let Err(e) = tokio::fs::write(&path, &data).await {
            error!("Failed to write upload {:?}: {}", path, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload");
        }

        info!("Stored upload {} ({} bytes)", stored_name, data.len());
        return Json(UploadResponse {
            url: format!("/uploads/{stored_name}"),
        })
        .into_response();
    }

    json_error(StatusCode::BAD_REQUEST, "Missing \"image\" field")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
