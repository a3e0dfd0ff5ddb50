//! Output file browser, thumbnails and the static Web UI.

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tower_http::services::ServeDir;

use crate::error::ServerError;
use crate::state::AppState;

const THUMB_DIR: &str = ".thumbs";
const THUMB_SIZE: u32 = 120;

pub fn router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let mut router = Router::new()
        .route("/output", get(browse_root))
        .route("/output/", get(browse_root))
        .route("/output/{*path}", get(browse))
        .route("/thumb/{*path}", get(thumbnail));

    if let Some(webui) = &state.webui_dir {
        router = router
            .route("/ui", get(|| async { Redirect::permanent("/ui/") }))
            .nest_service("/ui/", ServeDir::new(webui));
    }
    router
}

async fn browse_root(State(state): State<Arc<AppState>>) -> Result<Response, ServerError> {
    serve_path(&state, "").await
}

async fn browse(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ServerError> {
    serve_path(&state, &path).await
}

/// Directory -> JSON listing; file -> raw bytes with a guessed MIME type.
async fn serve_path(state: &AppState, rel: &str) -> Result<Response, ServerError> {
    let full = resolve(&state.output_dir, rel)?;

    if full.is_dir() {
        let listing = tokio::task::spawn_blocking(move || list_directory(&full))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))??;
        return Ok(Json(json!({ "path": rel, "entries": listing })).into_response());
    }

    if full.is_file() {
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| ServerError::Internal(format!("cannot read {}: {e}", full.display())))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(mime_for(&full)),
        );
        return Ok((headers, bytes).into_response());
    }

    Err(ServerError::NotFound(format!("no such file: {rel}")))
}

fn list_directory(dir: &FsPath) -> Result<Vec<Value>, ServerError> {
    let mut entries = Vec::new();
    let read = std::fs::read_dir(dir)
        .map_err(|e| ServerError::Internal(format!("cannot list {}: {e}", dir.display())))?;
    for entry in read.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == THUMB_DIR {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .map(|t| t.to_rfc3339());
        entries.push(json!({
            "name": name,
            "type": if metadata.is_dir() { "directory" } else { "file" },
            "size": metadata.len(),
            "modified": modified,
        }));
    }
    // Directories first, then files, alphabetical within each.
    entries.sort_by(|a, b| {
        let dir_a = a["type"] == "directory";
        let dir_b = b["type"] == "directory";
        dir_b
            .cmp(&dir_a)
            .then_with(|| a["name"].as_str().cmp(&b["name"].as_str()))
    });
    Ok(entries)
}

/// 120x120 JPEG thumbnail, cached in a `.thumbs` directory alongside the
/// media file and regenerated when the source is newer.
async fn thumbnail(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<(HeaderMap, Vec<u8>), ServerError> {
    let source = resolve(&state.output_dir, &path)?;
    if !source.is_file() {
        return Err(ServerError::NotFound(format!("no such file: {path}")));
    }

    let bytes = tokio::task::spawn_blocking(move || thumbnail_bytes(&source))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    Ok((headers, bytes))
}

fn thumbnail_bytes(source: &FsPath) -> Result<Vec<u8>, ServerError> {
    let parent = source
        .parent()
        .ok_or_else(|| ServerError::NotFound("no such file".into()))?;
    let cache_dir = parent.join(THUMB_DIR);
    let cached = cache_dir.join(format!(
        "{}.jpg",
        source.file_name().unwrap_or_default().to_string_lossy()
    ));

    let source_mtime = std::fs::metadata(source).and_then(|m| m.modified()).ok();
    let cached_mtime = std::fs::metadata(&cached).and_then(|m| m.modified()).ok();
    if let (Some(src), Some(cache)) = (source_mtime, cached_mtime) {
        if cache >= src {
            if let Ok(bytes) = std::fs::read(&cached) {
                return Ok(bytes);
            }
        }
    }

    let img = image::open(source)
        .map_err(|e| ServerError::BadRequest(format!("not a decodable image: {e}")))?;
    let thumb = img.thumbnail(THUMB_SIZE, THUMB_SIZE).to_rgb8();

    let mut out = std::io::Cursor::new(Vec::new());
    use image::ImageEncoder;
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80)
        .write_image(
            thumb.as_raw(),
            thumb.width(),
            thumb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| ServerError::Internal(format!("thumbnail encode failed: {e}")))?;
    let bytes = out.into_inner();

    // Cache write failures only cost regeneration next time.
    let _ = std::fs::create_dir_all(&cache_dir).and_then(|_| std::fs::write(&cached, &bytes));
    Ok(bytes)
}

/// Join `rel` under `root`, rejecting traversal outside it.
fn resolve(root: &FsPath, rel: &str) -> Result<PathBuf, ServerError> {
    let rel_path = FsPath::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ServerError::BadRequest("invalid path".into())),
        }
    }
    Ok(root.join(rel_path))
}

fn mime_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn traversal_is_rejected() {
        let root = FsPath::new("/srv/output");
        assert!(resolve(root, "job/image.png").is_ok());
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "job/../../etc").is_err());
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(mime_for(FsPath::new("a.PNG")), "image/png");
        assert_eq!(mime_for(FsPath::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(FsPath::new("config.json")), "application/json");
        assert_eq!(mime_for(FsPath::new("blob")), "application/octet-stream");
    }
}
