//! Sandboxed file REST: list, download, upload, touch. Every path is
//! resolved against the session's current working directory through the
//! sandbox; rejections surface as uniform 400/404 responses that reveal
//! nothing about the filesystem beyond "invalid" or "not found".

use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio_util::io::ReaderStream;

use common::sandbox;

use crate::web_server::{session_for_identity, AppState, Identity};

/// Concurrent `stat` calls while listing a directory.
const STAT_CONCURRENCY: usize = 50;

/// Listing responses stop after this many entries.
const LIST_CAP: usize = 1000;

type ApiError = (StatusCode, String);

fn invalid_path() -> ApiError {
    (StatusCode::BAD_REQUEST, "Invalid path".into())
}

fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, "Not found".into())
}

#[derive(serde::Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    path: Option<String>,
}

#[derive(serde::Serialize)]
pub struct FileEntry {
    name: String,
    is_dir: bool,
    size: u64,
    mtime: i64,
}

#[derive(serde::Serialize)]
pub struct FileListing {
    entries: Vec<FileEntry>,
    truncated: bool,
}

/// Resolve the sandbox base for `name`: ownership first, then the live
/// tmux cwd.
async fn session_base(
    state: &AppState,
    identity: &str,
    name: &str,
) -> Result<PathBuf, ApiError> {
    session_for_identity(identity, name)?;
    state.mux.get_cwd(name).await.map_err(|_| not_found())
}

async fn stat_entry(dir: &FsPath, name: String) -> Option<FileEntry> {
    let meta = tokio::fs::symlink_metadata(dir.join(&name)).await.ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some(FileEntry {
        name,
        is_dir: meta.is_dir(),
        size: meta.len(),
        mtime,
    })
}

/// GET /api/sessions/{name}/files?path=
pub async fn list_files(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<FileListing>, ApiError> {
    let base = session_base(&state, &identity, &name).await?;
    let requested = query.path.as_deref().unwrap_or(".");
    let dir = sandbox::validate_existing(requested, &base)
        .await
        .map_err(|_| invalid_path())?;

    let mut names = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|_| invalid_path())?;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    // Parallel stat in bounded batches; entries that vanish mid-listing
    // are simply skipped.
    let mut entries: Vec<FileEntry> = stream::iter(names)
        .map(|name| stat_entry(&dir, name))
        .buffer_unordered(STAT_CONCURRENCY)
        .filter_map(|entry| async { entry })
        .collect()
        .await;

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    let truncated = entries.len() > LIST_CAP;
    entries.truncate(LIST_CAP);

    Ok(Json(FileListing { entries, truncated }))
}

/// GET /api/sessions/{name}/files/download?path=
pub async fn download_file(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let base = session_base(&state, &identity, &name).await?;
    let requested = query.path.as_deref().ok_or_else(invalid_path)?;
    let resolved = sandbox::validate_no_symlink(requested, &base)
        .await
        .map_err(|_| invalid_path())?;

    let meta = tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }

    let file = tokio::fs::File::open(&resolved).await.map_err(|_| not_found())?;
    let mime = mime_guess::from_path(&resolved)
        .first_raw()
        .unwrap_or("application/octet-stream");
    let filename = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CONTENT_LENGTH, meta.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename.replace('"', "")),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(response)
}

#[derive(serde::Serialize)]
pub struct UploadResult {
    written: usize,
}

/// POST /api/sessions/{name}/files/upload?path= — raw request body, capped
/// by the per-route body limit (100 MiB).
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<Json<UploadResult>, ApiError> {
    let base = session_base(&state, &identity, &name).await?;
    let requested = query.path.as_deref().ok_or_else(invalid_path)?;
    let target = sandbox::validate_new(requested, &base)
        .await
        .map_err(|_| invalid_path())?;

    tokio::fs::write(&target, &body)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(UploadResult {
        written: body.len(),
    }))
}

/// POST /api/sessions/{name}/files/touch?path=
pub async fn touch_file(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let base = session_base(&state, &identity, &name).await?;
    let requested = query.path.as_deref().ok_or_else(invalid_path)?;
    let target = sandbox::validate_new(requested, &base)
        .await
        .map_err(|_| invalid_path())?;

    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&target)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
