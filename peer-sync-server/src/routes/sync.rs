//! Endpoints an origin drives during a sync.

use crate::error::AppError;
use crate::state::AppState;
use crate::storage::{BackupDir, DEFAULT_ORIGIN};
use axum::body::Bytes;
use axum::extract::{Multipart, Query, Request, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use peer_sync::archive::{extract_archive, ArchiveStats};
use peer_sync::crypto::KeyStore;
use peer_sync::peer::{SourceInfo, REMOTE_MANIFEST_NAME, SOURCE_INFO_NAME, SOURCE_SERVER_HEADER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/manifest", get(get_manifest).put(put_manifest))
        .route("/file", post(upload_file).delete(delete_file))
        .route("/list-physical-files", get(list_physical_files))
        .route("/source-info", put(put_source_info))
        .route("/receive", post(receive_archive))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub user_id: Option<i64>,
    pub share_name: Option<String>,
    pub source_server: Option<String>,
    pub path: Option<String>,
}

impl SyncQuery {
    fn origin(&self, headers: &HeaderMap) -> String {
        self.source_server
            .clone()
            .or_else(|| {
                headers
                    .get(SOURCE_SERVER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string())
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::BadRequest(format!("Missing {name}")))
}

fn backup_dir(base: &Path, query: &SyncQuery, headers: &HeaderMap) -> Result<BackupDir, AppError> {
    let owner_id = required(query.user_id, "user_id")?;
    let share_name = required(query.share_name.as_deref(), "share_name")?;
    BackupDir::resolve(base, &query.origin(headers), owner_id, share_name)
}

/// Write `stream` to a hidden temp file next to `dest`, then rename it over
/// `dest`. Returns the number of bytes written.
async fn write_atomic<S, E>(stream: S, dest: &Path) -> Result<u64, AppError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = BackupDir::temp_for(dest);
    let result = write_stream(stream, &temp).await;
    match result {
        Ok(size) => {
            tokio::fs::rename(&temp, dest).await?;
            Ok(size)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            Err(e)
        }
    }
}

async fn write_stream<S, E>(stream: S, path: &Path) -> Result<u64, AppError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Read error: {e}")))?;
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let dir = backup_dir(&state.config.incoming_dir, &query, &headers)?;
    let path = dir.file(REMOTE_MANIFEST_NAME)?;
    match tokio::fs::read(&path).await {
        Ok(sealed) => Ok(([(header::CONTENT_TYPE, "application/octet-stream")], sealed)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound("No manifest".into())),
        Err(e) => Err(e.into()),
    }
}

async fn put_manifest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<Value>, AppError> {
    let dir = backup_dir(&state.config.incoming_dir, &query, &headers)?;
    let path = dir.file(REMOTE_MANIFEST_NAME)?;
    let size = write_atomic(request.into_body().into_data_stream(), &path).await?;
    tracing::debug!(backup = %dir.root().display(), size, "Stored manifest");
    Ok(Json(json!({ "success": true })))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let origin = query.origin(&headers);
    let mut owner_id = query.user_id;
    let mut share_name = query.share_name.clone();
    let mut relative_path: Option<String> = None;
    let mut stored = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => {
                let text = field.text().await?;
                owner_id = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| AppError::BadRequest(format!("Invalid user_id: {text:?}")))?,
                );
            }
            "share_name" => share_name = Some(field.text().await?),
            "relative_path" => relative_path = Some(field.text().await?),
            "file" => {
                let relative = required(relative_path.clone(), "relative_path before file")?;
                let dir = BackupDir::resolve(
                    &state.config.incoming_dir,
                    &origin,
                    required(owner_id, "user_id")?,
                    required(share_name.as_deref(), "share_name")?,
                )?;
                let dest = dir.file(&relative)?;
                let size = write_atomic(field, &dest).await?;
                stored = Some((relative, size));
            }
            other => tracing::debug!("Ignoring multipart field {:?}", other),
        }
    }

    let (path, size) = stored.ok_or_else(|| AppError::BadRequest("Missing file part".into()))?;
    tracing::debug!(path = %path, size, "Stored blob");
    Ok(Json(json!({ "success": true, "path": path, "size": size })))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let dir = backup_dir(&state.config.incoming_dir, &query, &headers)?;
    let relative = required(query.path.as_deref(), "path")?;
    let path = dir.file(relative)?;

    let removed = tokio::task::spawn_blocking(move || dir.remove_file(&path))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    tracing::debug!(path = %relative, removed, "Deleted blob");
    Ok(Json(json!({ "success": true, "deleted": removed })))
}

async fn list_physical_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let dir = backup_dir(&state.config.incoming_dir, &query, &headers)?;
    let files = tokio::task::spawn_blocking(move || dir.physical_files())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({ "files": files })))
}

async fn put_source_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    Json(info): Json<SourceInfo>,
) -> Result<Json<Value>, AppError> {
    let dir = backup_dir(&state.config.incoming_dir, &query, &headers)?;
    let path = dir.file(SOURCE_INFO_NAME)?;
    let body = serde_json::to_vec_pretty(&info).map_err(|e| anyhow::anyhow!(e))?;
    let chunks = futures_util::stream::once(async move { Ok::<_, std::convert::Infallible>(Bytes::from(body)) });
    write_atomic(chunks, &path).await?;
    Ok(Json(json!({ "success": true })))
}

/// Legacy strategy: one encrypted tar.zst of the whole tree, extracted in place.
async fn receive_archive(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let origin = query.origin(&headers);
    let mut owner_id = query.user_id;
    let mut share_name = query.share_name.clone();
    let mut encrypted = true;
    let mut received: Option<PathBuf> = None;

    tokio::fs::create_dir_all(&state.config.archive_dir).await?;
    let staging = state
        .config
        .archive_dir
        .join(format!(".receive-{}.tmp", uuid::Uuid::new_v4()));

    let outcome = async {
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "user_id" => {
                    let text = field.text().await?;
                    owner_id = Some(
                        text.trim()
                            .parse()
                            .map_err(|_| AppError::BadRequest(format!("Invalid user_id: {text:?}")))?,
                    );
                }
                "share_name" => share_name = Some(field.text().await?),
                "encrypted" => encrypted = field.text().await?.trim() != "false",
                "archive" => {
                    let size = write_stream(field, &staging).await?;
                    tracing::debug!(size, "Received archive");
                    received = Some(staging.clone());
                }
                other => tracing::debug!("Ignoring multipart field {:?}", other),
            }
        }

        let archive = required(received.take(), "archive part")?;
        let owner_id = required(owner_id, "user_id")?;
        let dir = BackupDir::resolve(
            &state.config.archive_dir,
            &origin,
            owner_id,
            required(share_name.as_deref(), "share_name")?,
        )?;

        let state = state.clone();
        let stats = tokio::task::spawn_blocking(move || -> Result<ArchiveStats, AppError> {
            let file = BufReader::new(std::fs::File::open(&archive)?);
            let stats = if encrypted {
                let key = state.keys.key_for(owner_id)?;
                extract_archive(state.cipher.reader(&key, file), dir.root())?
            } else {
                extract_archive(file, dir.root())?
            };
            Ok(stats)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
        Ok::<_, AppError>(stats)
    }
    .await;

    let _ = tokio::fs::remove_file(&staging).await;
    let stats = outcome?;
    tracing::info!(owner_id = ?owner_id, origin = %origin, files = stats.files, "Extracted archive");
    Ok(Json(json!({ "success": true, "files": stats.files, "bytes": stats.bytes })))
}
