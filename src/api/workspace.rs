//! Workspace file CRUD and discovery (spec §6, §4.8): every path argument
//! goes through `ContentLoader`/`is_path_safe` before touching disk.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::content_loader::is_path_safe;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub path: String,
    pub content: String,
}

pub async fn get_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<Json<FileResponse>> {
    let loaded = state.content_loader.load(None, Some(&query.path), None).await?;
    Ok(Json(FileResponse {
        path: query.path,
        content: loaded.text,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WriteFileBody {
    pub content: String,
}

async fn write_file(root: &std::path::Path, path: &str, content: &str, create_only: bool) -> ApiResult<()> {
    let candidate = std::path::PathBuf::from(path);
    if !is_path_safe(root, &candidate) {
        return Err(ApiError::PathOutsideWorkspace(path.to_string()));
    }
    let full = root.join(&candidate);
    if create_only && tokio::fs::try_exists(&full).await.unwrap_or(false) {
        return Err(ApiError::ValidationError(format!("{path} already exists")));
    }
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| ApiError::Execute(e.to_string()))?;
    }
    tokio::fs::write(&full, content).await.map_err(|e| ApiError::Execute(e.to_string()))?;
    Ok(())
}

pub async fn put_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    Json(body): Json<WriteFileBody>,
) -> ApiResult<StatusCode> {
    write_file(state.content_loader.workspace_root(), &query.path, &body.content, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    Json(body): Json<WriteFileBody>,
) -> ApiResult<StatusCode> {
    write_file(state.content_loader.workspace_root(), &query.path, &body.content, true).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<StatusCode> {
    let root = state.content_loader.workspace_root();
    let candidate = std::path::PathBuf::from(&query.path);
    if !is_path_safe(root, &candidate) {
        return Err(ApiError::PathOutsideWorkspace(query.path));
    }
    let full = root.join(&candidate);
    tokio::fs::remove_file(&full).await.map_err(|_| ApiError::FileNotFound(query.path))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
}

pub async fn list_files(State(state): State<AppState>) -> Json<FilesResponse> {
    let root = state.content_loader.workspace_root().to_path_buf();
    let mut files = Vec::new();
    walk_dir(root.clone(), root, &mut files).await;
    files.sort();
    Json(FilesResponse { files })
}

/// Boxed to allow recursion into subdirectories; `root`/`dir` are owned so
/// the future's lifetime only has to account for the `out` accumulator.
fn walk_dir(
    root: std::path::PathBuf,
    dir: std::path::PathBuf,
    out: &mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                walk_dir(root.clone(), path, out).await;
            } else if let Ok(rel) = path.strip_prefix(&root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct RequestsResponse {
    pub requests: Vec<crate::model::ParsedRequest>,
}

pub async fn list_requests(State(state): State<AppState>, Query(query): Query<RequestsQuery>) -> ApiResult<Json<RequestsResponse>> {
    let loaded = state.content_loader.load(None, Some(&query.path), None).await?;
    let requests = state.parser.parse(&loaded.text).await.map_err(|e| ApiError::Parse(e.to_string()))?;
    Ok(Json(RequestsResponse { requests }))
}
