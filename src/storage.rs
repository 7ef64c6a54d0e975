use crate::auth::AuthUser;
use crate::constants::{DEFAULT_CONTENT_TYPE, STORAGE_NAME_MAX_CHARS};
use crate::types::{now_timestamp, LumenError, Result, UserId};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-user blob store on local disk: `<root>/<user_id>/<object_id>`.
pub struct StorageService {
    root: PathBuf,
    quota_bytes: u64,
    upload_lock: Mutex<()>,
}

#[derive(Debug, Serialize)]
pub struct StorageObject {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub object_count: u64,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
}

impl StorageService {
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
            upload_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    fn object_path(&self, user_id: &UserId, object_id: &str) -> PathBuf {
        self.root.join(&user_id.0).join(object_id)
    }

    /// Writes an object's bytes. A failed write leaves nothing on disk.
    async fn write_object(
        &self,
        user_id: &UserId,
        object_id: &str,
        body: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.object_path(user_id, object_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::write(&path, body).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(path)
    }

    /// Writes and removes a probe file under the root.
    pub async fn is_writable(&self) -> bool {
        let probe = self.root.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(e) => {
                tracing::warn!("Storage root {:?} is not writable: {}", self.root, e);
                false
            }
        }
    }
}

pub fn validate_object_name(name: &str) -> Result<()> {
    let invalid = name.trim().is_empty()
        || name.chars().count() > STORAGE_NAME_MAX_CHARS
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.chars().any(char::is_control);
    if invalid {
        return Err(LumenError::Validation(format!("Invalid file name '{}'", name.escape_default())).into());
    }
    Ok(())
}

fn content_disposition(name: &str) -> HeaderValue {
    let safe: String = name.chars().map(|c| if c == '"' { '_' } else { c }).collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn usage_for(state: &AppState, user_id: &UserId) -> Result<(u64, u64)> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(size_bytes), 0) AS used, COUNT(*) AS objects
         FROM storage_objects WHERE user_id = ?",
    )
    .bind(&user_id.0)
    .fetch_one(&state.db)
    .await?;
    let used: i64 = row.get("used");
    let objects: i64 = row.get("objects");
    Ok((used.max(0) as u64, objects.max(0) as u64))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StorageObject>)> {
    let name = query.name.unwrap_or_default();
    validate_object_name(&name)?;
    if body.is_empty() {
        return Err(LumenError::Validation("Upload body must not be empty".to_string()).into());
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let size = body.len() as u64;

    let storage = &state.storage;
    let _guard = storage.upload_lock.lock().await;

    let exists = sqlx::query("SELECT 1 FROM storage_objects WHERE user_id = ? AND name = ?")
        .bind(&user.id.0)
        .bind(&name)
        .fetch_optional(&state.db)
        .await?
        .is_some();
    if exists {
        return Err(LumenError::Conflict(format!("A file named '{}' already exists", name)).into());
    }

    let (used, _) = usage_for(&state, &user.id).await?;
    if used.saturating_add(size) > storage.quota_bytes {
        tracing::info!(
            user = %user.id.short(),
            used,
            size,
            quota = storage.quota_bytes,
            "Upload rejected: quota exceeded"
        );
        return Err(LumenError::QuotaExceeded(format!(
            "Storage quota exceeded ({} + {} > {} bytes)",
            used, size, storage.quota_bytes
        ))
        .into());
    }

    let id = uuid::Uuid::new_v4().to_string();
    let path = storage.write_object(&user.id, &id, &body).await?;

    let created_at = now_timestamp();
    let inserted = sqlx::query(
        "INSERT INTO storage_objects (id, user_id, name, content_type, size_bytes, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&user.id.0)
    .bind(&name)
    .bind(&content_type)
    .bind(size as i64)
    .bind(&created_at)
    .execute(&state.db)
    .await;
    if let Err(e) = inserted {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e.into());
    }

    tracing::info!(user = %user.id.short(), object = %id, size, "Stored upload");
    Ok((
        StatusCode::CREATED,
        Json(StorageObject {
            id,
            name,
            content_type,
            size_bytes: size,
            created_at,
        }),
    ))
}

fn object_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageObject {
    let size: i64 = row.get("size_bytes");
    StorageObject {
        id: row.get("id"),
        name: row.get("name"),
        content_type: row.get("content_type"),
        size_bytes: size.max(0) as u64,
        created_at: row.get("created_at"),
    }
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<StorageObject>>> {
    let rows = sqlx::query(
        "SELECT id, name, content_type, size_bytes, created_at FROM storage_objects
         WHERE user_id = ? ORDER BY created_at DESC, name",
    )
    .bind(&user.id.0)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows.iter().map(object_from_row).collect()))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Response> {
    let row = sqlx::query(
        "SELECT id, name, content_type, size_bytes, created_at FROM storage_objects
         WHERE id = ? AND user_id = ?",
    )
    .bind(&id)
    .bind(&user.id.0)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| LumenError::NotFound("File not found".to_string()))?;
    let object = object_from_row(&row);

    let bytes = match tokio::fs::read(state.storage.object_path(&user.id, &object.id)).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!(object = %object.id, "Storage record has no file on disk");
            return Err(LumenError::NotFound("File not found".to_string()).into());
        }
        Err(e) => return Err(e.into()),
    };

    let content_type = HeaderValue::from_str(&object.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, content_disposition(&object.name)),
        ],
        bytes,
    )
        .into_response())
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let deleted = sqlx::query("DELETE FROM storage_objects WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&user.id.0)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(LumenError::NotFound("File not found".to_string()).into());
    }

    match tokio::fs::remove_file(state.storage.object_path(&user.id, &id)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(object = %id, "Failed to remove stored file: {}", e),
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<StorageUsage>> {
    let (used_bytes, object_count) = usage_for(&state, &user.id).await?;
    Ok(Json(StorageUsage {
        used_bytes,
        quota_bytes: state.storage.quota_bytes,
        object_count,
    }))
}
