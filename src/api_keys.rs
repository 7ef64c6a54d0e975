use crate::auth::AuthUser;
use crate::db::DbPool;
use crate::str_utils::mask_secret;
use crate::types::{now_timestamp, ApiJson, LumenError, Result, UserId};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ApiKeyView {
    pub provider: String,
    pub masked_key: String,
    pub updated_at: String,
}

#[derive(Deserialize)]
pub struct PutApiKeyRequest {
    pub api_key: String,
}

pub async fn find_user_key(db: &DbPool, user_id: &UserId, provider: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT api_key FROM api_keys WHERE user_id = ? AND provider = ?")
        .bind(&user_id.0)
        .bind(provider)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|r| r.get("api_key")))
}

/// The caller's own key wins over the server-wide one.
pub async fn resolve_api_key(state: &AppState, user_id: &UserId, provider: &str) -> Result<Option<String>> {
    if let Some(key) = find_user_key(&state.db, user_id, provider).await? {
        return Ok(Some(key));
    }
    Ok(state.providers.server_key(provider).map(str::to_string))
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ApiKeyView>>> {
    let rows = sqlx::query(
        "SELECT provider, api_key, updated_at FROM api_keys WHERE user_id = ? ORDER BY provider",
    )
    .bind(&user.id.0)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(
        rows.iter()
            .map(|r| {
                let key: String = r.get("api_key");
                ApiKeyView {
                    provider: r.get("provider"),
                    masked_key: mask_secret(&key),
                    updated_at: r.get("updated_at"),
                }
            })
            .collect(),
    ))
}

pub async fn put_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
    ApiJson(payload): ApiJson<PutApiKeyRequest>,
) -> Result<Json<ApiKeyView>> {
    if state.providers.get(&provider).is_none() {
        return Err(LumenError::Validation(format!("Unknown provider '{}'", provider)).into());
    }
    let api_key = payload.api_key.trim();
    if api_key.is_empty() {
        return Err(LumenError::Validation("api_key must not be empty".to_string()).into());
    }

    let updated_at = now_timestamp();
    sqlx::query(
        "INSERT INTO api_keys (user_id, provider, api_key, updated_at) VALUES (?, ?, ?, ?)
         ON CONFLICT(user_id, provider) DO UPDATE SET api_key = excluded.api_key, updated_at = excluded.updated_at",
    )
    .bind(&user.id.0)
    .bind(&provider)
    .bind(api_key)
    .bind(&updated_at)
    .execute(&state.db)
    .await?;

    tracing::info!(user = %user.id.short(), provider = %provider, "Stored provider API key");
    Ok(Json(ApiKeyView {
        provider,
        masked_key: mask_secret(api_key),
        updated_at,
    }))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<StatusCode> {
    let deleted = sqlx::query("DELETE FROM api_keys WHERE user_id = ? AND provider = ?")
        .bind(&user.id.0)
        .bind(&provider)
        .execute(&state.db)
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(LumenError::NotFound(format!("No API key stored for '{}'", provider)).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
