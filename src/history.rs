use crate::auth::AuthUser;
use crate::constants::{HISTORY_DEFAULT_TITLE, HISTORY_ID_MAX_LEN, HISTORY_TITLE_MAX_CHARS};
use crate::str_utils::{collapse_whitespace, truncate_with_ellipsis};
use crate::types::{now_timestamp, ApiJson, ChatMessage, LumenError, Result, Role};
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
pub struct HistorySummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryRecord {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: String,
    pub timestamp: String,
}

#[derive(Deserialize)]
pub struct PutHistoryRequest {
    pub messages: Vec<ChatMessage>,
}

/// Title from the first user message, or the default when there is none.
pub fn derive_title(messages: &[ChatMessage]) -> String {
    let first = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| collapse_whitespace(&m.content))
        .unwrap_or_default();
    if first.is_empty() {
        HISTORY_DEFAULT_TITLE.to_string()
    } else {
        truncate_with_ellipsis(&first, HISTORY_TITLE_MAX_CHARS)
    }
}

pub fn validate_history_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= HISTORY_ID_MAX_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(LumenError::Validation(format!(
            "History id must be 1-{} characters of [A-Za-z0-9_-]",
            HISTORY_ID_MAX_LEN
        ))
        .into());
    }
    Ok(())
}

fn decode_messages(raw: &str) -> Result<Vec<ChatMessage>> {
    Ok(serde_json::from_str(raw)?)
}

pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<HistorySummary>>> {
    let rows = sqlx::query(
        "SELECT id, title, messages_json, updated_at FROM chat_histories
         WHERE user_id = ? ORDER BY updated_at DESC, id",
    )
    .bind(&user.id.0)
    .fetch_all(&state.db)
    .await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let raw: String = row.get("messages_json");
        let message_count = match decode_messages(&raw) {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(history = %id, "Stored history is unreadable: {}", e);
                0
            }
        };
        summaries.push(HistorySummary {
            id,
            title: row.get("title"),
            message_count,
            timestamp: row.get("updated_at"),
        });
    }
    Ok(Json(summaries))
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<HistoryRecord>> {
    let row = sqlx::query(
        "SELECT title, messages_json, created_at, updated_at FROM chat_histories
         WHERE user_id = ? AND id = ?",
    )
    .bind(&user.id.0)
    .bind(&id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| LumenError::NotFound("History not found".to_string()))?;

    let raw: String = row.get("messages_json");
    Ok(Json(HistoryRecord {
        id,
        title: row.get("title"),
        messages: decode_messages(&raw)?,
        created_at: row.get("created_at"),
        timestamp: row.get("updated_at"),
    }))
}

pub async fn put_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<PutHistoryRequest>,
) -> Result<Json<HistorySummary>> {
    validate_history_id(&id)?;
    if payload.messages.is_empty() {
        return Err(LumenError::Validation("messages must not be empty".to_string()).into());
    }

    let title = derive_title(&payload.messages);
    let messages_json = serde_json::to_string(&payload.messages)?;
    let now = now_timestamp();

    sqlx::query(
        "INSERT INTO chat_histories (id, user_id, title, messages_json, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, id) DO UPDATE SET
            title = excluded.title,
            messages_json = excluded.messages_json,
            updated_at = excluded.updated_at",
    )
    .bind(&id)
    .bind(&user.id.0)
    .bind(&title)
    .bind(&messages_json)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    tracing::debug!(history = %id, messages = payload.messages.len(), "Saved chat history");
    Ok(Json(HistorySummary {
        id,
        title,
        message_count: payload.messages.len(),
        timestamp: now,
    }))
}

pub async fn delete_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let deleted = sqlx::query("DELETE FROM chat_histories WHERE user_id = ? AND id = ?")
        .bind(&user.id.0)
        .bind(&id)
        .execute(&state.db)
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(LumenError::NotFound("History not found".to_string()).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn test_title_from_first_user_message() {
        let msgs = vec![
            m(Role::System, "You are helpful"),
            m(Role::User, "  How do\n I  parse   TOML? "),
            m(Role::User, "second"),
        ];
        assert_eq!(derive_title(&msgs), "How do I parse TOML?");
    }

    #[test]
    fn test_title_truncates_long_messages() {
        let long = "é".repeat(80);
        let title = derive_title(&[m(Role::User, &long)]);
        assert_eq!(title, format!("{}...", "é".repeat(50)));
    }

    #[test]
    fn test_title_default_without_user_text() {
        assert_eq!(derive_title(&[m(Role::Assistant, "hi")]), HISTORY_DEFAULT_TITLE);
        assert_eq!(derive_title(&[m(Role::User, "   ")]), HISTORY_DEFAULT_TITLE);
    }

    #[test]
    fn test_history_id_rules() {
        assert!(validate_history_id("chat_01-A").is_ok());
        assert!(validate_history_id("").is_err());
        assert!(validate_history_id("../etc").is_err());
        assert!(validate_history_id(&"a".repeat(65)).is_err());
    }
}
