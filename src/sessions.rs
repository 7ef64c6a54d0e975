use crate::auth::AuthUser;
use crate::command_block::{CommandBlock, WriteDiff};
use crate::types::{format_timestamp, LumenError, Result, SessionId, UserId};
use crate::AppState;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    owner: UserId,
    status: SessionStatus,
    progress: u64,
    files: Vec<String>,
    diffs: Vec<WriteDiff>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    touched: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub progress: u64,
    pub files: Vec<String>,
    pub diffs: Vec<WriteDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-process relay progress, keyed by session id. Not durable.
#[derive(Default)]
pub struct SessionStore {
    entries: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses `requested` when the caller owns it, otherwise starts a fresh session.
    pub async fn begin(&self, owner: &UserId, requested: Option<SessionId>) -> SessionId {
        let mut entries = self.entries.write().await;
        let now = Utc::now();

        if let Some(id) = requested {
            if let Some(entry) = entries.get_mut(&id) {
                if &entry.owner == owner {
                    entry.status = SessionStatus::Pending;
                    entry.progress = 0;
                    entry.error = None;
                    entry.updated_at = now;
                    entry.touched = Instant::now();
                    return id;
                }
                tracing::warn!(session = %id.short(), "Ignoring session id owned by another user");
            }
        }

        let id = SessionId::new();
        entries.insert(
            id.clone(),
            SessionEntry {
                owner: owner.clone(),
                status: SessionStatus::Pending,
                progress: 0,
                files: Vec::new(),
                diffs: Vec::new(),
                error: None,
                created_at: now,
                updated_at: now,
                touched: Instant::now(),
            },
        );
        id
    }

    async fn update<F>(&self, id: &SessionId, f: F)
    where
        F: FnOnce(&mut SessionEntry),
    {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            f(entry);
            entry.updated_at = Utc::now();
            entry.touched = Instant::now();
        }
    }

    pub async fn set_status(&self, id: &SessionId, status: SessionStatus) {
        self.update(id, |e| e.status = status).await;
    }

    pub async fn add_progress(&self, id: &SessionId, chunks: u64) {
        self.update(id, |e| {
            e.status = SessionStatus::Streaming;
            e.progress += chunks;
        })
        .await;
    }

    pub async fn record_commands(&self, id: &SessionId, block: &CommandBlock) {
        self.update(id, |e| {
            for file in &block.request_files {
                if !e.files.contains(file) {
                    e.files.push(file.clone());
                }
            }
            for diff in &block.write_diffs {
                if !e.diffs.contains(diff) {
                    e.diffs.push(diff.clone());
                }
            }
        })
        .await;
    }

    pub async fn complete(&self, id: &SessionId) {
        self.update(id, |e| e.status = SessionStatus::Completed).await;
    }

    pub async fn fail(&self, id: &SessionId, error: impl Into<String>) {
        let error = error.into();
        self.update(id, move |e| {
            e.status = SessionStatus::Failed;
            e.error = Some(error);
        })
        .await;
    }

    /// Snapshot visible only to the session owner.
    pub async fn get(&self, id: &SessionId, owner: &UserId) -> Option<SessionSnapshot> {
        let entries = self.entries.read().await;
        let entry = entries.get(id).filter(|e| &e.owner == owner)?;
        Some(SessionSnapshot {
            id: id.clone(),
            status: entry.status,
            progress: entry.progress,
            files: entry.files.clone(),
            diffs: entry.diffs.clone(),
            error: entry.error.clone(),
            created_at: format_timestamp(entry.created_at),
            updated_at: format_timestamp(entry.updated_at),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops sessions idle for longer than `ttl`. Returns how many were removed.
    pub async fn prune(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.touched.elapsed() <= ttl);
        before - entries.len()
    }
}

/// Periodically prunes idle sessions until the process exits.
pub fn spawn_session_gc(state: Arc<AppState>, interval: Duration, ttl: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.sessions.prune(ttl).await;
            state.login_throttle.prune().await;
            if removed > 0 {
                tracing::debug!("Session GC removed {} idle sessions", removed);
            }
        }
    })
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>> {
    state
        .sessions
        .get(&SessionId(id), &user.id)
        .await
        .map(Json)
        .ok_or_else(|| LumenError::NotFound("Session not found".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_reuses_only_owned_sessions() {
        let store = SessionStore::new();
        let alice = UserId("alice".into());
        let bob = UserId("bob".into());

        let id = store.begin(&alice, None).await;
        assert_eq!(store.begin(&alice, Some(id.clone())).await, id);
        assert_ne!(store.begin(&bob, Some(id.clone())).await, id);
        assert!(store.get(&id, &bob).await.is_none());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_lifecycle_accumulates_commands() {
        let store = SessionStore::new();
        let owner = UserId("u".into());
        let id = store.begin(&owner, None).await;

        store.add_progress(&id, 2).await;
        let block = CommandBlock {
            request_files: vec!["a.rs".into(), "a.rs".into()],
            write_diffs: vec![WriteDiff {
                path: "b.rs".into(),
                diff: "+x".into(),
            }],
            warnings: Vec::new(),
        };
        store.record_commands(&id, &block).await;
        store.record_commands(&id, &block).await;

        let snap = store.get(&id, &owner).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Streaming);
        assert_eq!(snap.progress, 2);
        assert_eq!(snap.files, vec!["a.rs"]);
        assert_eq!(snap.diffs.len(), 1);

        store.fail(&id, "boom").await;
        let snap = store.get(&id, &owner).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_prune_removes_only_idle_sessions() {
        let store = SessionStore::new();
        let owner = UserId("u".into());
        let stale = store.begin(&owner, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = store.begin(&owner, None).await;

        let removed = store.prune(Duration::from_millis(30)).await;
        assert_eq!(removed, 1);
        assert!(store.get(&stale, &owner).await.is_none());
        assert!(store.get(&fresh, &owner).await.is_some());
    }
}
