use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message as exchanged with the browser and stored in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Fixed-width UTC timestamps so that stored values sort lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Error, Debug)]
pub enum LumenError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl LumenError {
    pub fn internal(msg: impl Into<String>) -> Self {
        LumenError::Internal(msg.into(), SpanTrace::capture())
    }

    /// Status and machine-readable code reported to clients.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            LumenError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            LumenError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            LumenError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            LumenError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            LumenError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            LumenError::QuotaExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED"),
            LumenError::Upstream(status, _) => (upstream_client_status(*status), "UPSTREAM_ERROR"),
            LumenError::Network(_) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            LumenError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            LumenError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            LumenError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            LumenError::Internal(_, _) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Message safe to hand back to a client. Storage and IO internals stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            LumenError::Validation(m)
            | LumenError::Unauthorized(m)
            | LumenError::Conflict(m)
            | LumenError::NotFound(m)
            | LumenError::RateLimited(m)
            | LumenError::QuotaExceeded(m)
            | LumenError::Upstream(_, m) => m.clone(),
            LumenError::Network(_) => "Upstream provider unreachable".to_string(),
            LumenError::Database(_)
            | LumenError::Serialization(_)
            | LumenError::Io(_)
            | LumenError::Internal(_, _) => "Internal server error".to_string(),
        }
    }
}

impl From<JsonRejection> for LumenError {
    fn from(rejection: JsonRejection) -> Self {
        LumenError::Validation(rejection.body_text())
    }
}

/// `axum::Json` for request bodies. Rejections answer with the usual error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ObservedError))]
pub struct ApiJson<T>(pub T);

/// Provider statuses passed through to the caller; everything else is a gateway failure.
pub fn upstream_client_status(status: StatusCode) -> StatusCode {
    match status {
        StatusCode::TOO_MANY_REQUESTS => StatusCode::TOO_MANY_REQUESTS,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StatusCode::BAD_REQUEST,
        StatusCode::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: LumenError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn status(&self) -> StatusCode {
        self.inner.status_and_code().0
    }
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<LumenError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.inner.status_and_code();
        if status.is_server_error() {
            tracing::error!(
                code = code,
                "Request failed: {}\n\nSpan Trace:\n{}",
                self.inner,
                self.span_trace
            );
        } else {
            tracing::debug!(code = code, "Request rejected: {}", self.inner);
        }
        (
            status,
            axum::Json(serde_json::json!({
                "error": self.inner.client_message(),
                "code": code,
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
