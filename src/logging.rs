use crate::redaction::{redact_value, RedactionLevel};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Keeps a caller-supplied request id when it is sane, otherwise mints one.
fn request_id_from(req: &Request<Body>) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128 && v.chars().all(|c| c.is_ascii_graphic()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Wraps each request in a span carrying its id and echoes the id back.
/// The `user` field is filled in by the auth middleware.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = request_id_from(&req);
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        user = tracing::field::Empty,
    );

    let start = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;

    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );
    });

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// One-line summary of an outgoing completion request, plus a redacted dump at debug.
pub fn log_request_summary(provider: &str, payload: &serde_json::Value) {
    let messages = payload.get("messages").and_then(|m| m.as_array());
    let msg_count = messages.map(|m| m.len()).unwrap_or_default();
    let last_role = messages
        .and_then(|m| m.last())
        .and_then(|m| m.get("role"))
        .and_then(|r| r.as_str())
        .unwrap_or("NONE");
    let streaming = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or_default();

    info!(
        target: "flight_recorder",
        "[REQ] Provider: {} | Messages: {} | Last Role: {} | Stream: {}",
        provider, msg_count, last_role, streaming
    );

    if tracing::enabled!(tracing::Level::DEBUG) {
        let mut redacted = payload.clone();
        redact_value(&mut redacted, RedactionLevel::default());
        tracing::debug!(target: "flight_recorder", "[REQ] Payload: {}", redacted);
    }
}

pub fn log_response_summary(
    provider: &str,
    finish_reason: Option<&str>,
    content: &str,
    command_found: bool,
) {
    let content_status = if content.is_empty() {
        "EMPTY".to_string()
    } else {
        format!("TEXT[{}]", content.chars().count())
    };
    info!(
        target: "flight_recorder",
        "[RES] Provider: {} | Finish: {} | Content: {} | Commands: {}",
        provider,
        finish_reason.unwrap_or("UNKNOWN"),
        content_status,
        command_found
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_reused_when_valid() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_id_from(&req), "abc-123");
    }

    #[test]
    fn test_request_id_replaced_when_invalid() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "has space")
            .body(Body::empty())
            .unwrap();
        let id = request_id_from(&req);
        assert_ne!(id, "has space");
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
