use crate::command_block::{merge, CommandBlock, CommandScanner};
use crate::constants::{
    MAX_STREAM_LINES, MAX_STREAM_LINE_BYTES, SSE_KEEPALIVE_SECS, STREAM_CHANNEL_CAPACITY,
};
use crate::hardening::CircuitBreaker;
use crate::sessions::{SessionStatus, SessionStore};
use crate::specs::openai::{parse_stream_line, LineEvent, OpenAiChunk, Usage};
use crate::types::SessionId;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::Instrument;

pub type EventSender = mpsc::Sender<std::result::Result<Event, Infallible>>;

/// Everything a relay task needs once the handler has returned.
pub struct RelayContext {
    pub session_id: SessionId,
    pub provider: String,
    pub model: String,
    pub sessions: Arc<SessionStore>,
    pub breaker: Arc<CircuitBreaker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
    Stop,
}

fn sse_event(name: &str, data: serde_json::Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

/// Turns a successful upstream streaming response into an SSE response and
/// spawns the task that relays it.
pub async fn relay_upstream(response: reqwest::Response, ctx: RelayContext) -> Response {
    ctx.sessions
        .set_status(&ctx.session_id, SessionStatus::Streaming)
        .await;

    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let lines_stream = FramedRead::new(
        StreamReader::new(bytes_stream),
        LinesCodec::new_with_max_length(MAX_STREAM_LINE_BYTES),
    );

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    // Fresh channel, so the first event always fits.
    let _ = tx.try_send(Ok(sse_event(
        "session",
        json!({ "session_id": ctx.session_id }),
    )));

    let stream_span = tracing::info_span!(
        "stream",
        session = %ctx.session_id.short(),
        provider = %ctx.provider,
        model = %ctx.model
    );
    tokio::spawn(StreamHandler::handle_stream(lines_stream, ctx, tx).instrument(stream_span));

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        )
        .into_response()
}

pub struct StreamHandler {
    ctx: RelayContext,
    tx: EventSender,
    scanner: CommandScanner,
    blocks: Vec<CommandBlock>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    chunks: u64,
}

impl StreamHandler {
    pub async fn handle_stream<R>(
        mut lines_stream: FramedRead<StreamReader<R, Bytes>, LinesCodec>,
        ctx: RelayContext,
        tx: EventSender,
    ) where
        R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
    {
        let start = Instant::now();
        let mut handler = StreamHandler {
            ctx,
            tx,
            scanner: CommandScanner::new(),
            blocks: Vec::new(),
            usage: None,
            finish_reason: None,
            chunks: 0,
        };
        let mut line_count = 0usize;

        let flow = loop {
            let Some(line_result) = lines_stream.next().await else {
                tracing::debug!("[☁️  -> ⚙️ ] Upstream closed without [DONE]");
                break Flow::Done;
            };

            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                tracing::error!("[☁️  -> ⚙️ ] Stream exceeded max line limit ({})", MAX_STREAM_LINES);
                handler.fail("Stream exceeded max line limit").await;
                break Flow::Stop;
            }

            let flow = match line_result {
                Ok(line) => handler.process_line(&line).await,
                Err(e) => {
                    handler.handle_line_error(e).await;
                    Flow::Stop
                }
            };
            if flow != Flow::Continue {
                break flow;
            }
        };

        if flow == Flow::Done {
            handler.finish_stream().await;
        }

        tracing::info!(
            chunks = handler.chunks,
            blocks = handler.scanner.blocks_found(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "[⚙️  -> 🌐] Stream relay finished"
        );
    }

    async fn process_line(&mut self, line: &str) -> Flow {
        match parse_stream_line(line) {
            None => Flow::Continue,
            Some(LineEvent::Done) => {
                tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                Flow::Done
            }
            Some(LineEvent::Chunk(chunk)) => self.handle_chunk(chunk).await,
            Some(LineEvent::Error(err)) => {
                tracing::error!(
                    code = ?err.error.code,
                    "[☁️  -> ⚙️ ] Provider error mid-stream: {}",
                    err.error.message
                );
                self.ctx.breaker.record_failure().await;
                let message = if err.error.message.is_empty() {
                    "Upstream provider error".to_string()
                } else {
                    err.error.message
                };
                self.fail(&message).await;
                Flow::Stop
            }
            Some(LineEvent::Unknown(data)) => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unrecognised stream line: {}",
                    crate::str_utils::prefix_chars(&data, 120)
                );
                Flow::Continue
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: OpenAiChunk) -> Flow {
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) else {
                continue;
            };

            if !self.emit("delta", json!({ "content": content })).await {
                return Flow::Stop;
            }
            self.chunks += 1;
            self.ctx.sessions.add_progress(&self.ctx.session_id, 1).await;

            for block in self.scanner.push(&content) {
                if !self.emit_block(block).await {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    async fn handle_line_error(&mut self, e: LinesCodecError) {
        tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", e);
        let message = match e {
            LinesCodecError::MaxLineLengthExceeded => "Upstream stream line too long".to_string(),
            LinesCodecError::Io(io) => format!("Upstream stream interrupted: {}", io),
        };
        self.ctx.breaker.record_failure().await;
        self.fail(&message).await;
    }

    async fn emit_block(&mut self, block: CommandBlock) -> bool {
        for warning in &block.warnings {
            tracing::warn!("[⚙️ ] Command block warning: {}", warning);
        }
        self.ctx.sessions.record_commands(&self.ctx.session_id, &block).await;
        let data = match serde_json::to_value(&block) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize command block: {}", e);
                return true;
            }
        };
        self.blocks.push(block);
        self.emit("command", data).await
    }

    /// Returns false once the client has gone away.
    async fn emit(&mut self, name: &str, data: serde_json::Value) -> bool {
        if self.tx.send(Ok(sse_event(name, data))).await.is_err() {
            tracing::info!("Client disconnected, stopping stream");
            self.ctx
                .sessions
                .fail(&self.ctx.session_id, "Client disconnected")
                .await;
            return false;
        }
        true
    }

    async fn fail(&mut self, message: &str) {
        self.ctx.sessions.fail(&self.ctx.session_id, message).await;
        let _ = self.tx.send(Ok(sse_event("error", json!({ "error": message })))).await;
    }

    async fn finish_stream(&mut self) {
        if let Some(block) = self.scanner.finish() {
            if !self.emit_block(block).await {
                return;
            }
        }

        let command = merge(std::mem::take(&mut self.blocks));
        let done = json!({
            "session_id": self.ctx.session_id,
            "finish_reason": self.finish_reason,
            "usage": self.usage,
            "command": command,
        });
        if self.emit("done", done).await {
            self.ctx.sessions.complete(&self.ctx.session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    async fn run(chunks: Vec<&'static str>) -> (String, SessionStatus) {
        let sessions = Arc::new(SessionStore::new());
        let owner = UserId("u".into());
        let session_id = sessions.begin(&owner, None).await;
        let ctx = RelayContext {
            session_id: session_id.clone(),
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            sessions: sessions.clone(),
            breaker: Arc::new(CircuitBreaker::new(3, Duration::from_secs(30))),
        };

        let upstream = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
        );
        let lines = FramedRead::new(StreamReader::new(upstream), LinesCodec::new_with_max_length(4096));

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        StreamHandler::handle_stream(lines, ctx, tx).await;

        let body = Sse::new(ReceiverStream::new(rx)).into_response().into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let status = sessions.get(&session_id, &owner).await.unwrap().status;
        (String::from_utf8(bytes.to_vec()).unwrap(), status)
    }

    #[tokio::test]
    async fn test_relay_emits_deltas_command_and_done() {
        let (wire, status) = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Reading <comm\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ands>request_files: [a.rs]</commands>\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
        ])
        .await;

        assert_eq!(wire.matches("event: delta").count(), 2);
        assert!(wire.contains("event: command\ndata: {\"request_files\":[\"a.rs\"]"));
        assert!(wire.contains("event: done"));
        assert!(wire.contains("\"finish_reason\":\"stop\""));
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_relay_reports_provider_error() {
        let (wire, status) = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
            "data: {\"error\":{\"message\":\"overloaded\"}}\n",
            "data: [DONE]\n",
        ])
        .await;

        assert!(wire.contains("event: error\ndata: {\"error\":\"overloaded\"}"));
        assert!(!wire.contains("event: done"));
        assert_eq!(status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unterminated_block_is_reported_at_end() {
        let (wire, status) = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"<commands>request_files: [b.rs\"}}]}\n",
        ])
        .await;

        assert!(wire.contains("event: command"));
        assert!(wire.contains("event: done"));
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_relay_marks_session_streaming_before_first_delta() {
        let sessions = Arc::new(SessionStore::new());
        let owner = UserId("u".into());
        let session_id = sessions.begin(&owner, None).await;
        let ctx = RelayContext {
            session_id: session_id.clone(),
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            sessions: sessions.clone(),
            breaker: Arc::new(CircuitBreaker::new(3, Duration::from_secs(30))),
        };

        // Upstream accepted the request but has not sent a byte yet.
        let silent = futures_util::stream::pending::<std::result::Result<Bytes, std::io::Error>>();
        let upstream = axum::http::Response::new(reqwest::Body::wrap_stream(silent));
        let response = relay_upstream(reqwest::Response::from(upstream), ctx).await;
        assert!(response.status().is_success());

        let snap = sessions.get(&session_id, &owner).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Streaming);
        assert_eq!(snap.progress, 0);
    }
}
