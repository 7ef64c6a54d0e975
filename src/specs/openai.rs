use crate::types::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// --- OPENAI-COMPATIBLE CHAT COMPLETIONS SCHEMA ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl OpenAiResponse {
    /// Text of the first choice; providers that return no content yield "".
    pub fn content(&self) -> String {
        self.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChoice {
    pub message: OpenAiResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChunk {
    #[serde(default)]
    pub choices: Vec<OpenAiChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChunkChoice {
    #[serde(default)]
    pub delta: OpenAiDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Error envelope some providers push mid-stream instead of a chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderError {
    pub error: ProviderErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum LineEvent {
    Chunk(OpenAiChunk),
    Error(ProviderError),
    Done,
    Unknown(String),
}

/// Classifies one SSE line from an upstream stream. Comment and blank lines
/// come back as `None`.
pub fn parse_stream_line(line: &str) -> Option<LineEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(LineEvent::Done);
    }
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return Some(LineEvent::Error(err));
    }
    match serde_json::from_str::<OpenAiChunk>(data) {
        Ok(chunk) => Some(LineEvent::Chunk(chunk)),
        Err(_) => Some(LineEvent::Unknown(data.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_chunk() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        match parse_stream_line(line) {
            Some(LineEvent::Chunk(chunk)) => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_done_comment_and_error() {
        assert!(matches!(parse_stream_line("data: [DONE]"), Some(LineEvent::Done)));
        assert!(parse_stream_line(": keepalive").is_none());
        assert!(parse_stream_line("").is_none());
        let err = r#"data: {"error":{"message":"overloaded","code":529}}"#;
        match parse_stream_line(err) {
            Some(LineEvent::Error(e)) => assert_eq!(e.error.message, "overloaded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_usage_only_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        match parse_stream_line(line) {
            Some(LineEvent::Chunk(chunk)) => {
                assert!(chunk.choices.is_empty());
                assert_eq!(chunk.usage.unwrap().total_tokens, 8);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_content() {
        let body = r#"{"id":"x","choices":[{"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;
        let resp: OpenAiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.content(), "hi");
    }
}
