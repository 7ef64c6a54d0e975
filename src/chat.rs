use crate::api_keys::resolve_api_key;
use crate::auth::AuthUser;
use crate::command_block::{extract_command_blocks, merge, strip_command_blocks, CommandBlock};
use crate::constants::MAX_CHAT_MESSAGES;
use crate::hardening::{CircuitBreaker, RetryPolicy};
use crate::providers::ProviderSpec;
use crate::specs::openai::{OpenAiRequest, OpenAiResponse};
use crate::streaming::{relay_upstream, RelayContext};
use crate::types::{ApiJson, ChatMessage, LumenError, ObservedError, Result, Role, SessionId};
use crate::AppState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Serialize)]
pub struct ProviderAvailability {
    pub id: String,
    pub name: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub available: bool,
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw {
        "system" => Some(Role::System),
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        _ => None,
    }
}

/// Checks the conversation and converts it to wire messages.
pub fn validate_messages(messages: &[IncomingMessage]) -> Result<Vec<ChatMessage>> {
    if messages.is_empty() {
        return Err(LumenError::Validation("messages must not be empty".to_string()).into());
    }
    if messages.len() > MAX_CHAT_MESSAGES {
        return Err(LumenError::Validation(format!(
            "Too many messages ({} > {})",
            messages.len(),
            MAX_CHAT_MESSAGES
        ))
        .into());
    }

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let role = parse_role(&m.role).ok_or_else(|| {
                LumenError::Validation(format!("messages[{}]: unknown role '{}'", i, m.role))
            })?;
            if m.content.trim().is_empty() {
                return Err(
                    LumenError::Validation(format!("messages[{}]: content must not be empty", i))
                        .into(),
                );
            }
            Ok(ChatMessage {
                role,
                content: m.content.clone(),
            })
        })
        .collect()
}

/// GET /api/chat
pub async fn list_chat_providers(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ProviderAvailability>>> {
    let stored: HashSet<String> = sqlx::query("SELECT provider FROM api_keys WHERE user_id = ?")
        .bind(&user.id.0)
        .fetch_all(&state.db)
        .await?
        .iter()
        .map(|r| r.get("provider"))
        .collect();

    Ok(Json(
        state
            .providers
            .all()
            .iter()
            .map(|p| ProviderAvailability {
                id: p.id.clone(),
                name: p.name.clone(),
                default_model: p.default_model.clone(),
                models: p.models.clone(),
                available: stored.contains(&p.id) || state.providers.server_key(&p.id).is_some(),
            })
            .collect(),
    ))
}

/// POST /api/chat
#[tracing::instrument(
    name = "chat",
    skip_all,
    fields(provider = tracing::field::Empty, model = tracing::field::Empty, session = tracing::field::Empty)
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<ChatRequest>,
) -> Result<Response> {
    let span = tracing::Span::current();
    let spec = state
        .providers
        .get(&payload.provider)
        .cloned()
        .ok_or_else(|| LumenError::Validation(format!("Unknown provider '{}'", payload.provider)))?;
    let model = payload
        .model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| spec.default_model.clone());
    span.record("provider", spec.id.as_str());
    span.record("model", model.as_str());

    let messages = validate_messages(&payload.messages)?;
    let api_key = resolve_api_key(&state, &user.id, &spec.id)
        .await?
        .ok_or_else(|| {
            LumenError::Validation(format!("No API key configured for provider '{}'", spec.id))
        })?;

    let session_id = state
        .sessions
        .begin(&user.id, payload.session_id.clone().map(SessionId))
        .await;
    span.record("session", session_id.short());

    let streaming = payload.stream.unwrap_or(false);
    let outgoing = OpenAiRequest {
        model: model.clone(),
        messages,
        stream: streaming.then_some(true),
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
    };
    match serde_json::to_value(&outgoing) {
        Ok(value) => crate::logging::log_request_summary(&spec.id, &value),
        Err(e) => tracing::warn!("Failed to serialize request for logging: {}", e),
    }

    let breaker = state
        .providers
        .breaker(&spec.id)
        .ok_or_else(|| LumenError::internal(format!("No circuit breaker for '{}'", spec.id)))?;

    let response = match execute_upstream_request(&state, &spec, &breaker, &api_key, &outgoing).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Request Error: {}", e);
            state.sessions.fail(&session_id, e.inner.client_message()).await;
            return Err(e);
        }
    };

    if streaming {
        return Ok(relay_upstream(
            response,
            RelayContext {
                session_id,
                provider: spec.id,
                model,
                sessions: state.sessions.clone(),
                breaker,
            },
        )
        .await);
    }

    let body: OpenAiResponse = match response.json().await {
        Ok(b) => b,
        Err(e) => {
            state.sessions.fail(&session_id, "Malformed upstream response").await;
            return Err(LumenError::Network(e).into());
        }
    };

    let raw = body.content();
    let command = merge(extract_command_blocks(&raw));
    let content = strip_command_blocks(&raw);
    let finish_reason = body.choices.first().and_then(|c| c.finish_reason.clone());
    crate::logging::log_response_summary(
        &spec.id,
        finish_reason.as_deref(),
        &content,
        command.as_ref().is_some_and(CommandBlock::has_commands),
    );

    state.sessions.add_progress(&session_id, 1).await;
    if let Some(block) = &command {
        for warning in &block.warnings {
            tracing::warn!("[⚙️ ] Command block warning: {}", warning);
        }
        state.sessions.record_commands(&session_id, block).await;
    }
    state.sessions.complete(&session_id).await;

    Ok(Json(json!({
        "session_id": session_id,
        "provider": spec.id,
        "model": body.model.unwrap_or(model),
        "content": content,
        "command": command,
        "usage": body.usage,
        "finish_reason": finish_reason,
    }))
    .into_response())
}

/// Sends the completion request behind the provider's breaker, retrying
/// transient failures. Client-side rejections do not count against the breaker.
async fn execute_upstream_request(
    state: &Arc<AppState>,
    spec: &ProviderSpec,
    breaker: &CircuitBreaker,
    api_key: &str,
    outgoing: &OpenAiRequest,
) -> Result<reqwest::Response> {
    breaker.check().await?;

    let retry_policy = RetryPolicy::new(state.args.max_retries, 100);
    let url = spec.completions_url();
    let url = url.as_str();
    let client = &state.client;

    let result = retry_policy
        .execute_with_retry(move || async move {
            let response = client
                .post(url)
                .bearer_auth(api_key)
                .json(outgoing)
                .send()
                .await
                .map_err(|e| ObservedError::from(LumenError::Network(e)))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            tracing::warn!(
                "[☁️  -> ⚙️ ] Upstream {} returned {}: {}",
                spec.id,
                status,
                crate::str_utils::prefix_chars(&error_body, 300)
            );
            Err(ObservedError::from(LumenError::Upstream(
                status,
                upstream_error_message(&error_body, status),
            )))
        })
        .await;

    match &result {
        Ok(_) => breaker.record_success().await,
        Err(e) if RetryPolicy::is_retryable(e) || matches!(e.inner, LumenError::Network(_)) => {
            breaker.record_failure().await
        }
        Err(_) => {}
    }
    result
}

/// Pulls `error.message` out of a provider error body when there is one.
fn upstream_error_message(body: &str, status: reqwest::StatusCode) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("Upstream provider returned {}", status))
}
