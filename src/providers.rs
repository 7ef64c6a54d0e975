use crate::hardening::{CircuitBreaker, CircuitState};
use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// (id, display name, base url, server key env var, models; first is the default)
const BUILTIN_PROVIDERS: &[(&str, &str, &str, &str, &[&str])] = &[
    (
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "OPENAI_API_KEY",
        &["gpt-4o-mini", "gpt-4o", "o3-mini"],
    ),
    (
        "anthropic",
        "Anthropic",
        "https://api.anthropic.com/v1",
        "ANTHROPIC_API_KEY",
        &["claude-3-5-sonnet-latest", "claude-3-5-haiku-latest"],
    ),
    (
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "GROQ_API_KEY",
        &["llama-3.3-70b-versatile", "llama-3.1-8b-instant"],
    ),
    (
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "MISTRAL_API_KEY",
        &["mistral-large-latest", "mistral-small-latest"],
    ),
    (
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "OPENROUTER_API_KEY",
        &["openrouter/auto"],
    ),
    (
        "deepseek",
        "DeepSeek",
        "https://api.deepseek.com/v1",
        "DEEPSEEK_API_KEY",
        &["deepseek-chat", "deepseek-reasoner"],
    ),
    (
        "together",
        "Together AI",
        "https://api.together.xyz/v1",
        "TOGETHER_API_KEY",
        &["meta-llama/Llama-3.3-70B-Instruct-Turbo"],
    ),
    (
        "xai",
        "xAI",
        "https://api.x.ai/v1",
        "XAI_API_KEY",
        &["grok-2-latest"],
    ),
];

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSpec {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(skip)]
    pub env_key: String,
    pub default_model: String,
    pub models: Vec<String>,
}

impl ProviderSpec {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Every provider speaks the OpenAI chat-completions wire format, so a
/// provider is plain data plus its own circuit breaker.
pub struct ProviderRegistry {
    providers: Vec<ProviderSpec>,
    server_keys: HashMap<String, String>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl ProviderRegistry {
    pub fn builtin(breaker_threshold: u32, breaker_recovery: Duration) -> Self {
        let providers: Vec<ProviderSpec> = BUILTIN_PROVIDERS
            .iter()
            .map(|(id, name, base_url, env_key, models)| ProviderSpec {
                id: id.to_string(),
                name: name.to_string(),
                base_url: base_url.to_string(),
                env_key: env_key.to_string(),
                default_model: models.first().map(|m| m.to_string()).unwrap_or_default(),
                models: models.iter().map(|m| m.to_string()).collect(),
            })
            .collect();

        let breakers = providers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    Arc::new(CircuitBreaker::new(breaker_threshold, breaker_recovery)),
                )
            })
            .collect();

        Self {
            providers,
            server_keys: HashMap::new(),
            breakers,
        }
    }

    /// Picks up server-side keys from each provider's env var.
    pub fn with_env_keys(mut self) -> Self {
        for p in &self.providers {
            match std::env::var(&p.env_key) {
                Ok(k) if !k.trim().is_empty() => {
                    self.server_keys.insert(p.id.clone(), k.trim().to_string());
                }
                _ => {}
            }
        }
        tracing::info!(
            "Server-side keys configured for {} of {} providers",
            self.server_keys.len(),
            self.providers.len()
        );
        self
    }

    pub fn with_server_key(mut self, id: &str, key: &str) -> Self {
        self.server_keys.insert(id.to_string(), key.to_string());
        self
    }

    pub fn with_base_url(mut self, id: &str, base_url: &str) -> Self {
        if let Some(p) = self.providers.iter_mut().find(|p| p.id == id) {
            p.base_url = base_url.to_string();
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn all(&self) -> &[ProviderSpec] {
        &self.providers
    }

    pub fn server_key(&self, id: &str) -> Option<&str> {
        self.server_keys.get(id).map(|k| k.as_str())
    }

    pub fn breaker(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(id).cloned()
    }

    pub async fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        let mut states = Vec::with_capacity(self.providers.len());
        for p in &self.providers {
            if let Some(b) = self.breakers.get(&p.id) {
                states.push((p.id.clone(), b.state().await));
            }
        }
        states
    }
}

#[derive(Serialize)]
pub struct ProviderCatalogueEntry {
    #[serde(flatten)]
    pub spec: ProviderSpec,
    pub server_key_configured: bool,
}

pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderCatalogueEntry>> {
    Json(
        state
            .providers
            .all()
            .iter()
            .map(|spec| ProviderCatalogueEntry {
                server_key_configured: state.providers.server_key(&spec.id).is_some(),
                spec: spec.clone(),
            })
            .collect(),
    )
}
