//! Concrete [`LLMClient`] implementations. Every provider is an
//! OpenAI-compatible chat-completions endpoint reached through
//! `openai-rust2`, differing only in base URL, model namespace, and the
//! environment variable that carries its credential (spec §6 "Environment").

use std::time::Duration;

use async_trait::async_trait;
use openai_rust2 as openai_rust;

use crate::error::EngineError;
use crate::llm::{LLMClient, LlmRequest, LlmResponse, LlmUsage};

lazy_static::lazy_static! {
    /// One pooled `reqwest::Client` shared by every provider in the process
    /// (spec §10.4; mirrors `clients/common.rs::get_shared_http_client`).
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(crate::llm::CONNECT_TIMEOUT)
        .build()
        .expect("failed to build shared HTTP client");
}

/// The provider names `Engine::load` wires a built-in client for. Used by
/// `ConfigRegistry::validate` to reject a catalogue entry bound to a
/// provider nothing will ever serve (spec §4.1 "unknown provider bindings").
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "claude", "gemini", "grok"];

/// One OpenAI-compatible endpoint: a base URL plus the credential read from
/// `api_key_env`. Constructing this never fails — a missing credential makes
/// [`LLMClient::is_authenticated`] report `false`, which `AgentRunner` checks
/// before `AwaitingBudget` so the agent fails fast with
/// [`EngineError::AuthMissing`] and never acquires a governor token (spec
/// §6). `call` also re-checks, so a direct caller gets the same error.
pub struct OpenAiCompatibleProvider {
    provider_name: String,
    api_key_env: String,
    client: Option<openai_rust::Client>,
}

impl OpenAiCompatibleProvider {
    fn new(provider_name: &str, api_key_env: &str, base_url: &str) -> Self {
        let client = std::env::var(api_key_env).ok().map(|key| {
            openai_rust::Client::new_with_client_and_base_url(
                &key,
                SHARED_HTTP_CLIENT.clone(),
                base_url,
            )
        });
        Self {
            provider_name: provider_name.to_string(),
            api_key_env: api_key_env.to_string(),
            client,
        }
    }

    pub fn openai() -> Self {
        Self::new("openai", "OPENAI_API_KEY", "https://api.openai.com/v1/")
    }

    pub fn claude() -> Self {
        Self::new(
            "claude",
            "CLAUDE_API_KEY",
            "https://api.anthropic.com/v1/",
        )
    }

    pub fn gemini() -> Self {
        Self::new(
            "gemini",
            "GEMINI_API_KEY",
            "https://generativelanguage.googleapis.com/v1beta/",
        )
    }

    pub fn grok() -> Self {
        Self::new("grok", "XAI_API_KEY", "https://api.x.ai/v1/")
    }
}

#[async_trait]
impl LLMClient for OpenAiCompatibleProvider {
    fn is_authenticated(&self) -> bool {
        self.client.is_some()
    }

    async fn call(&self, request: &LlmRequest, deadline: Duration) -> Result<LlmResponse, EngineError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::AuthMissing(self.provider_name.clone()))?;

        let messages = vec![
            openai_rust::chat::Message {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
            },
            openai_rust::chat::Message {
                role: "user".to_string(),
                content: request.user_prompt.clone(),
            },
        ];

        let mut args = openai_rust::chat::ChatArguments::new(&request.model, messages);
        args.temperature = Some(request.temperature);
        args.max_tokens = Some(request.max_output_tokens);

        match tokio::time::timeout(deadline, client.create_chat(args, None)).await {
            Err(_) => Err(EngineError::Timeout(format!(
                "{} call exceeded {:?}",
                self.provider_name, deadline
            ))),
            Ok(Err(e)) => Err(classify_error(&self.provider_name, &self.api_key_env, &e)),
            Ok(Ok(completion)) => {
                let text = completion
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .unwrap_or_default();
                Ok(LlmResponse {
                    text,
                    usage: LlmUsage {
                        input_tokens: Some(completion.usage.prompt_tokens),
                        output_tokens: Some(completion.usage.completion_tokens),
                    },
                    provider_code: "200".to_string(),
                })
            }
        }
    }
}

/// Classify an `anyhow::Error` from `openai-rust2` into the engine's error
/// taxonomy by reading the `"status {code}"` fragment it embeds in every
/// API-error message.
fn classify_error(provider: &str, api_key_env: &str, err: &anyhow::Error) -> EngineError {
    let message = err.to_string();
    match extract_status(&message) {
        Some(401) | Some(403) => EngineError::AuthMissing(format!("{} ({})", provider, api_key_env)),
        Some(408) => EngineError::Timeout(message),
        Some(429) => EngineError::Transport(message),
        Some(code) if (500..600).contains(&code) => EngineError::Transport(message),
        Some(code) => EngineError::ProviderRefused {
            code: code.to_string(),
            message,
        },
        None => EngineError::Transport(message),
    }
}

fn extract_status(message: &str) -> Option<u16> {
    let marker = "status ";
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_status_from_anyhow_message() {
        let msg = "create_chat API error (status 429): rate limited";
        assert_eq!(extract_status(msg), Some(429));
    }

    #[test]
    fn classifies_server_error_as_transport() {
        let err = anyhow::anyhow!("create_chat API error (status 503): unavailable");
        let classified = classify_error("openai", "OPENAI_API_KEY", &err);
        assert!(matches!(classified, EngineError::Transport(_)));
    }

    #[test]
    fn classifies_client_error_as_provider_refused() {
        let err = anyhow::anyhow!("create_chat API error (status 400): bad request");
        let classified = classify_error("openai", "OPENAI_API_KEY", &err);
        assert!(matches!(classified, EngineError::ProviderRefused { .. }));
    }

    #[test]
    fn classifies_unauthorized_as_auth_missing() {
        let err = anyhow::anyhow!("create_chat API error (status 401): invalid key");
        let classified = classify_error("openai", "OPENAI_API_KEY", &err);
        assert!(matches!(classified, EngineError::AuthMissing(_)));
    }

    #[test]
    fn missing_env_var_is_unauthenticated() {
        std::env::remove_var("__EQUITY_COUNCIL_TEST_MISSING_KEY__");
        let provider = OpenAiCompatibleProvider::new(
            "test",
            "__EQUITY_COUNCIL_TEST_MISSING_KEY__",
            "https://example.invalid/v1/",
        );
        assert!(!provider.is_authenticated());
    }
}
