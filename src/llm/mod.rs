//! LLM dispatch path: the provider-agnostic [`LLMClient`] contract, one
//! concrete implementation per provider, and the retry/clamp policy of
//! spec §4.4 (connect timeout, total deadline, token-limit discipline,
//! bounded retry).
//!
//! Every provider routes through an OpenAI-compatible chat-completions
//! surface via `openai-rust2`, the same architecture the teacher crate uses
//! for Claude/Gemini/Grok (`clients/claude.rs` etc. all delegate to an
//! `OpenAIClient`-shaped HTTP call with a different base URL).

pub mod providers;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;

/// Process-wide default cap on `max_output_tokens` (spec §4.4 Policy).
///
/// Kept deliberately conservative: a generous ceiling causes hard 4xx
/// refusals once `input_tokens + max_output_tokens` exceeds the model's
/// context window, well before the model itself would have run out of room.
pub const DEFAULT_MAX_OUTPUT_TOKENS_CAP: u32 = 8_192;

/// Connect timeout applied to every provider HTTP call (spec §4.4 Policy).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One LLM call request (spec §4.4 `call` contract).
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Token accounting reported by the provider, when available.
#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// One LLM call response (spec §4.4 `call` contract).
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: LlmUsage,
    pub provider_code: String,
}

/// Provider-agnostic transport contract. A single implementation issues
/// exactly one HTTP round trip per call — retry and clamping are layered on
/// top by [`retry::call_with_policy`], never inside an implementation.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn call(&self, request: &LlmRequest, deadline: Duration) -> Result<LlmResponse, EngineError>;

    /// Whether this client currently holds a usable credential. Checked by
    /// `AgentRunner` before `AwaitingBudget` so an unauthenticated provider
    /// fails fast without consuming a governor token (spec §6). Defaults to
    /// `true` for clients that have no notion of credentials (test doubles).
    fn is_authenticated(&self) -> bool {
        true
    }
}
