//! Retry and token-clamp policy layered around a raw [`super::LLMClient`]
//! (spec §4.4 Policy).
//!
//! - `max_output_tokens` is clamped to the provider binding's cap before the
//!   first attempt ever reaches the wire — this is what keeps
//!   `TokenLimitExceeded` from spec §7 a "configuration bug" indicator
//!   rather than a routine error.
//! - `Timeout`/`Transport` get up to 2 additional attempts with exponential
//!   backoff (base 1s, cap 4s).
//! - `ProviderRefused`/`TokenLimitExceeded` are never retried.

use std::time::Duration;

use log::warn;

use crate::error::EngineError;
use crate::llm::{LLMClient, LlmRequest, LlmResponse};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(4);
const MAX_ADDITIONAL_ATTEMPTS: u32 = 2;

/// Clamp `request.max_output_tokens` to `cap`, returning the possibly-adjusted
/// request. Never raises `TokenLimitExceeded` itself — that is the upstream
/// provider's prerogative if clamping somehow still isn't enough.
pub fn clamp_request(mut request: LlmRequest, cap: u32) -> LlmRequest {
    if request.max_output_tokens > cap {
        warn!(
            "clamping max_output_tokens {} -> {} for provider '{}'",
            request.max_output_tokens, cap, request.provider
        );
        request.max_output_tokens = cap;
    }
    request
}

/// Run `request` against `client`, honoring the clamp + retry policy,
/// budgeted against `deadline` from now. Returns the first success or the
/// last (non-retryable, or retry-exhausted) error.
pub async fn call_with_policy(
    client: &dyn LLMClient,
    request: &LlmRequest,
    cap: u32,
    deadline: Duration,
) -> Result<LlmResponse, EngineError> {
    let request = clamp_request(request.clone(), cap);
    let mut attempt = 0u32;
    let mut last_err;

    loop {
        match client.call(&request, deadline).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !err.is_retryable_at_client() || attempt >= MAX_ADDITIONAL_ATTEMPTS {
                    return Err(err);
                }
                last_err = err;
            }
        }

        let backoff = std::cmp::min(BACKOFF_BASE * 2u32.pow(attempt), BACKOFF_CAP);
        warn!(
            "retrying LLM call to '{}' after {:?} ({}) — attempt {}/{}",
            request.provider,
            backoff,
            last_err,
            attempt + 2,
            MAX_ADDITIONAL_ATTEMPTS + 1
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::scripted;
    use crate::llm::LlmUsage;

    fn request() -> LlmRequest {
        LlmRequest {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "sys".to_string(),
            user_prompt: "user".to_string(),
            temperature: 0.0,
            max_output_tokens: 99_999_999,
        }
    }

    fn ok_response() -> LlmResponse {
        LlmResponse {
            text: "hello".to_string(),
            usage: LlmUsage::default(),
            provider_code: "200".to_string(),
        }
    }

    #[test]
    fn clamp_applies_process_wide_cap() {
        let clamped = clamp_request(request(), 8_192);
        assert_eq!(clamped.max_output_tokens, 8_192);
    }

    #[test]
    fn clamp_is_noop_when_under_cap() {
        let mut req = request();
        req.max_output_tokens = 100;
        let clamped = clamp_request(req, 8_192);
        assert_eq!(clamped.max_output_tokens, 100);
    }

    #[tokio::test]
    async fn retries_timeout_up_to_two_additional_attempts() {
        let client = scripted(vec![
            Err(EngineError::Timeout("t1".to_string())),
            Err(EngineError::Timeout("t2".to_string())),
            Ok(ok_response()),
        ]);
        let result = call_with_policy(&*client, &request(), 8_192, Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert_eq!(
            client.call_count.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_retries() {
        let client = scripted(vec![
            Err(EngineError::Transport("t1".to_string())),
            Err(EngineError::Transport("t2".to_string())),
            Err(EngineError::Transport("t3".to_string())),
        ]);
        let result = call_with_policy(&*client, &request(), 8_192, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
        assert_eq!(
            client.call_count.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }

    #[tokio::test]
    async fn never_retries_provider_refused() {
        let client = scripted(vec![
            Err(EngineError::ProviderRefused {
                code: "400".to_string(),
                message: "bad request".to_string(),
            }),
            Ok(ok_response()),
        ]);
        let result = call_with_policy(&*client, &request(), 8_192, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(EngineError::ProviderRefused { .. })));
        assert_eq!(
            client.call_count.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
