//! Error taxonomy for the orchestration engine.
//!
//! [`EngineError`] is the single observable error type surfaced to clients per
//! the engine's error-handling design: every variant below corresponds to one
//! of the named error kinds a session or agent record can carry. Config-path
//! errors (`ConfigWriteError`, `InvariantViolation`) never reach a running
//! session; the rest are per-agent or per-session terminal outcomes.
//!
//! # Examples
//!
//! ```
//! use equity_council::error::EngineError;
//!
//! let err = EngineError::AuthMissing("openai".to_string());
//! assert_eq!(err.to_string(), "provider auth missing: openai");
//! ```

use std::error::Error;
use std::fmt;

/// The error kinds named in the engine's observable contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The session could not obtain a `StockContext`; aborts before any LLM call.
    NoStockData(String),
    /// A provider credential was not configured.
    AuthMissing(String),
    /// An LLM or evidence-fetch deadline was exceeded.
    Timeout(String),
    /// The upstream provider rejected the request (token limit, content policy, 4xx).
    ProviderRefused { code: String, message: String },
    /// Specialization of `ProviderRefused` for a clamped-but-still-rejected token budget.
    TokenLimitExceeded { requested: u32, cap: u32 },
    /// The transport layer failed (connection reset, DNS, etc.) before a response was read.
    Transport(String),
    /// Cooperative cancellation reached this agent or session.
    Cancelled,
    /// Persisting the overrides/profile document failed; prior state is left intact.
    ConfigWriteError(String),
    /// A configured invariant was violated (e.g. disabling a `core` agent).
    InvariantViolation(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NoStockData(symbol) => write!(f, "no stock data for {}", symbol),
            EngineError::AuthMissing(provider) => write!(f, "provider auth missing: {}", provider),
            EngineError::Timeout(what) => write!(f, "timeout: {}", what),
            EngineError::ProviderRefused { code, message } => {
                write!(f, "provider refused ({}): {}", code, message)
            }
            EngineError::TokenLimitExceeded { requested, cap } => write!(
                f,
                "token limit exceeded: requested {} exceeds cap {}",
                requested, cap
            ),
            EngineError::Transport(msg) => write!(f, "transport error: {}", msg),
            EngineError::Cancelled => write!(f, "cancelled"),
            EngineError::ConfigWriteError(msg) => write!(f, "config write failed: {}", msg),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl EngineError {
    /// Short machine-readable tag used in progress events and agent records.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::NoStockData(_) => "NoStockData",
            EngineError::AuthMissing(_) => "AuthMissing",
            EngineError::Timeout(_) => "Timeout",
            EngineError::ProviderRefused { .. } => "ProviderRefused",
            EngineError::TokenLimitExceeded { .. } => "TokenLimitExceeded",
            EngineError::Transport(_) => "Transport",
            EngineError::Cancelled => "Cancelled",
            EngineError::ConfigWriteError(_) => "ConfigWriteError",
            EngineError::InvariantViolation(_) => "InvariantViolation",
        }
    }

    /// Whether [`crate::llm::LLMClient`] retry policy applies to this error kind.
    pub fn is_retryable_at_client(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Transport(_))
    }
}
