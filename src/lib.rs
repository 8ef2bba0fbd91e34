// src/lib.rs

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod evidence;
pub mod governor;
pub mod llm;
pub mod model;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod session;

// Re-exporting the types most callers need without navigating the full
// module hierarchy.
pub use engine::Engine;
pub use error::EngineError;
pub use event::{ChannelProgressReceiver, ChannelProgressSink, ProgressEvent, ProgressSink, SessionStatus};
pub use session::{AnalyzeRequest, SessionOutcome};

static LOGGER_INIT: std::sync::Once = std::sync::Once::new();

/// Installs `env_logger` as the `log` facade's backend, honoring `RUST_LOG`.
/// Idempotent: safe to call from `main`, from every integration test's
/// setup, or both — only the first call has any effect.
pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        env_logger::init();
    });
}
