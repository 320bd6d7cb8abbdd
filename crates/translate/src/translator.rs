// crates/translate/src/translator.rs
//! Translator capability boundary.
//!
//! Concrete backends (HTTP services, local models, CLIs) live outside this
//! crate; the pump only ever sees this trait. Swapping the active backend is
//! a reference assignment — jobs already in flight keep the instance they
//! captured at enqueue time.

use async_trait::async_trait;
use thiserror::Error;

/// Errors a translator backend can surface.
///
/// A `WARN:`-prefixed backend message marks a degraded-but-expected failure
/// (rate limit, transient upstream hiccup) that consumers may render less
/// prominently.
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("translator returned empty output")]
    Empty,

    #[error("{0}")]
    Backend(String),
}

impl TranslateError {
    /// Whether the error carries the degraded-service `WARN:` prefix.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Backend(msg) if msg.starts_with("WARN:"))
    }
}

/// A translation backend.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text`. Implementations enforce their own network timeout;
    /// the pump adds no additional deadline.
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;

    /// Backend name for logging/display (e.g. "deepl", "local-llm").
    fn name(&self) -> &str;
}
