//! LLM provider capability interface.
//!
//! All LLM interactions sit behind [`LlmProvider`]: one synchronous
//! `(model, prompt, params) → text` call. Retries, timeouts, and JSON repair
//! are the engine's responsibility, not the provider's, so tests inject
//! scripted stubs and the production path plugs in the Gemini REST client.

mod gemini;

pub use gemini::GeminiProvider;

use crate::error::{Error, LlmError, Result};
use std::time::Duration;

/// Retry attempts for provider calls.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Initial backoff delay.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Backoff ceiling.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Sampling and output parameters for a generation call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling bound.
    pub top_p: Option<f32>,
    /// Output-token ceiling.
    pub max_output_tokens: u32,
    /// Requested response MIME type (`application/json` for the judge).
    pub response_mime_type: Option<String>,
}

impl GenerationParams {
    /// Parameters for free-text generation.
    #[must_use]
    pub const fn text(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            temperature,
            top_p: None,
            max_output_tokens,
            response_mime_type: None,
        }
    }

    /// Parameters requesting a JSON response body.
    #[must_use]
    pub fn json(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            temperature,
            top_p: None,
            max_output_tokens,
            response_mime_type: Some("application/json".to_string()),
        }
    }

    /// Sets the nucleus sampling bound.
    #[must_use]
    pub const fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Trait for text-generation providers.
///
/// Implementations must be thread-safe; batch workers share one provider.
pub trait LlmProvider: Send + Sync {
    /// Generates text for a prompt.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Transient`] for recoverable failures (the caller
    /// retries) and [`LlmError::Permanent`] for unrecoverable ones.
    fn generate(&self, model: &str, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// Whether an error is worth retrying.
///
/// Permanent provider failures and missing credentials are not; everything
/// else (transient failures, unparseable output) is.
fn should_retry(error: &Error) -> bool {
    !matches!(
        error,
        Error::Llm(LlmError::Permanent(_) | LlmError::MissingApiKey)
    )
}

/// Runs an operation with exponential backoff.
///
/// Delay doubles per attempt from `base` up to `cap`. Non-retryable errors
/// short-circuit.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted.
pub fn retry_with_backoff<T>(
    attempts: u32,
    base: Duration,
    cap: Duration,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = base;
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !should_retry(&error) || attempt == attempts {
                    return Err(error);
                }
                tracing::warn!(attempt, error = %error, "provider call failed, backing off");
                std::thread::sleep(delay);
                delay = (delay * 2).min(cap);
                last_error = Some(error);
            }
        }
    }
    // Unreachable in practice; the loop returns on the final attempt.
    Err(last_error.unwrap_or_else(|| {
        Error::Llm(LlmError::InvalidResponse("retry exhausted".to_string()))
    }))
}
