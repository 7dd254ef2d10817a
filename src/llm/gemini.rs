//! Gemini REST provider.
//!
//! Thin blocking client for the `generateContent` endpoint. The provider is
//! opaque to the engine: it returns raw text and classifies HTTP failures as
//! transient or permanent so the retry layer can act on them.

use crate::error::{Error, LlmError, Result};
use crate::llm::{GenerationParams, LlmProvider};
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Gemini REST provider.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    http: reqwest::blocking::Client,
}

impl GeminiProvider {
    /// Creates a provider with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::MissingApiKey`] for an empty key.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Llm(LlmError::MissingApiKey));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Llm(LlmError::Permanent(e.to_string())))?;
        Ok(Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            http,
        })
    }

    /// Creates a provider from the `GEMINI_API_KEY` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::MissingApiKey`] when the variable is unset.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| Error::Llm(LlmError::MissingApiKey))?;
        Self::new(api_key)
    }

    /// Overrides the endpoint base URL (tests, proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(prompt: &str, params: &GenerationParams) -> Value {
        let mut generation_config = json!({
            "temperature": params.temperature,
            "maxOutputTokens": params.max_output_tokens,
        });
        if let (Some(config), Some(top_p)) = (generation_config.as_object_mut(), params.top_p) {
            config.insert("topP".to_string(), json!(top_p));
        }
        if let (Some(config), Some(mime)) = (
            generation_config.as_object_mut(),
            params.response_mime_type.as_deref(),
        ) {
            config.insert("responseMimeType".to_string(), json!(mime));
        }
        json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        })
    }

    fn extract_text(body: &Value) -> Option<String> {
        let parts = body
            .get("candidates")?
            .get(0)?
            .get("content")?
            .get("parts")?
            .as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() { None } else { Some(text) }
    }
}

impl LlmProvider for GeminiProvider {
    fn generate(&self, model: &str, prompt: &str, params: &GenerationParams) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&Self::request_body(prompt, params))
            .send()
            .map_err(|e| Error::Llm(LlmError::Transient(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            let message = format!("{status}: {detail}");
            // Rate limits and server errors are worth retrying.
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(Error::Llm(LlmError::Transient(message)))
            } else {
                Err(Error::Llm(LlmError::Permanent(message)))
            };
        }

        let body: Value = response
            .json()
            .map_err(|e| Error::Llm(LlmError::InvalidResponse(e.to_string())))?;
        Self::extract_text(&body).ok_or_else(|| {
            Error::Llm(LlmError::InvalidResponse(
                "response carried no candidate text".to_string(),
            ))
        })
    }
}
