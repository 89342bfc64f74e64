//! Collaborator contracts (search snippets, text completion) and their HTTP backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error};

pub mod gemini;
pub mod openai;
pub mod serper;

pub use gemini::{GeminiBackend, GeminiSettings};
pub use openai::{OpenAiBackend, OpenAiSettings};
pub use serper::{SerperSettings, SerperSnippetSource};

/// Temperature used for both the description and the translation requests.
pub const COMPLETION_TEMPERATURE: f32 = 0.3;

/// Ordered text snippets about a degree. Never fails: degraded modes return an empty list.
#[async_trait]
pub trait SnippetSource: Send + Sync {
    async fn fetch(&self, name_primary: &str, name_secondary: &str) -> Vec<String>;
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no completion provider configured (set OPENAI_API_KEY or GEMINI_API_KEY)")]
    NoProviderConfigured,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("still rate limited after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("provider returned no text")]
    EmptyResponse,
}

/// One text-completion provider.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns trimmed, non-empty text or an error.
    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError>;
}

/// The backend chosen for this run plus the global call throttle.
pub struct CompletionProvider {
    backend: Option<Box<dyn CompletionBackend>>,
    delay: Duration,
}

impl CompletionProvider {
    pub fn new(backend: Option<Box<dyn CompletionBackend>>, delay: Duration) -> Self {
        Self { backend, delay }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let Some(backend) = &self.backend else {
            error!("no LLM API key set (OPENAI_API_KEY or GEMINI_API_KEY)");
            return Err(CompletionError::NoProviderConfigured);
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        debug!(backend = backend.name(), user_chars = user.chars().count(), "requesting completion");
        let text = backend.complete(system, user).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

/// OpenAI wins when both credentials are present.
pub fn select_backend(
    openai: Option<OpenAiSettings>,
    gemini: Option<GeminiSettings>,
    user_agent: Option<String>,
) -> anyhow::Result<Option<Box<dyn CompletionBackend>>> {
    if let Some(settings) = openai {
        return Ok(Some(Box::new(OpenAiBackend::new(settings, user_agent)?)));
    }
    if let Some(settings) = gemini {
        return Ok(Some(Box::new(GeminiBackend::new(settings, user_agent)?)));
    }
    Ok(None)
}

/// Pulls `error.message` or `message` out of a provider error body, else a bounded
/// slice of the raw body.
pub(crate) fn extract_error_message(status: StatusCode, body_text: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body_text) {
        if let Some(msg) = v
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return format!("HTTP {}: {}", status.as_u16(), msg);
        }
        if let Some(msg) = v.get("message").and_then(|m| m.as_str()) {
            return format!("HTTP {}: {}", status.as_u16(), msg);
        }
    }

    let trimmed = body_text.trim();
    let snippet: String = trimmed.chars().take(400).collect();
    if snippet.len() < trimmed.len() {
        format!("HTTP {}: {}...", status.as_u16(), snippet)
    } else {
        format!("HTTP {}: {}", status.as_u16(), snippet)
    }
}

#[cfg(test)]
pub(crate) fn fixture_text(relative: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative);
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}
