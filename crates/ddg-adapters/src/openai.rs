//! Chat-completions backend. Single request per call, no retry.

use std::time::Duration;

use async_trait::async_trait;
use ddg_storage::{build_http_client, HttpClientConfig};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{extract_error_message, CompletionBackend, CompletionError, COMPLETION_TEMPERATURE};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAiSettings {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiBackend {
    pub fn new(settings: OpenAiSettings, user_agent: Option<String>) -> anyhow::Result<Self> {
        let client = build_http_client(&HttpClientConfig {
            timeout: settings.timeout,
            user_agent,
        })?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }
}

/// First choice's content, trimmed.
pub fn parse_chat_completion(body: &str) -> Result<String, CompletionError> {
    let parsed: ChatCompletion = serde_json::from_str(body)
        .map_err(|err| CompletionError::MalformedResponse(err.to_string()))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(CompletionError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": COMPLETION_TEMPERATURE
        });

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .inspect_err(|err| warn!(error = %err, "OpenAI completion failed"))?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let message = extract_error_message(status, &text);
            warn!(status = status.as_u16(), %message, "OpenAI completion failed");
            return Err(CompletionError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }
        parse_chat_completion(&text)
    }
}
