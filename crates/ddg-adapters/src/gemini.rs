//! `generateContent` backend with rate-limit aware retry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ddg_storage::{build_http_client, classify_response, HttpClientConfig, RateLimitBackoff, RetryDisposition};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::{extract_error_message, CompletionBackend, CompletionError, COMPLETION_TEMPERATURE};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub backoff: RateLimitBackoff,
}

impl GeminiSettings {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            backoff: RateLimitBackoff::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// Concatenated text parts of the first candidate, trimmed.
pub fn parse_generate_content(body: &str) -> Result<String, CompletionError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|err| CompletionError::MalformedResponse(err.to_string()))?;
    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        warn!("Gemini returned no text");
        return Err(CompletionError::EmptyResponse);
    }
    Ok(text.to_string())
}

/// Runs `attempt` up to `backoff.max_attempts` times. Only `RateLimited` errors are
/// retried, after sleeping for the delay suggested by the error text.
pub async fn retry_rate_limited<F, Fut>(
    backoff: &RateLimitBackoff,
    mut attempt: F,
) -> Result<String, CompletionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, CompletionError>>,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt_no in 1..=max_attempts {
        match attempt().await {
            Err(CompletionError::RateLimited { message }) => {
                last_error = message;
                if attempt_no == max_attempts {
                    break;
                }
                let delay = backoff.delay_for_message(&last_error);
                warn!(
                    attempt = attempt_no,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "Gemini rate limited; sleeping then retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }

    error!(attempts = max_attempts, last_error = %last_error, "Gemini still rate limited after retries");
    Err(CompletionError::RetriesExhausted {
        attempts: max_attempts,
        last_error,
    })
}

pub struct GeminiBackend {
    client: reqwest::Client,
    settings: GeminiSettings,
}

impl GeminiBackend {
    pub fn new(settings: GeminiSettings, user_agent: Option<String>) -> anyhow::Result<Self> {
        let client = build_http_client(&HttpClientConfig {
            timeout: settings.timeout,
            user_agent,
        })?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }

    async fn request_once(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let body = json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "generationConfig": { "temperature": COMPLETION_TEMPERATURE }
        });

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if status.is_success() {
            return parse_generate_content(&text);
        }

        let message = extract_error_message(status, &text);
        match classify_response(status, &text) {
            RetryDisposition::Retryable => Err(CompletionError::RateLimited { message }),
            RetryDisposition::NonRetryable => Err(CompletionError::HttpStatus {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let result = retry_rate_limited(&self.settings.backoff, move || self.request_once(system, user)).await;
        if let Err(err) = &result {
            if !matches!(err, CompletionError::RetriesExhausted { .. }) {
                warn!(error = %err, "Gemini completion failed");
            }
        }
        result
    }
}
