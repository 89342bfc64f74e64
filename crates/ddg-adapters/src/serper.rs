//! Search snippets from trusted university domains via the Serper API.

use std::time::Duration;

use async_trait::async_trait;
use ddg_storage::{build_http_client, HttpClientConfig};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::SnippetSource;

pub const DEFAULT_SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
pub const DEFAULT_MAX_SNIPPETS: usize = 5;

#[derive(Debug, Clone)]
pub struct SerperSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub sites: Vec<String>,
    pub max_snippets: usize,
    pub timeout: Duration,
}

impl Default for SerperSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_SERPER_ENDPOINT.to_string(),
            sites: vec!["polito.it".to_string(), "unito.it".to_string()],
            max_snippets: DEFAULT_MAX_SNIPPETS,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
enum SearchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("response not JSON: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub organic: Vec<OrganicResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrganicResult {
    #[serde(default)]
    pub snippet: Option<String>,
}

/// `("<it>" OR "<en>") laurea corso site:a OR site:b`. The English variant is left out
/// when it is blank or the same as the Italian one.
pub fn build_query(name_primary: &str, name_secondary: &str, sites: &[String]) -> String {
    let clean = |s: &str| s.replace('"', "").trim().to_string();
    let primary = clean(name_primary);
    let secondary = clean(name_secondary);

    let names = match (primary.is_empty(), secondary.is_empty()) {
        (false, false) if !primary.eq_ignore_ascii_case(&secondary) => {
            format!("(\"{primary}\" OR \"{secondary}\")")
        }
        (true, false) => format!("\"{secondary}\""),
        _ => format!("\"{primary}\""),
    };

    let site_filter = sites
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| format!("site:{s}"))
        .collect::<Vec<_>>()
        .join(" OR ");

    if site_filter.is_empty() {
        format!("{names} laurea corso")
    } else {
        format!("{names} laurea corso {site_filter}")
    }
}

/// Up to `max` non-empty snippets in ranking order; blank ones do not use up a slot.
pub fn extract_snippets(response: SearchResponse, max: usize) -> Vec<String> {
    response
        .organic
        .into_iter()
        .filter_map(|r| r.snippet)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(max)
        .collect()
}

pub struct SerperSnippetSource {
    client: reqwest::Client,
    settings: SerperSettings,
}

impl SerperSnippetSource {
    pub fn new(settings: SerperSettings, user_agent: Option<String>) -> anyhow::Result<Self> {
        let client = build_http_client(&HttpClientConfig {
            timeout: settings.timeout,
            user_agent,
        })?;
        Ok(Self { client, settings })
    }

    async fn search(&self, api_key: &str, query: &str) -> Result<SearchResponse, SearchError> {
        let resp = self
            .client
            .post(&self.settings.endpoint)
            .header("X-API-KEY", api_key)
            .json(&json!({ "q": query, "num": self.settings.max_snippets }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SearchError::HttpStatus(status.as_u16()));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl SnippetSource for SerperSnippetSource {
    async fn fetch(&self, name_primary: &str, name_secondary: &str) -> Vec<String> {
        let Some(api_key) = self.settings.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            warn!("SERPER_API_KEY not set; skipping search");
            return Vec::new();
        };

        let query = build_query(name_primary, name_secondary, &self.settings.sites);
        match self.search(api_key, &query).await {
            Ok(response) => {
                let snippets = extract_snippets(response, self.settings.max_snippets);
                info!(degree = name_primary, count = snippets.len(), "search returned snippets");
                snippets
            }
            Err(err) => {
                warn!(degree = name_primary, error = %err, "search failed; continuing without snippets");
                Vec::new()
            }
        }
    }
}
