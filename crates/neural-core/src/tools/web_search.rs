//! Web search tool backed by the Brave Search API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::secret_guard::{looks_sensitive_secret, SECRET_REMEDIATION};

use super::executor::{ToolContext, ToolOutput};

const MAX_RESULTS_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebSearchArgs {
    pub query: String,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Query → ranked results.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchResult>>;
}

pub struct BraveSearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearch {
    pub fn new(api_key: String, endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build search HTTP client")?;
        Ok(Self {
            client,
            api_key,
            endpoint,
        })
    }

    /// Build from configuration; `None` when search is disabled or has no key.
    pub fn from_config(config: &neural_config::WebSearchConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(api_key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
            warn!("Web search is enabled but no API key is configured; disabling it");
            return Ok(None);
        };
        Self::new(
            api_key,
            config.endpoint.clone(),
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }
}

#[async_trait]
impl WebSearch for BraveSearch {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchResult>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &count.to_string())])
            .send()
            .await
            .context("Brave Search request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Brave Search API returned {}", status);
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse Brave Search response")?;
        Ok(parse_brave_results(&json, count))
    }
}

fn parse_brave_results(json: &serde_json::Value, count: usize) -> Vec<SearchResult> {
    let Some(items) = json
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
    else {
        return Vec::new();
    };

    let field = |item: &serde_json::Value, name: &str| {
        item.get(name)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    items
        .iter()
        .take(count)
        .map(|item| SearchResult {
            title: field(item, "title"),
            url: field(item, "url"),
            description: field(item, "description"),
        })
        .filter(|r| !r.url.is_empty())
        .collect()
}

fn format_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No search results found for: '{}'", query);
    }
    let lines: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {} ({})\n   {}", i + 1, r.title, r.url, r.description))
        .collect();
    format!("Search results for '{}':\n\n{}", query, lines.join("\n\n"))
}

/// Execute the `web_search` tool.
pub async fn execute_web_search(args: &WebSearchArgs, ctx: &ToolContext<'_>) -> ToolOutput {
    debug!("Processing web_search tool call: {}", args.query);

    let Some(search) = ctx.web_search else {
        return ToolOutput::error("Web search is not configured");
    };
    let query = args.query.trim();
    if query.is_empty() {
        return ToolOutput::error("query must not be empty");
    }
    if looks_sensitive_secret(query) {
        warn!("Blocked web search query containing a secret-looking value");
        return ToolOutput::error(SECRET_REMEDIATION);
    }

    let count = args
        .count
        .unwrap_or(ctx.config.web_search.max_results)
        .clamp(1, MAX_RESULTS_CAP);

    tokio::select! {
        result = search.search(query, count) => match result {
            Ok(results) => ToolOutput::ok(format_results(query, &results)),
            Err(e) => ToolOutput::error(format!("Web search failed: {:#}", e)),
        },
        _ = ctx.cancel.cancelled() => ToolOutput::error("Web search cancelled"),
    }
}
