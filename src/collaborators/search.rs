//! Web search over a SearXNG-compatible JSON endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use super::{SearchResult, WebSearch};
use crate::error::SearchError;

/// Results kept per query.
pub const DEFAULT_MAX_RESULTS: usize = 5;

/// Queries `{base_url}/search?q=<query>&format=json`.
pub struct HttpSearchClient {
    base_url: String,
    max_results: usize,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl HttpSearchClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SearchError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            http_client,
        })
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn search_url(&self, query: &str) -> Result<Url, SearchError> {
        Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[("q", query), ("format", "json")],
        )
        .map_err(|e| SearchError::RequestFailed(format!("Invalid search URL: {}", e)))
    }
}

#[async_trait]
impl WebSearch for HttpSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let url = self.search_url(query)?;

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::RequestFailed(format!(
                "search endpoint returned {}",
                status.as_u16()
            )));
        }

        let body: SearxResponse = response
            .json()
            .await
            .map_err(|e| SearchError::ParseError(e.to_string()))?;

        let results: Vec<SearchResult> = body
            .results
            .into_iter()
            .take(self.max_results)
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect();

        debug!(query = query, results = results.len(), "Web search completed");
        Ok(results)
    }
}

/// Stand-in used when no search endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSearch;

#[async_trait]
impl WebSearch for DisabledSearch {
    async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, SearchError> {
        Err(SearchError::Disabled)
    }
}
