//! Keyword search collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{VerifyError, VerifyResult};
use crate::security::SecretString;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

impl SearchHit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            snippet: String::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }
}

/// Web search: query in, ranked URLs out.
#[async_trait]
pub trait WebSearcher: Send + Sync {
    /// Search the web, optionally restricted to one domain.
    async fn search(
        &self,
        query: &str,
        site_filter: Option<&str>,
        limit: usize,
    ) -> VerifyResult<Vec<SearchHit>>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest {
    query: String,
    search_depth: String,
    max_results: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include_domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
}

/// Tavily-backed searcher.
pub struct TavilyWebSearcher {
    client: reqwest::Client,
    api_key: SecretString,
    search_depth: String,
    endpoint: String,
}

impl TavilyWebSearcher {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            search_depth: "basic".to_string(),
            endpoint: TAVILY_ENDPOINT.to_string(),
        }
    }

    /// Set search depth ("basic" or "advanced").
    pub fn with_search_depth(mut self, depth: impl Into<String>) -> Self {
        self.search_depth = depth.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn request(&self, query: &str, site_filter: Option<&str>, limit: usize) -> TavilyRequest {
        TavilyRequest {
            query: query.to_string(),
            search_depth: self.search_depth.clone(),
            max_results: limit,
            include_domains: site_filter
                .map(|site| vec![site.to_string()])
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl WebSearcher for TavilyWebSearcher {
    async fn search(
        &self,
        query: &str,
        site_filter: Option<&str>,
        limit: usize,
    ) -> VerifyResult<Vec<SearchHit>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .json(&self.request(query, site_filter, limit))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VerifyError::Search(format!(
                "Tavily API error: {}",
                response.status()
            )));
        }

        let body: TavilyResponse = response.json().await?;
        tracing::debug!(query = %query, results = body.results.len(), "search finished");

        Ok(body
            .results
            .into_iter()
            .take(limit)
            .map(|r| SearchHit {
                url: r.url,
                title: r.title.unwrap_or_default(),
                snippet: r.content.unwrap_or_default(),
            })
            .collect())
    }
}
