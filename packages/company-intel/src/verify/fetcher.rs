//! Generic page fetcher used for verification.
//!
//! Independent of the authenticated session: plain HTTP, its own admission
//! gate of [`FETCH_CONCURRENCY`].

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Node, Selector};
use tracing::{debug, warn};

use crate::config::{VerifyConfig, DESKTOP_USER_AGENT};
use crate::error::VerifyResult;
use crate::semaphore::{AdmissionGate, FETCH_CONCURRENCY};

/// Fetch a URL and reduce it to readable text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Extracted page text, or an empty string once `retries` extra attempts
    /// are exhausted.
    async fn fetch(&self, url: &str, retries: usize) -> VerifyResult<String>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
    gate: AdmissionGate,
    retry_delay: Duration,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> VerifyResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DESKTOP_USER_AGENT)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            gate: AdmissionGate::new(FETCH_CONCURRENCY),
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn from_config(config: &VerifyConfig) -> VerifyResult<Self> {
        Self::new(config.fetch_timeout)
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    async fn fetch_once(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str, retries: usize) -> VerifyResult<String> {
        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * attempt as u32).await;
            }

            // Held for one attempt only; others can use the slot while we back off.
            let permit = self.gate.acquire().await?;
            let result = self.fetch_once(url).await;
            permit.release();

            match result {
                Ok(html) => {
                    let text = page_text(&html);
                    debug!(url = %url, chars = text.len(), attempt, "page fetched");
                    return Ok(text);
                }
                Err(e) => warn!(url = %url, attempt, error = %e, "page fetch failed"),
            }
        }
        Ok(String::new())
    }
}

/// Title plus visible body text, whitespace collapsed.
pub fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts = Vec::new();

    if let Ok(selector) = Selector::parse("title") {
        if let Some(title) = document.select(&selector).next() {
            parts.push(title.text().collect::<String>());
        }
    }

    if let Ok(selector) = Selector::parse("body") {
        if let Some(body) = document.select(&selector).next() {
            for node in body.descendants() {
                let Node::Text(text) = node.value() else {
                    continue;
                };
                let hidden = node
                    .parent()
                    .and_then(|p| p.value().as_element())
                    .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript" | "template"));
                if !hidden {
                    parts.push((**text).to_owned());
                }
            }
        }
    }

    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_text_skips_scripts() {
        let html = r#"
            <html><head><title>Acme Inc | LinkedIn</title></head>
            <body>
                <h1>Acme Inc</h1>
                <script>var tracking = 1;</script>
                <p>Industrial   supplies since 1950.</p>
                <style>p { color: red }</style>
            </body></html>"#;
        assert_eq!(
            page_text(html),
            "Acme Inc | LinkedIn Acme Inc Industrial supplies since 1950."
        );
    }

    #[tokio::test]
    async fn test_unreachable_page_yields_empty_text() {
        let fetcher = HttpPageFetcher::new(Duration::from_millis(200))
            .unwrap()
            .with_retry_delay(Duration::ZERO);

        // Port 9 (discard) on localhost refuses connections.
        let text = fetcher.fetch("http://127.0.0.1:9/", 1).await.unwrap();
        assert!(text.is_empty());
        assert_eq!(fetcher.gate().available(), FETCH_CONCURRENCY);
    }
}
