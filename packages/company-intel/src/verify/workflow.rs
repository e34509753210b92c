//! LinkedIn presence verification: search, filter, fetch, score.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::VerifyConfig;
use crate::error::VerifyResult;
use crate::verify::fetcher::PageFetcher;
use crate::verify::scorer::{MatchScore, MatchScorer, PageContext};
use crate::verify::searcher::{SearchHit, WebSearcher};

const LINKEDIN_DOMAIN: &str = "linkedin.com";
const COMPANY_PAGE_MARKER: &str = "linkedin.com/company/";

/// A candidate page and how much text it yielded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub text_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageVerification {
    pub url: String,
    pub title: String,
    pub score: MatchScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub company_name: String,
    pub official_website: Option<String>,
    pub search_results: Vec<SearchHit>,
    /// Company-page URLs kept from the search results.
    pub linkedin_urls: Vec<String>,
    pub pages: Vec<FetchedPage>,
    pub verifications: Vec<PageVerification>,
    /// Highest-scoring page, match or not.
    pub best_match: Option<PageVerification>,
    /// URL of the best page that passed the match threshold.
    pub linkedin_url: Option<String>,
    pub match_count: usize,
    pub linkedin_found: bool,
    pub success: bool,
}

pub struct VerificationWorkflow {
    searcher: Arc<dyn WebSearcher>,
    fetcher: Arc<dyn PageFetcher>,
    scorer: Arc<dyn MatchScorer>,
    search_limit: usize,
    fetch_retries: usize,
}

impl VerificationWorkflow {
    pub fn new(
        searcher: Arc<dyn WebSearcher>,
        fetcher: Arc<dyn PageFetcher>,
        scorer: Arc<dyn MatchScorer>,
        config: &VerifyConfig,
    ) -> Self {
        Self {
            searcher,
            fetcher,
            scorer,
            search_limit: config.search_limit,
            fetch_retries: config.fetch_retries,
        }
    }

    pub async fn run(
        &self,
        company_name: &str,
        official_website: Option<&str>,
    ) -> VerifyResult<VerificationReport> {
        let query = format!("{company_name} linkedin");
        let search_results = self
            .searcher
            .search(&query, Some(LINKEDIN_DOMAIN), self.search_limit)
            .await?;
        let candidates = company_pages(&search_results);
        info!(
            company = %company_name,
            results = search_results.len(),
            candidates = candidates.len(),
            "linkedin search finished"
        );

        let texts = join_all(candidates.iter().map(|hit| async move {
            match self.fetcher.fetch(&hit.url, self.fetch_retries).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(url = %hit.url, error = %e, "fetch aborted");
                    String::new()
                }
            }
        }))
        .await;

        let pages: Vec<FetchedPage> = candidates
            .iter()
            .zip(&texts)
            .map(|(hit, text)| FetchedPage {
                url: hit.url.clone(),
                text_length: text.len(),
            })
            .collect();

        let scored = join_all(
            candidates
                .iter()
                .zip(&texts)
                .filter(|(_, text)| !text.is_empty())
                .map(|(hit, text)| async move {
                    let context = PageContext {
                        url: hit.url.clone(),
                        title: hit.title.clone(),
                        snippet: hit.snippet.clone(),
                    };
                    match self
                        .scorer
                        .score(company_name, text, &context, official_website)
                        .await
                    {
                        Ok(score) => Some(PageVerification {
                            url: hit.url.clone(),
                            title: hit.title.clone(),
                            score,
                        }),
                        Err(e) => {
                            warn!(url = %hit.url, error = %e, "scoring failed");
                            None
                        }
                    }
                }),
        )
        .await;
        let verifications: Vec<PageVerification> = scored.into_iter().flatten().collect();

        let report = summarize(
            company_name,
            official_website,
            search_results,
            candidates.iter().map(|hit| hit.url.clone()).collect(),
            pages,
            verifications,
        );
        info!(
            company = %company_name,
            match_count = report.match_count,
            success = report.success,
            "verification finished"
        );
        Ok(report)
    }
}

/// LinkedIn company pages from the search results, first occurrence only.
fn company_pages(results: &[SearchHit]) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|hit| hit.url.to_lowercase().contains(COMPANY_PAGE_MARKER))
        .filter(|hit| seen.insert(hit.url.trim_end_matches('/').to_lowercase()))
        .cloned()
        .collect()
}

fn summarize(
    company_name: &str,
    official_website: Option<&str>,
    search_results: Vec<SearchHit>,
    linkedin_urls: Vec<String>,
    pages: Vec<FetchedPage>,
    verifications: Vec<PageVerification>,
) -> VerificationReport {
    let best_match = verifications
        .iter()
        .max_by(|a, b| a.score.overall_score.total_cmp(&b.score.overall_score))
        .cloned();
    let match_count = verifications.iter().filter(|v| v.score.is_match).count();
    let linkedin_url = best_match
        .as_ref()
        .filter(|v| v.score.is_match)
        .map(|v| v.url.clone());
    let linkedin_found = !linkedin_urls.is_empty();

    VerificationReport {
        company_name: company_name.to_string(),
        official_website: official_website.map(str::to_string),
        search_results,
        linkedin_urls,
        pages,
        verifications,
        best_match,
        linkedin_url,
        match_count,
        linkedin_found,
        success: linkedin_found && match_count > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_company_pages_filters_and_dedups() {
        let hits = vec![
            SearchHit::new("https://www.linkedin.com/company/acme-inc"),
            SearchHit::new("https://www.linkedin.com/in/jane-doe"),
            SearchHit::new("https://www.linkedin.com/company/acme-inc/"),
            SearchHit::new("https://www.linkedin.com/company/acme-labs"),
        ];
        let urls: Vec<_> = company_pages(&hits).into_iter().map(|h| h.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.linkedin.com/company/acme-inc",
                "https://www.linkedin.com/company/acme-labs",
            ]
        );
    }

    #[test]
    fn test_no_candidates_is_not_success() {
        let report = summarize("Acme", None, Vec::new(), Vec::new(), Vec::new(), Vec::new());
        assert!(!report.linkedin_found);
        assert!(!report.success);
        assert!(report.best_match.is_none());
    }
}
