//! Scoring whether a page belongs to a given company.
//!
//! [`LlmScorer`] asks an OpenAI-compatible chat endpoint; whenever that is
//! unreachable or answers with something unparseable it falls back to the
//! deterministic [`RuleBasedScorer`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::VerifyConfig;
use crate::error::{VerifyError, VerifyResult};
use crate::security::SecretString;

/// Overall score at or above which a page counts as the company's.
pub const MATCH_THRESHOLD: f64 = 7.0;

/// Page text sent to the model is cut to this many characters.
const MAX_PROMPT_CHARS: usize = 6000;

/// Name tokens ignored when comparing company names.
const NAME_STOPWORDS: &[&str] = &[
    "inc", "ltd", "llc", "corp", "co", "company", "corporation", "limited", "the", "and", "of",
    "gmbh", "ag", "sa", "plc",
];

/// Text found on genuine company pages.
const COMPANY_PAGE_MARKERS: &[&str] = &[
    "industry",
    "company size",
    "headquarters",
    "employees",
    "followers",
    "founded",
    "specialties",
    "website",
];

/// Search metadata for the scored page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Per-criterion scores, each 0-10.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetails {
    pub name_score: u8,
    pub business_score: u8,
    pub credibility_score: u8,
    pub website_score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub details: ScoreDetails,
    pub overall_score: f64,
    pub is_match: bool,
    pub analysis: String,
    /// Which scorer produced this ("llm" or "rules").
    pub scored_by: String,
}

impl MatchScore {
    pub fn new(details: ScoreDetails, overall_score: f64, analysis: String, scored_by: &str) -> Self {
        let overall_score = overall_score.clamp(0.0, 10.0);
        Self {
            details,
            overall_score,
            is_match: overall_score >= MATCH_THRESHOLD,
            analysis,
            scored_by: scored_by.to_string(),
        }
    }
}

#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(
        &self,
        company_name: &str,
        page_text: &str,
        context: &PageContext,
        official_website: Option<&str>,
    ) -> VerifyResult<MatchScore>;
}

/// Build the configured scorer: LLM when a key is set, rules otherwise.
pub fn scorer_from_config(config: &VerifyConfig) -> Arc<dyn MatchScorer> {
    match &config.llm_api_key {
        Some(key) => Arc::new(
            LlmScorer::new(key.clone())
                .with_base_url(&config.llm_base_url)
                .with_model(&config.llm_model),
        ),
        None => Arc::new(RuleBasedScorer),
    }
}

// ============================================================================
// Rule-based scorer
// ============================================================================

/// Deterministic token-overlap scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

impl RuleBasedScorer {
    pub fn evaluate(
        &self,
        company_name: &str,
        page_text: &str,
        context: &PageContext,
        official_website: Option<&str>,
    ) -> MatchScore {
        let haystack = normalize(&format!(
            "{} {} {}",
            context.title, context.snippet, page_text
        ));
        let title = normalize(&context.title);
        let name = normalize(company_name);

        let name_score = name_score(&name, &title, &haystack);

        let markers = COMPANY_PAGE_MARKERS
            .iter()
            .filter(|m| haystack.contains(*m))
            .count();
        let business_score = (markers * 2).min(10) as u8;

        let mut credibility = 0;
        if context.url.to_lowercase().contains("linkedin.com/company/") {
            credibility += 6;
        }
        if haystack.contains("followers") {
            credibility += 2;
        }
        if haystack.contains("employees") {
            credibility += 2;
        }
        let credibility_score = credibility.min(10) as u8;

        let website_score = match official_website.map(website_domain) {
            Some(Some(domain)) if page_text.to_lowercase().contains(&domain) => 10,
            Some(_) => 0,
            None => 5,
        };

        let details = ScoreDetails {
            name_score,
            business_score,
            credibility_score,
            website_score,
        };
        let overall = f64::from(name_score) * 0.4
            + f64::from(business_score) * 0.2
            + f64::from(credibility_score) * 0.2
            + f64::from(website_score) * 0.2;
        let overall = (overall * 10.0).round() / 10.0;

        MatchScore::new(
            details,
            overall,
            format!(
                "name {name_score}/10, business {business_score}/10, credibility {credibility_score}/10, website {website_score}/10"
            ),
            "rules",
        )
    }
}

#[async_trait]
impl MatchScorer for RuleBasedScorer {
    async fn score(
        &self,
        company_name: &str,
        page_text: &str,
        context: &PageContext,
        official_website: Option<&str>,
    ) -> VerifyResult<MatchScore> {
        Ok(self.evaluate(company_name, page_text, context, official_website))
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn name_score(name: &str, title: &str, haystack: &str) -> u8 {
    let tokens: Vec<&str> = name
        .split(' ')
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty() && !NAME_STOPWORDS.contains(t))
        .collect();
    if tokens.is_empty() {
        return 0;
    }
    let core = tokens.join(" ");
    if title.contains(&core) {
        return 10;
    }
    let words: Vec<&str> = haystack.split(' ').map(|w| w.trim_matches('.')).collect();
    let found = tokens.iter().filter(|t| words.contains(t)).count();
    ((found * 10) / tokens.len()) as u8
}

/// `https://www.acme.com/about` -> `acme.com`
fn website_domain(website: &str) -> Option<String> {
    let raw = if website.contains("://") {
        website.to_string()
    } else {
        format!("https://{website}")
    };
    let host = url::Url::parse(&raw).ok()?.host_str()?.to_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

// ============================================================================
// LLM scorer
// ============================================================================

const SYSTEM_PROMPT: &str = "You verify whether a web page is the official LinkedIn page of a company. \
Answer with a single JSON object and nothing else.";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct LlmVerdict {
    name_score: f64,
    business_score: f64,
    credibility_score: f64,
    website_score: f64,
    overall_score: f64,
    #[serde(default)]
    analysis: String,
}

/// OpenAI-compatible chat scorer with a rule-based fallback.
pub struct LlmScorer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    fallback: RuleBasedScorer,
}

impl LlmScorer {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            fallback: RuleBasedScorer,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn ask(
        &self,
        company_name: &str,
        page_text: &str,
        context: &PageContext,
        official_website: Option<&str>,
    ) -> VerifyResult<MatchScore> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt(company_name, page_text, context, official_website),
                },
            ],
            temperature: Some(0.0),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VerifyError::Scoring(format!("LLM API error: {error_text}")));
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| VerifyError::Scoring("empty LLM response".to_string()))?;

        parse_verdict(&content)
    }
}

#[async_trait]
impl MatchScorer for LlmScorer {
    async fn score(
        &self,
        company_name: &str,
        page_text: &str,
        context: &PageContext,
        official_website: Option<&str>,
    ) -> VerifyResult<MatchScore> {
        match self
            .ask(company_name, page_text, context, official_website)
            .await
        {
            Ok(score) => {
                debug!(url = %context.url, overall = score.overall_score, "LLM score");
                Ok(score)
            }
            Err(e) => {
                warn!(url = %context.url, error = %e, "LLM scoring failed, using rule-based score");
                Ok(self
                    .fallback
                    .evaluate(company_name, page_text, context, official_website))
            }
        }
    }
}

fn user_prompt(
    company_name: &str,
    page_text: &str,
    context: &PageContext,
    official_website: Option<&str>,
) -> String {
    let text: String = page_text.chars().take(MAX_PROMPT_CHARS).collect();
    format!(
        r#"Company: {company_name}
Official website: {website}
Page URL: {url}
Search title: {title}
Search snippet: {snippet}

Page text:
{text}

Score each criterion from 0 to 10:
- name_score: how well the page's company name matches
- business_score: how well the described business fits the company
- credibility_score: how likely this is an official company page
- website_score: whether the page links to or mentions the official website

Return JSON: {{"name_score": n, "business_score": n, "credibility_score": n, "website_score": n, "overall_score": n, "analysis": "short explanation"}}"#,
        website = official_website.unwrap_or("unknown"),
        url = context.url,
        title = context.title,
        snippet = context.snippet,
    )
}

/// Parse the model's JSON, tolerating code fences and surrounding prose.
fn parse_verdict(content: &str) -> VerifyResult<MatchScore> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => return Err(VerifyError::Scoring("no JSON object in LLM response".to_string())),
    };
    let verdict: LlmVerdict = serde_json::from_str(json)?;

    let clamp = |v: f64| v.clamp(0.0, 10.0).round() as u8;
    let details = ScoreDetails {
        name_score: clamp(verdict.name_score),
        business_score: clamp(verdict.business_score),
        credibility_score: clamp(verdict.credibility_score),
        website_score: clamp(verdict.website_score),
    };
    Ok(MatchScore::new(
        details,
        verdict.overall_score,
        verdict.analysis,
        "llm",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linkedin_context(title: &str) -> PageContext {
        PageContext {
            url: "https://www.linkedin.com/company/acme-inc".to_string(),
            title: title.to_string(),
            snippet: String::new(),
        }
    }

    #[test]
    fn test_rules_match_official_page() {
        let text = "Acme Inc | Industry: Industrial Machinery | Company size: 500 employees | \
                    Headquarters: Springfield | 12,000 followers | Website: https://acme.com";
        let score = RuleBasedScorer.evaluate(
            "Acme Inc",
            text,
            &linkedin_context("Acme Inc | LinkedIn"),
            Some("https://www.acme.com"),
        );
        assert_eq!(score.details.name_score, 10);
        assert_eq!(score.details.website_score, 10);
        assert!(score.is_match, "{score:?}");
        assert_eq!(score.scored_by, "rules");
    }

    #[test]
    fn test_rules_reject_other_company() {
        let text = "Globex Corporation | Industry: Energy | 3,000 employees | 50,000 followers";
        let score = RuleBasedScorer.evaluate(
            "Acme Inc",
            text,
            &linkedin_context("Globex Corporation | LinkedIn"),
            None,
        );
        assert_eq!(score.details.name_score, 0);
        assert!(!score.is_match);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let score = MatchScore::new(ScoreDetails::default(), 7.0, String::new(), "rules");
        assert!(score.is_match);
        let score = MatchScore::new(ScoreDetails::default(), 6.9, String::new(), "rules");
        assert!(!score.is_match);
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let content = "```json\n{\"name_score\": 9, \"business_score\": 8, \"credibility_score\": 10, \
                       \"website_score\": 7, \"overall_score\": 8.5, \"analysis\": \"official page\"}\n```";
        let score = parse_verdict(content).unwrap();
        assert_eq!(score.details.name_score, 9);
        assert_eq!(score.overall_score, 8.5);
        assert!(score.is_match);
        assert_eq!(score.scored_by, "llm");
    }

    #[test]
    fn test_parse_garbage_verdict_fails() {
        assert!(parse_verdict("I think it matches").is_err());
        assert!(parse_verdict("{\"overall_score\": \"high\"}").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_llm_falls_back_to_rules() {
        let scorer = LlmScorer::new(SecretString::new("key")).with_base_url("http://127.0.0.1:9/v1");
        let score = scorer
            .score("Acme Inc", "Acme Inc", &linkedin_context("Acme Inc | LinkedIn"), None)
            .await
            .unwrap();
        assert_eq!(score.scored_by, "rules");
    }

    #[test]
    fn test_website_domain() {
        assert_eq!(website_domain("https://www.acme.com/about").as_deref(), Some("acme.com"));
        assert_eq!(website_domain("acme.io").as_deref(), Some("acme.io"));
    }
}
