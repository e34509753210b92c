//! Company LinkedIn presence verification.

pub mod fetcher;
pub mod scorer;
pub mod searcher;
pub mod workflow;

pub use fetcher::{page_text, HttpPageFetcher, PageFetcher};
pub use scorer::{
    scorer_from_config, LlmScorer, MatchScore, MatchScorer, PageContext, RuleBasedScorer,
    ScoreDetails, MATCH_THRESHOLD,
};
pub use searcher::{SearchHit, TavilyWebSearcher, WebSearcher};
pub use workflow::{FetchedPage, PageVerification, VerificationReport, VerificationWorkflow};
