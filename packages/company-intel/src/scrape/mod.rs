//! Authenticated trade-data scraping.

pub mod browser;
pub mod extract;
pub mod session;
pub mod webdriver;

pub use browser::{Browser, BrowserContext, BrowserLauncher, ContextOptions, Page};
pub use extract::{extract_companies, CompanyRecord, PageExtraction};
pub use session::{
    CrawlKind, CrawlOutcome, DegradedRecord, ScrapeSession, MAX_SESSION_ATTEMPTS,
};
pub use webdriver::WebDriverLauncher;
