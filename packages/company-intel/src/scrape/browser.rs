//! Browser automation seam.
//!
//! The session only talks to these traits. [`crate::scrape::webdriver`]
//! implements them over W3C WebDriver; [`crate::testing::MockSite`]
//! implements them as an in-memory fake site.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProxyConfig, SessionConfig};
use crate::error::ScrapeResult;

/// Settings for a new browser context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub user_agent: String,
    pub headless: bool,
    /// Only ever a complete proxy; see [`ProxyConfig::resolve`].
    pub proxy: Option<ProxyConfig>,
}

impl From<&SessionConfig> for ContextOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            headless: config.headless,
            proxy: config.proxy.clone(),
        }
    }
}

/// Starts browser processes.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> ScrapeResult<Arc<dyn Browser>>;
}

/// A running browser process.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open an isolated context with its own cookie jar.
    async fn new_context(&self, options: &ContextOptions) -> ScrapeResult<Arc<dyn BrowserContext>>;

    /// Release the browser along with any context still open on it.
    async fn close(&self) -> ScrapeResult<()>;
}

/// Shared cookie and storage state. Logged-in state lives here.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> ScrapeResult<Box<dyn Page>>;

    async fn close(&self) -> ScrapeResult<()>;
}

/// One tab inside a context.
///
/// Selector-based operations take candidate selectors in priority order and
/// act on the first that matches. They report whether anything matched
/// rather than failing on a missing element.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> ScrapeResult<()>;

    /// Wait until the page stops loading resources.
    async fn wait_for_network_idle(&self, timeout: Duration) -> ScrapeResult<()>;

    async fn title(&self) -> ScrapeResult<String>;

    /// Current URL after any redirects.
    async fn url(&self) -> ScrapeResult<String>;

    /// Rendered HTML of the document.
    async fn content(&self) -> ScrapeResult<String>;

    /// Visible text of the document body.
    async fn body_text(&self) -> ScrapeResult<String>;

    async fn fill(&self, selectors: &[&str], value: &str) -> ScrapeResult<bool>;

    async fn click(&self, selectors: &[&str]) -> ScrapeResult<bool>;

    async fn press_enter(&self, selectors: &[&str]) -> ScrapeResult<bool>;

    async fn close(&self) -> ScrapeResult<()>;
}
