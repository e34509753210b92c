//! Authenticated scrape session against the trade-data site.
//!
//! One `ScrapeSession` owns one browser, one context (the cookie jar that
//! carries the login) and the login flag. Create it once at startup, share it
//! through an `Arc`, and call [`ScrapeSession::shutdown`] on exit.
//!
//! Every crawl:
//!
//! 1. takes a permit from the admission gate
//! 2. locks the session state for the lifetime of its page, so two admitted
//!    crawls never navigate the same context at once
//! 3. ensures browser, context and login
//! 4. re-validates the session on the landing page
//! 5. loads the result page and extracts company records
//!
//! A redirect to the login page during step 4 discards the context and
//! retries the whole crawl, at most [`MAX_SESSION_ATTEMPTS`] times in total.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::logging;
use crate::scrape::browser::{Browser, BrowserContext, BrowserLauncher, ContextOptions, Page};
use crate::scrape::extract::{extract_companies, PageExtraction};
use crate::security::SiteCredentials;
use crate::semaphore::{AdmissionGate, SESSION_CONCURRENCY};

/// Crawl attempts per call when the session keeps getting invalidated.
pub const MAX_SESSION_ATTEMPTS: u32 = 2;

const EMAIL_SELECTORS: &[&str] = &[
    "input[type='email']",
    "input[name='email']",
    "input[id*='email']",
    "input[name='username']",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "input[type='password']",
    "input[name='password']",
    "input[id*='password']",
];

const SUBMIT_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "button[id*='login']",
    "button[class*='login']",
];

/// Which result page to crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlKind {
    Buyers,
    Suppliers,
}

impl CrawlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlKind::Buyers => "buyers",
            CrawlKind::Suppliers => "suppliers",
        }
    }
}

/// What a reachable page yielded when extraction could not finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedRecord {
    pub title: String,
    pub url: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of one crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CrawlOutcome {
    Extracted(PageExtraction),
    Degraded(DegradedRecord),
}

impl CrawlOutcome {
    pub fn companies(&self) -> &[crate::scrape::extract::CompanyRecord] {
        match self {
            CrawlOutcome::Extracted(page) => &page.companies,
            CrawlOutcome::Degraded(_) => &[],
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, CrawlOutcome::Degraded(_))
    }
}

#[derive(Default)]
struct SessionState {
    browser: Option<Arc<dyn Browser>>,
    context: Option<Arc<dyn BrowserContext>>,
    logged_in: bool,
    credentials: Option<SiteCredentials>,
}

pub struct ScrapeSession {
    config: SessionConfig,
    launcher: Arc<dyn BrowserLauncher>,
    gate: AdmissionGate,
    state: Mutex<SessionState>,
}

impl ScrapeSession {
    pub fn new(config: SessionConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            config,
            launcher,
            gate: AdmissionGate::new(SESSION_CONCURRENCY),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Store credentials and reset the login flag.
    ///
    /// Also rotates the session log once it passes its size limit. Safe to
    /// call repeatedly; the next crawl logs in again.
    pub async fn init(&self, credentials: SiteCredentials) -> ScrapeResult<()> {
        if let Some(path) = &self.config.log_file {
            if logging::rotate_if_oversized(path, self.config.log_rotate_bytes)? {
                info!(path = %path.display(), "rotated session log");
            }
        }

        let mut state = self.state.lock().await;
        info!(email = %credentials.email, "scrape session initialised");
        state.credentials = Some(credentials);
        state.logged_in = false;
        Ok(())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.lock().await.logged_in
    }

    pub async fn has_credentials(&self) -> bool {
        self.state.lock().await.credentials.is_some()
    }

    /// Companies buying from `company_name`.
    ///
    /// `Ok(None)` means not even a page could be opened. Fatal errors (bot
    /// challenge, failed login, repeated invalidation) are returned as `Err`.
    pub async fn crawl_buyer_data(&self, company_name: &str) -> ScrapeResult<Option<CrawlOutcome>> {
        self.crawl(CrawlKind::Buyers, company_name).await
    }

    /// Companies supplying `company_name`. Same contract as
    /// [`Self::crawl_buyer_data`].
    pub async fn crawl_supplier_data(
        &self,
        company_name: &str,
    ) -> ScrapeResult<Option<CrawlOutcome>> {
        self.crawl(CrawlKind::Suppliers, company_name).await
    }

    pub async fn crawl(
        &self,
        kind: CrawlKind,
        company_name: &str,
    ) -> ScrapeResult<Option<CrawlOutcome>> {
        let url = match kind {
            CrawlKind::Buyers => self.config.buyer_url(company_name),
            CrawlKind::Suppliers => self.config.supplier_url(company_name),
        };

        let _permit = self.gate.acquire().await?;
        let mut state = self.state.lock().await;

        let mut attempt = 1;
        loop {
            debug!(kind = kind.as_str(), company = %company_name, attempt, "crawl attempt");
            match self.crawl_once(&mut state, &url).await {
                Err(e) if e.is_session_invalidated() => {
                    warn!(kind = kind.as_str(), attempt, "session invalidated, discarding context");
                    self.discard_context(&mut state).await;
                    if attempt >= MAX_SESSION_ATTEMPTS {
                        return Err(e);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Close context and browser. The next crawl recreates both.
    pub async fn shutdown(&self) -> ScrapeResult<()> {
        let mut state = self.state.lock().await;
        self.discard_context(&mut state).await;
        if let Some(browser) = state.browser.take() {
            browser.close().await?;
            info!("browser closed");
        }
        Ok(())
    }

    async fn crawl_once(
        &self,
        state: &mut SessionState,
        url: &str,
    ) -> ScrapeResult<Option<CrawlOutcome>> {
        let credentials = state
            .credentials
            .clone()
            .ok_or(ScrapeError::MissingCredentials)?;

        let context = match self.ensure_context(state).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "browser context unavailable");
                return Ok(None);
            }
        };
        let page = match context.new_page().await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "could not open page");
                return Ok(None);
            }
        };

        let result = match self.drive(state, page.as_ref(), url, &credentials).await {
            Ok(extraction) => Ok(Some(CrawlOutcome::Extracted(extraction))),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(url = %url, error = %e, "crawl degraded");
                Ok(degraded(page.as_ref(), &e).await.map(CrawlOutcome::Degraded))
            }
        };

        if let Err(e) = page.close().await {
            debug!(error = %e, "page close failed");
        }
        result
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        page: &dyn Page,
        url: &str,
        credentials: &SiteCredentials,
    ) -> ScrapeResult<PageExtraction> {
        if !state.logged_in {
            self.login(page, credentials).await?;
            state.logged_in = true;
        }
        self.check_session(page).await?;

        page.goto(url, self.config.navigation_timeout).await?;
        self.settle(page).await;
        tokio::time::sleep(self.config.settle_delay).await;
        self.ensure_not_challenged(page).await?;

        let html = page.content().await?;
        let extraction = extract_companies(&html);
        info!(url = %url, companies = extraction.companies.len(), "page extracted");
        Ok(extraction)
    }

    async fn ensure_context(
        &self,
        state: &mut SessionState,
    ) -> ScrapeResult<Arc<dyn BrowserContext>> {
        let browser = match &state.browser {
            Some(browser) => browser.clone(),
            None => {
                let browser = self.launcher.launch().await?;
                info!("browser launched");
                state.browser = Some(browser.clone());
                browser
            }
        };

        if let Some(context) = &state.context {
            return Ok(context.clone());
        }

        let options = ContextOptions::from(&self.config);
        if options.proxy.is_some() {
            info!("routing browser context through proxy");
        }
        let context = browser.new_context(&options).await?;
        state.context = Some(context.clone());
        state.logged_in = false;
        Ok(context)
    }

    async fn discard_context(&self, state: &mut SessionState) {
        if let Some(context) = state.context.take() {
            if let Err(e) = context.close().await {
                warn!(error = %e, "failed to close browser context");
            }
        }
        state.logged_in = false;
    }

    async fn login(&self, page: &dyn Page, credentials: &SiteCredentials) -> ScrapeResult<()> {
        let login_url = self.config.login_url();
        info!(url = %login_url, "logging in");

        page.goto(&login_url, self.config.navigation_timeout).await?;
        self.settle(page).await;
        self.ensure_not_challenged(page).await?;

        if !page.fill(EMAIL_SELECTORS, &credentials.email).await? {
            warn!("email field not found on login page");
        }
        if !page
            .fill(PASSWORD_SELECTORS, credentials.password.expose())
            .await?
        {
            warn!("password field not found on login page");
        }
        if !page.click(SUBMIT_SELECTORS).await? {
            debug!("no login button, submitting with enter");
            if !page.press_enter(PASSWORD_SELECTORS).await? {
                warn!("could not submit login form");
            }
        }
        tokio::time::sleep(self.config.login_settle_delay).await;

        page.goto(&self.config.landing_url(), self.config.navigation_timeout)
            .await?;
        self.settle(page).await;
        let title = self.ensure_not_challenged(page).await?;

        if contains_any(&title, &self.config.authenticated_titles) {
            info!(title = %title, "login confirmed");
            return Ok(());
        }
        let text = page.body_text().await?;
        if !contains_any(&text, &self.config.login_prompt_texts) {
            info!(title = %title, "login assumed, no login prompt on landing page");
            return Ok(());
        }
        let current = page.url().await.unwrap_or_default();
        Err(ScrapeError::LoginFailed(format!(
            "login prompt still shown at {current}"
        )))
    }

    async fn check_session(&self, page: &dyn Page) -> ScrapeResult<()> {
        page.goto(&self.config.landing_url(), self.config.navigation_timeout)
            .await?;
        self.settle(page).await;
        self.ensure_not_challenged(page).await?;

        let current = page.url().await?;
        if self.is_login_url(&current) {
            return Err(ScrapeError::SessionInvalidated);
        }
        debug!(url = %current, "session valid");
        Ok(())
    }

    /// Returns the page title when it is not a bot challenge.
    async fn ensure_not_challenged(&self, page: &dyn Page) -> ScrapeResult<String> {
        let title = page.title().await?;
        if contains_any(&title, &self.config.bot_challenge_titles) {
            let url = page.url().await.unwrap_or_default();
            warn!(url = %url, title = %title, "bot challenge detected");
            return Err(ScrapeError::BotChallenge { url, title });
        }
        Ok(title)
    }

    /// Network idle is best effort; slow pages are still read.
    async fn settle(&self, page: &dyn Page) {
        if let Err(e) = page
            .wait_for_network_idle(self.config.network_idle_timeout)
            .await
        {
            debug!(error = %e, "network did not go idle");
        }
    }

    fn is_login_url(&self, current: &str) -> bool {
        let login_path = self.config.login_path.trim_end_matches('/');
        match Url::parse(current) {
            Ok(url) => url.path().trim_end_matches('/').starts_with(login_path),
            Err(_) => current.contains(login_path),
        }
    }
}

/// Capture what the page still shows after a failure.
async fn degraded(page: &dyn Page, error: &ScrapeError) -> Option<DegradedRecord> {
    let title = page.title().await.ok()?;
    let url = page.url().await.ok()?;
    Some(DegradedRecord {
        title,
        url,
        error: error.to_string(),
        timestamp: Utc::now(),
    })
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}
