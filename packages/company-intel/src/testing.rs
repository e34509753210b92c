//! Testing utilities including mock implementations.
//!
//! These drive the scrape session, task manager and verification workflow
//! without a browser, a trade-site account or network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::{ScrapeError, ScrapeResult, TaskError, TaskResult, VerifyError, VerifyResult};
use crate::scrape::browser::{Browser, BrowserContext, BrowserLauncher, ContextOptions, Page};
use crate::security::SiteCredentials;
use crate::tasks::{ProgressReporter, Task, TaskHandler};
use crate::verify::{
    MatchScore, MatchScorer, PageContext, PageFetcher, ScoreDetails, SearchHit, WebSearcher,
};

// ============================================================================
// Mock trade site
// ============================================================================

/// Where the bot-protection wall shows up.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum Challenge {
    #[default]
    Never,
    Everywhere,
    /// Session checks after the landing visit that confirms a login.
    AfterLogin,
    ResultPages,
}

#[derive(Default)]
struct SiteState {
    launch_failure: bool,
    content_failure: bool,
    rejected_login: bool,
    challenge: Challenge,
    buyers: Vec<String>,
    suppliers: Vec<String>,
    /// Upcoming session checks that bounce to the login page.
    invalidations: usize,
    page_delay: Duration,

    login_attempts: usize,
    contexts_created: usize,
    browsers_launched: usize,
    open_pages: usize,
    max_open_pages: usize,
    visited: Vec<String>,
}

/// Cookie jar of one mock context.
#[derive(Default)]
struct ContextAuth {
    logged_in: bool,
    landing_visits: usize,
}

/// An in-memory stand-in for the trade-data site and the browser driving it.
///
/// Serves a login form at `/login`, an authenticated `/dashboard` that
/// redirects to the login page without a session, and result pages under
/// `/company/{name}/buyers` and `/company/{name}/suppliers`. Clones share
/// state, so a test keeps one handle for assertions and gives another to the
/// session as its launcher.
#[derive(Clone, Default)]
pub struct MockSite {
    state: Arc<Mutex<SiteState>>,
}

impl MockSite {
    pub const BASE_URL: &'static str = "https://trade.test";
    pub const RESULT_TITLE: &'static str = "Company Results | Trade Data";
    pub const CHALLENGE_TITLE: &'static str = "Attention Required! | Cloudflare";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials() -> SiteCredentials {
        SiteCredentials::new("analyst@example.com", "hunter2")
    }

    /// Browser launches fail.
    pub fn with_launch_failure(self) -> Self {
        self.state.lock().unwrap().launch_failure = true;
        self
    }

    /// Reading a result page's HTML fails after it loaded.
    pub fn with_content_failure(self) -> Self {
        self.state.lock().unwrap().content_failure = true;
        self
    }

    /// Submitting the login form never authenticates.
    pub fn with_rejected_login(self) -> Self {
        self.state.lock().unwrap().rejected_login = true;
        self
    }

    /// Every page is the bot-protection wall.
    pub fn with_bot_challenge(self) -> Self {
        self.state.lock().unwrap().challenge = Challenge::Everywhere;
        self
    }

    /// Login succeeds, then the session check before a fetch hits the wall.
    pub fn with_bot_challenge_after_login(self) -> Self {
        self.state.lock().unwrap().challenge = Challenge::AfterLogin;
        self
    }

    /// Login and session checks pass; result pages are the wall.
    pub fn with_bot_challenge_on_results(self) -> Self {
        self.state.lock().unwrap().challenge = Challenge::ResultPages;
        self
    }

    pub fn with_buyers(self, names: &[&str]) -> Self {
        self.state.lock().unwrap().buyers = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_suppliers(self, names: &[&str]) -> Self {
        self.state.lock().unwrap().suppliers = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Every navigation waits this long first.
    pub fn with_page_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().page_delay = delay;
        self
    }

    /// The next `count` session checks find the login dropped server-side.
    ///
    /// The landing visit that confirms a fresh login is never affected.
    pub fn invalidate_sessions(&self, count: usize) {
        self.state.lock().unwrap().invalidations = count;
    }

    /// Login form submissions.
    pub fn login_attempts(&self) -> usize {
        self.state.lock().unwrap().login_attempts
    }

    pub fn contexts_created(&self) -> usize {
        self.state.lock().unwrap().contexts_created
    }

    pub fn browsers_launched(&self) -> usize {
        self.state.lock().unwrap().browsers_launched
    }

    /// Pages opened and not yet closed.
    pub fn open_pages(&self) -> usize {
        self.state.lock().unwrap().open_pages
    }

    /// Highest number of pages open at the same time.
    pub fn max_open_pages(&self) -> usize {
        self.state.lock().unwrap().max_open_pages
    }

    /// Result page URLs in navigation order.
    pub fn visited_result_pages(&self) -> Vec<String> {
        self.state.lock().unwrap().visited.clone()
    }

    fn page_delay(&self) -> Duration {
        self.state.lock().unwrap().page_delay
    }

    fn render(&self, url: &str, auth: &Mutex<ContextAuth>) -> PageView {
        let mut state = self.state.lock().unwrap();
        if state.challenge == Challenge::Everywhere {
            return PageView::challenge(url);
        }

        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        if path.starts_with("/login") {
            return PageView::login(url);
        }

        let mut auth = auth.lock().unwrap();
        if !auth.logged_in {
            return PageView::login_redirect(&path);
        }

        if path.starts_with("/dashboard") {
            auth.landing_visits += 1;
            if auth.landing_visits > 1 && state.challenge == Challenge::AfterLogin {
                return PageView::challenge(url);
            }
            if auth.landing_visits > 1 && state.invalidations > 0 {
                state.invalidations -= 1;
                auth.logged_in = false;
                return PageView::login_redirect(&path);
            }
            return PageView::dashboard(url);
        }

        if let Some(rest) = path.strip_prefix("/company/") {
            if state.challenge == Challenge::ResultPages {
                return PageView::challenge(url);
            }
            state.visited.push(url.to_string());
            let names = if rest.ends_with("/suppliers") {
                &state.suppliers
            } else {
                &state.buyers
            };
            return PageView::results(url, names);
        }

        PageView::not_found(url)
    }
}

#[derive(Clone, Default)]
struct PageView {
    url: String,
    title: String,
    html: String,
    text: String,
    is_login: bool,
    is_results: bool,
}

impl PageView {
    fn challenge(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: MockSite::CHALLENGE_TITLE.to_string(),
            html: "<html><body><h1>Checking your browser</h1></body></html>".to_string(),
            text: "Checking your browser".to_string(),
            ..Self::default()
        }
    }

    fn login(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: "Log in | Trade Data".to_string(),
            html: concat!(
                "<html><body><form>",
                "<input type='email' name='email'>",
                "<input type='password' name='password'>",
                "<button type='submit'>Log in</button>",
                "</form><a href='/reset'>Forgot password?</a></body></html>"
            )
            .to_string(),
            text: "Log in Email Password Log in Forgot password?".to_string(),
            is_login: true,
            ..Self::default()
        }
    }

    fn login_redirect(from: &str) -> Self {
        Self::login(&format!(
            "{}/login?next={}",
            MockSite::BASE_URL,
            urlencoding::encode(from)
        ))
    }

    fn dashboard(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: "Dashboard | Trade Data".to_string(),
            html: "<html><body><h1>Welcome back</h1></body></html>".to_string(),
            text: "Welcome back".to_string(),
            ..Self::default()
        }
    }

    fn results(url: &str, names: &[String]) -> Self {
        let rows: String = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                format!(
                    "<tr><td><a href='/company/{i}'>{name}</a></td>\
                     <td><span class='shipments'>{} matching shipments</span></td></tr>",
                    (i + 1) * 10
                )
            })
            .collect();
        Self {
            url: url.to_string(),
            title: MockSite::RESULT_TITLE.to_string(),
            html: format!(
                "<html><body><nav><a href='/'>Home</a></nav><table>{rows}\
                 <tr><td><a href='?page=2'>Next</a></td></tr></table></body></html>"
            ),
            text: names.join(" "),
            is_results: true,
            ..Self::default()
        }
    }

    fn not_found(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: "Not Found".to_string(),
            html: "<html><body>Not Found</body></html>".to_string(),
            text: "Not Found".to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BrowserLauncher for MockSite {
    async fn launch(&self) -> ScrapeResult<Arc<dyn Browser>> {
        let mut state = self.state.lock().unwrap();
        if state.launch_failure {
            return Err(ScrapeError::BrowserUnavailable(
                "mock browser failed to start".to_string(),
            ));
        }
        state.browsers_launched += 1;
        Ok(Arc::new(MockBrowser { site: self.clone() }))
    }
}

struct MockBrowser {
    site: MockSite,
}

#[async_trait]
impl Browser for MockBrowser {
    async fn new_context(&self, _options: &ContextOptions) -> ScrapeResult<Arc<dyn BrowserContext>> {
        self.site.state.lock().unwrap().contexts_created += 1;
        Ok(Arc::new(MockContext {
            site: self.site.clone(),
            auth: Arc::new(Mutex::new(ContextAuth::default())),
        }))
    }

    async fn close(&self) -> ScrapeResult<()> {
        Ok(())
    }
}

struct MockContext {
    site: MockSite,
    auth: Arc<Mutex<ContextAuth>>,
}

#[async_trait]
impl BrowserContext for MockContext {
    async fn new_page(&self) -> ScrapeResult<Box<dyn Page>> {
        let mut state = self.site.state.lock().unwrap();
        state.open_pages += 1;
        state.max_open_pages = state.max_open_pages.max(state.open_pages);
        Ok(Box::new(MockPage {
            site: self.site.clone(),
            auth: self.auth.clone(),
            view: Mutex::new(PageView::default()),
            filled: AtomicUsize::new(0),
        }))
    }

    async fn close(&self) -> ScrapeResult<()> {
        self.auth.lock().unwrap().logged_in = false;
        Ok(())
    }
}

struct MockPage {
    site: MockSite,
    auth: Arc<Mutex<ContextAuth>>,
    view: Mutex<PageView>,
    filled: AtomicUsize,
}

impl MockPage {
    fn view(&self) -> PageView {
        self.view.lock().unwrap().clone()
    }
}

#[async_trait]
impl Page for MockPage {
    async fn goto(&self, url: &str, _timeout: Duration) -> ScrapeResult<()> {
        let delay = self.site.page_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let view = self.site.render(url, &self.auth);
        *self.view.lock().unwrap() = view;
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> ScrapeResult<()> {
        Ok(())
    }

    async fn title(&self) -> ScrapeResult<String> {
        Ok(self.view().title)
    }

    async fn url(&self) -> ScrapeResult<String> {
        Ok(self.view().url)
    }

    async fn content(&self) -> ScrapeResult<String> {
        let view = self.view();
        if view.is_results && self.site.state.lock().unwrap().content_failure {
            return Err(ScrapeError::driver("getPageSource", "renderer crashed"));
        }
        Ok(view.html)
    }

    async fn body_text(&self) -> ScrapeResult<String> {
        Ok(self.view().text)
    }

    async fn fill(&self, _selectors: &[&str], _value: &str) -> ScrapeResult<bool> {
        if !self.view().is_login {
            return Ok(false);
        }
        self.filled.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn click(&self, _selectors: &[&str]) -> ScrapeResult<bool> {
        if !self.view().is_login {
            return Ok(false);
        }
        let mut state = self.site.state.lock().unwrap();
        state.login_attempts += 1;
        if !state.rejected_login && self.filled.load(Ordering::SeqCst) >= 2 {
            let mut auth = self.auth.lock().unwrap();
            auth.logged_in = true;
            auth.landing_visits = 0;
        }
        Ok(true)
    }

    async fn press_enter(&self, _selectors: &[&str]) -> ScrapeResult<bool> {
        Ok(false)
    }

    async fn close(&self) -> ScrapeResult<()> {
        let mut state = self.site.state.lock().unwrap();
        state.open_pages = state.open_pages.saturating_sub(1);
        Ok(())
    }
}

// ============================================================================
// Scripted task handler
// ============================================================================

#[derive(Clone)]
enum Outcome {
    Succeed(Option<Value>),
    Fail(String),
    Panic(String),
}

/// A task handler that reports fixed checkpoints, optionally stores a
/// partial result, sleeps, then returns a canned outcome.
#[derive(Clone)]
pub struct ScriptedHandler {
    outcome: Outcome,
    checkpoints: Vec<u8>,
    stored: Option<Value>,
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            checkpoints: Vec::new(),
            stored: None,
            delay: Duration::ZERO,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(result: Value) -> Self {
        Self::with_outcome(Outcome::Succeed(Some(result)))
    }

    /// Completes without a result of its own.
    pub fn succeeding_without_result() -> Self {
        Self::with_outcome(Outcome::Succeed(None))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Fail(message.into()))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Panic(message.into()))
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<u8>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Store `result` through the reporter after the checkpoints.
    pub fn with_stored_result(mut self, result: Value) -> Self {
        self.stored = Some(result);
        self
    }

    /// Sleep after the checkpoints, before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many times `run` was entered, across clones.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn run(&self, _task: &Task, progress: &ProgressReporter) -> TaskResult<Option<Value>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for checkpoint in &self.checkpoints {
            progress.report(*checkpoint).await;
        }
        if let Some(result) = &self.stored {
            progress.store_result(result.clone()).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Outcome::Succeed(result) => Ok(result.clone()),
            Outcome::Fail(message) => Err(TaskError::Handler(message.clone())),
            Outcome::Panic(message) => panic!("{message}"),
        }
    }
}

// ============================================================================
// Verification collaborators
// ============================================================================

/// Mock web searcher with canned hits per query.
#[derive(Default)]
pub struct MockWebSearcher {
    results: RwLock<HashMap<String, Vec<SearchHit>>>,
    fail: bool,
    calls: RwLock<Vec<(String, Option<String>)>>,
}

impl MockWebSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.results
            .write()
            .unwrap()
            .insert(query.to_string(), hits);
        self
    }

    pub fn with_urls(self, query: &str, urls: &[&str]) -> Self {
        let hits = urls.iter().map(|u| SearchHit::new(*u)).collect();
        self.with_hits(query, hits)
    }

    /// Every search errors.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// `(query, site_filter)` for each search, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl WebSearcher for MockWebSearcher {
    async fn search(
        &self,
        query: &str,
        site_filter: Option<&str>,
        limit: usize,
    ) -> VerifyResult<Vec<SearchHit>> {
        self.calls
            .write()
            .unwrap()
            .push((query.to_string(), site_filter.map(str::to_string)));
        if self.fail {
            return Err(VerifyError::Search("mock search unavailable".to_string()));
        }
        let mut hits = self
            .results
            .read()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default();
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Mock fetcher returning canned page text; unknown URLs yield empty text,
/// as an exhausted fetch does.
#[derive(Default)]
pub struct MockPageFetcher {
    pages: RwLock<HashMap<String, String>>,
    calls: RwLock<Vec<String>>,
}

impl MockPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, text: &str) -> Self {
        self.pages
            .write()
            .unwrap()
            .insert(url.to_string(), text.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for MockPageFetcher {
    async fn fetch(&self, url: &str, _retries: usize) -> VerifyResult<String> {
        self.calls.write().unwrap().push(url.to_string());
        Ok(self
            .pages
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default())
    }
}

/// Mock scorer with a fixed overall score per URL (zero otherwise).
#[derive(Default)]
pub struct MockScorer {
    scores: RwLock<HashMap<String, f64>>,
    failing: RwLock<Vec<String>>,
}

impl MockScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(self, url: &str, overall: f64) -> Self {
        self.scores.write().unwrap().insert(url.to_string(), overall);
        self
    }

    /// Scoring this URL errors.
    pub fn fail_url(self, url: &str) -> Self {
        self.failing.write().unwrap().push(url.to_string());
        self
    }
}

#[async_trait]
impl MatchScorer for MockScorer {
    async fn score(
        &self,
        _company_name: &str,
        _page_text: &str,
        context: &PageContext,
        _official_website: Option<&str>,
    ) -> VerifyResult<MatchScore> {
        if self.failing.read().unwrap().contains(&context.url) {
            return Err(VerifyError::Scoring("mock scorer refused".to_string()));
        }
        let overall = self
            .scores
            .read()
            .unwrap()
            .get(&context.url)
            .copied()
            .unwrap_or_default();
        Ok(MatchScore::new(
            ScoreDetails::default(),
            overall,
            "scripted score".to_string(),
            "mock",
        ))
    }
}
