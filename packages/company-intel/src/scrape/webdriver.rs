//! W3C WebDriver implementation of the browser seam.
//!
//! Talks JSON over HTTP to a running driver (chromedriver by default).
//! A driver session maps to a [`BrowserContext`]: it owns its own profile and
//! cookie jar. Pages share the session's single window, so a page close
//! only blanks the window.
//!
//! Chrome ignores credentials in a proxy address, so an authenticating proxy
//! is answered by a small unpacked extension written to the temp directory
//! and loaded into the session. The driver must therefore run on the same
//! host as this library. The extension is removed with its session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::fs;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{ProxyConfig, SessionConfig};
use crate::error::{ScrapeError, ScrapeResult};
use crate::scrape::browser::{Browser, BrowserContext, BrowserLauncher, ContextOptions, Page};
use crate::security::SecretString;

/// W3C element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4a4d6b8fb3a0";

/// WebDriver key code for Enter.
const ENTER_KEY: &str = "\u{E007}";

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Consecutive polls with an unchanged resource count that count as idle.
const IDLE_STABLE_POLLS: u32 = 2;

const READY_STATE_SCRIPT: &str = r#"
    return [
        document.readyState || "",
        (performance.getEntriesByType ? performance.getEntriesByType("resource").length : 0)
    ];
"#;

#[derive(Clone)]
struct Driver {
    client: reqwest::Client,
    base: String,
}

impl Driver {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        command: &str,
    ) -> ScrapeResult<Value> {
        let endpoint = format!("{}{}", self.base, path);
        let mut request = self.client.request(method, &endpoint);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let res = request.send().await?;
        let status = res.status();
        let text = res.text().await?;
        let value: Value = serde_json::from_str(&text).unwrap_or_default();

        if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
            let message = value
                .pointer("/value/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown webdriver error");
            return Err(ScrapeError::driver(command, format!("{err}: {message}")));
        }
        if !status.is_success() {
            return Err(ScrapeError::driver(
                command,
                format!("HTTP {}: {}", status.as_u16(), truncate_for_log(&text, 240)),
            ));
        }
        Ok(value.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn delete_session(&self, session_id: &str) -> ScrapeResult<()> {
        self.command(
            Method::DELETE,
            &format!("/session/{session_id}"),
            None,
            "delete session",
        )
        .await?;
        debug!(session_id = %session_id, "driver session deleted");
        Ok(())
    }

    async fn execute(&self, session_id: &str, script: &str, command: &str) -> ScrapeResult<Value> {
        self.command(
            Method::POST,
            &format!("/session/{session_id}/execute/sync"),
            Some(json!({ "script": script, "args": [] })),
            command,
        )
        .await
    }
}

/// Connects to an already running WebDriver endpoint.
pub struct WebDriverLauncher {
    driver: Driver,
}

impl WebDriverLauncher {
    pub fn new(endpoint: &str, request_timeout: Duration) -> ScrapeResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            driver: Driver {
                client,
                base: endpoint.trim_end_matches('/').to_string(),
            },
        })
    }

    pub fn from_config(config: &SessionConfig) -> ScrapeResult<Self> {
        // Requests must outlive the slowest page load.
        Self::new(
            &config.webdriver_url,
            config.navigation_timeout + Duration::from_secs(30),
        )
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> ScrapeResult<Arc<dyn Browser>> {
        let status = self
            .driver
            .command(Method::GET, "/status", None, "status")
            .await
            .map_err(|e| ScrapeError::BrowserUnavailable(e.to_string()))?;

        if status.get("ready").and_then(|v| v.as_bool()) == Some(false) {
            let message = status
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("driver not ready");
            return Err(ScrapeError::BrowserUnavailable(message.to_string()));
        }

        info!(endpoint = %self.driver.base, "webdriver endpoint ready");
        Ok(Arc::new(WebDriverBrowser {
            driver: self.driver.clone(),
            sessions: OpenSessions::default(),
        }))
    }
}

/// Driver sessions opened through one browser, with their proxy extension.
#[derive(Clone, Default)]
struct OpenSessions(Arc<Mutex<HashMap<String, Option<PathBuf>>>>);

impl OpenSessions {
    fn insert(&self, session_id: &str, extension: Option<PathBuf>) {
        self.lock().insert(session_id.to_string(), extension);
    }

    /// Forget `session_id`, returning its extension directory if it had one.
    fn remove(&self, session_id: &str) -> Option<PathBuf> {
        self.lock().remove(session_id).flatten()
    }

    fn drain(&self) -> Vec<(String, Option<PathBuf>)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<PathBuf>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The driver process itself is managed outside this library; closing the
/// browser ends every driver session it still has open.
struct WebDriverBrowser {
    driver: Driver,
    sessions: OpenSessions,
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn new_context(&self, options: &ContextOptions) -> ScrapeResult<Arc<dyn BrowserContext>> {
        let route = options.proxy.as_ref().and_then(ProxyRoute::from_config);
        let extension = match &route {
            Some(route) => Some(write_auth_extension(route).await?),
            None => None,
        };
        let proxy = route.as_ref().zip(extension.as_deref());

        let created = self
            .driver
            .command(
                Method::POST,
                "/session",
                Some(capabilities(options, proxy)),
                "new session",
            )
            .await
            .and_then(|value| {
                value
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| ScrapeError::driver("new session", "response missing sessionId"))
            });
        let session_id = match created {
            Ok(id) => id,
            Err(e) => {
                remove_extension(extension.as_deref()).await;
                return Err(e);
            }
        };

        debug!(session_id = %session_id, proxy = route.is_some(), "browser context created");
        self.sessions.insert(&session_id, extension);
        Ok(Arc::new(WebDriverContext {
            driver: self.driver.clone(),
            sessions: self.sessions.clone(),
            session_id,
        }))
    }

    async fn close(&self) -> ScrapeResult<()> {
        for (session_id, extension) in self.sessions.drain() {
            if let Err(e) = self.driver.delete_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to end driver session");
            }
            remove_extension(extension.as_deref()).await;
        }
        Ok(())
    }
}

struct WebDriverContext {
    driver: Driver,
    sessions: OpenSessions,
    session_id: String,
}

#[async_trait]
impl BrowserContext for WebDriverContext {
    async fn new_page(&self) -> ScrapeResult<Box<dyn Page>> {
        Ok(Box::new(WebDriverPage {
            driver: self.driver.clone(),
            session_id: self.session_id.clone(),
        }))
    }

    async fn close(&self) -> ScrapeResult<()> {
        let extension = self.sessions.remove(&self.session_id);
        let deleted = self.driver.delete_session(&self.session_id).await;
        remove_extension(extension.as_deref()).await;
        deleted
    }
}

struct WebDriverPage {
    driver: Driver,
    session_id: String,
}

impl WebDriverPage {
    fn path(&self, suffix: &str) -> String {
        format!("/session/{}{}", self.session_id, suffix)
    }

    async fn string(&self, suffix: &str, command: &str) -> ScrapeResult<String> {
        let value = self
            .driver
            .command(Method::GET, &self.path(suffix), None, command)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// First element matching any selector, or `None`.
    async fn find(&self, selectors: &[&str]) -> ScrapeResult<Option<String>> {
        for selector in selectors {
            let found = self
                .driver
                .command(
                    Method::POST,
                    &self.path("/element"),
                    Some(json!({ "using": "css selector", "value": selector })),
                    "find element",
                )
                .await;
            match found {
                Ok(value) => {
                    if let Some(id) = value.get(ELEMENT_KEY).and_then(|v| v.as_str()) {
                        return Ok(Some(id.to_string()));
                    }
                }
                Err(ScrapeError::Driver { message, .. }) if message.starts_with("no such element") => {}
                Err(ScrapeError::Driver { message, .. }) if message.starts_with("invalid selector") => {
                    warn!(selector = %selector, "skipping invalid selector");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn send_keys(&self, element: &str, text: &str) -> ScrapeResult<()> {
        self.driver
            .command(
                Method::POST,
                &self.path(&format!("/element/{element}/value")),
                Some(json!({ "text": text })),
                "send keys",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str, deadline: Duration) -> ScrapeResult<()> {
        debug!(url = %url, "navigating");
        let path = self.path("/url");
        let navigate =
            self.driver
                .command(Method::POST, &path, Some(json!({ "url": url })), "navigate");
        match timeout(deadline, navigate).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ScrapeError::Timeout(format!("navigation to {url}"))),
        }
    }

    async fn wait_for_network_idle(&self, deadline: Duration) -> ScrapeResult<()> {
        let started = Instant::now();
        let mut last_count = None;
        let mut stable = 0;

        loop {
            let state = self
                .driver
                .execute(&self.session_id, READY_STATE_SCRIPT, "ready state")
                .await?;
            let ready = state.get(0).and_then(|v| v.as_str()) == Some("complete");
            let count = state.get(1).and_then(|v| v.as_u64());

            if ready && count.is_some() && count == last_count {
                stable += 1;
                if stable >= IDLE_STABLE_POLLS {
                    return Ok(());
                }
            } else {
                stable = 0;
            }
            last_count = count;

            if started.elapsed() >= deadline {
                return Err(ScrapeError::Timeout("network idle".to_string()));
            }
            sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    async fn title(&self) -> ScrapeResult<String> {
        self.string("/title", "title").await
    }

    async fn url(&self) -> ScrapeResult<String> {
        self.string("/url", "current url").await
    }

    async fn content(&self) -> ScrapeResult<String> {
        let value = self
            .driver
            .execute(
                &self.session_id,
                "return document.documentElement ? document.documentElement.outerHTML : '';",
                "page source",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn body_text(&self) -> ScrapeResult<String> {
        let value = self
            .driver
            .execute(
                &self.session_id,
                "return document.body ? document.body.innerText : '';",
                "body text",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn fill(&self, selectors: &[&str], value: &str) -> ScrapeResult<bool> {
        let Some(element) = self.find(selectors).await? else {
            return Ok(false);
        };
        self.driver
            .command(
                Method::POST,
                &self.path(&format!("/element/{element}/clear")),
                Some(json!({})),
                "clear",
            )
            .await?;
        self.send_keys(&element, value).await?;
        Ok(true)
    }

    async fn click(&self, selectors: &[&str]) -> ScrapeResult<bool> {
        let Some(element) = self.find(selectors).await? else {
            return Ok(false);
        };
        self.driver
            .command(
                Method::POST,
                &self.path(&format!("/element/{element}/click")),
                Some(json!({})),
                "click",
            )
            .await?;
        Ok(true)
    }

    async fn press_enter(&self, selectors: &[&str]) -> ScrapeResult<bool> {
        let Some(element) = self.find(selectors).await? else {
            return Ok(false);
        };
        self.send_keys(&element, ENTER_KEY).await?;
        Ok(true)
    }

    async fn close(&self) -> ScrapeResult<()> {
        self.driver
            .command(
                Method::POST,
                &self.path("/url"),
                Some(json!({ "url": "about:blank" })),
                "blank page",
            )
            .await?;
        Ok(())
    }
}

/// Chrome capabilities for a new driver session.
///
/// `proxy` pairs the route with the directory of its auth extension.
fn capabilities(options: &ContextOptions, proxy: Option<(&ProxyRoute, &Path)>) -> Value {
    let mut args = vec![
        format!("--user-agent={}", options.user_agent),
        "--window-size=1400,1200".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--lang=en-US".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    if !cfg!(target_os = "macos") {
        args.push("--no-sandbox".to_string());
    }
    if let Some((_, extension)) = proxy {
        args.push(format!("--load-extension={}", extension.display()));
    }

    let mut always_match = json!({
        "browserName": "chrome",
        "acceptInsecureCerts": true,
        "goog:chromeOptions": {
            "args": args,
            "excludeSwitches": ["enable-automation"]
        }
    });
    if let Some((route, _)) = proxy {
        always_match["proxy"] = json!({
            "proxyType": "manual",
            "httpProxy": route.endpoint,
            "sslProxy": route.endpoint,
        });
    }

    json!({ "capabilities": { "alwaysMatch": always_match } })
}

/// A complete proxy split into the `host:port` the browser dials and the
/// credentials answered on its auth challenge.
struct ProxyRoute {
    endpoint: String,
    username: String,
    password: SecretString,
}

impl ProxyRoute {
    fn from_config(proxy: &ProxyConfig) -> Option<Self> {
        let raw = if proxy.server.contains("://") {
            proxy.server.clone()
        } else {
            format!("http://{}", proxy.server)
        };
        let url = match Url::parse(&raw) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "unparseable proxy server, continuing without proxy");
                return None;
            }
        };
        let Some(host) = url.host_str() else {
            warn!("proxy server has no host, continuing without proxy");
            return None;
        };
        let port = url.port_or_known_default().unwrap_or(80);
        Some(Self {
            endpoint: format!("{host}:{port}"),
            username: proxy.username.clone(),
            password: proxy.password.clone(),
        })
    }

    /// Service worker answering proxy auth challenges, leaving site challenges alone.
    fn auth_script(&self) -> String {
        let credentials = json!({
            "username": self.username,
            "password": self.password.expose(),
        });
        format!(
            r#"const credentials = {credentials};

chrome.webRequest.onAuthRequired.addListener(
  (details) => (details.isProxy ? {{ authCredentials: credentials }} : {{}}),
  {{ urls: ["<all_urls>"] }},
  ["blocking"]
);
"#
        )
    }
}

fn auth_manifest() -> Value {
    json!({
        "manifest_version": 3,
        "name": "proxy-auth",
        "version": "1.0.0",
        "permissions": ["webRequest", "webRequestAuthProvider"],
        "host_permissions": ["<all_urls>"],
        "background": { "service_worker": "background.js" }
    })
}

/// Write the proxy auth extension to a fresh temp directory.
async fn write_auth_extension(route: &ProxyRoute) -> ScrapeResult<PathBuf> {
    let dir = std::env::temp_dir().join(format!("company-intel-proxy-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir).await?;
    let written = async {
        fs::write(dir.join("manifest.json"), auth_manifest().to_string()).await?;
        fs::write(dir.join("background.js"), route.auth_script()).await
    }
    .await;
    if let Err(e) = written {
        remove_extension(Some(&dir)).await;
        return Err(e.into());
    }
    Ok(dir)
}

async fn remove_extension(dir: Option<&Path>) {
    let Some(dir) = dir else {
        return;
    };
    if let Err(e) = fs::remove_dir_all(dir).await {
        debug!(path = %dir.display(), error = %e, "failed to remove proxy extension");
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(proxy: Option<ProxyConfig>) -> ContextOptions {
        ContextOptions {
            user_agent: "TestAgent/1.0".to_string(),
            headless: true,
            proxy,
        }
    }

    fn proxy() -> ProxyConfig {
        ProxyConfig {
            server: "proxy.example:3128".to_string(),
            username: "user".to_string(),
            password: SecretString::new("p@ss\"word"),
        }
    }

    #[test]
    fn test_capabilities_carry_user_agent() {
        let caps = capabilities(&options(None), None);
        let args = caps
            .pointer("/capabilities/alwaysMatch/goog:chromeOptions/args")
            .and_then(|v| v.as_array())
            .unwrap();
        assert!(args.iter().any(|a| a == "--user-agent=TestAgent/1.0"));
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(!args.iter().any(|a| a.as_str().unwrap().starts_with("--load-extension")));
        assert!(caps.pointer("/capabilities/alwaysMatch/proxy").is_none());
    }

    #[test]
    fn test_proxy_endpoint_carries_no_credentials() {
        let route = ProxyRoute::from_config(&proxy()).unwrap();
        let extension = Path::new("/tmp/company-intel-proxy-test");
        let caps = capabilities(&options(Some(proxy())), Some((&route, extension)));

        for key in ["httpProxy", "sslProxy"] {
            assert_eq!(
                caps.pointer(&format!("/capabilities/alwaysMatch/proxy/{key}"))
                    .and_then(|v| v.as_str()),
                Some("proxy.example:3128")
            );
        }
        let args = caps
            .pointer("/capabilities/alwaysMatch/goog:chromeOptions/args")
            .and_then(|v| v.as_array())
            .unwrap();
        assert!(args
            .iter()
            .any(|a| a == "--load-extension=/tmp/company-intel-proxy-test"));
    }

    #[test]
    fn test_proxy_route_defaults_port_from_scheme() {
        let mut config = proxy();
        config.server = "https://proxy.example".to_string();
        assert_eq!(ProxyRoute::from_config(&config).unwrap().endpoint, "proxy.example:443");

        config.server = "http://".to_string();
        assert!(ProxyRoute::from_config(&config).is_none());
    }

    #[test]
    fn test_closed_context_is_not_ended_again_by_browser() {
        let sessions = OpenSessions::default();
        sessions.insert("a", None);
        sessions.insert("b", Some(PathBuf::from("/tmp/ext-b")));

        assert_eq!(sessions.remove("b"), Some(PathBuf::from("/tmp/ext-b")));
        assert_eq!(sessions.remove("b"), None);
        assert_eq!(sessions.drain(), vec![("a".to_string(), None)]);
        assert!(sessions.drain().is_empty());
    }

    #[tokio::test]
    async fn test_auth_extension_answers_proxy_challenges() {
        let route = ProxyRoute::from_config(&proxy()).unwrap();
        let dir = write_auth_extension(&route).await.unwrap();

        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["manifest_version"], 3);
        assert_eq!(manifest["background"]["service_worker"], "background.js");
        let permissions = manifest["permissions"].as_array().unwrap();
        assert!(permissions.iter().any(|p| p == "webRequestAuthProvider"));

        let script = std::fs::read_to_string(dir.join("background.js")).unwrap();
        assert!(script.contains(r#""password":"p@ss\"word""#));
        assert!(script.contains("details.isProxy"));

        remove_extension(Some(&dir)).await;
        assert!(!dir.exists());
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdefghij", 4), "abcd...");
    }
}
