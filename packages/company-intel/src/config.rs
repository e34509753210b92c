//! Configuration loaded from environment variables.
//!
//! Every sub-config has a `Default` so tests and embedders can build one
//! without touching the environment; [`Config::from_env`] layers environment
//! values on top.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::warn;

use crate::error::ConfigError;
use crate::security::{SecretString, SiteCredentials};

/// Desktop user agent presented by every browser context.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Session log rotation threshold (5 MiB).
pub const SESSION_LOG_ROTATE_BYTES: u64 = 5 * 1024 * 1024;

/// Results at or above this many serialized bytes are off-loaded (1 MiB).
pub const RESULT_OFFLOAD_BYTES: usize = 1024 * 1024;

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub session: SessionConfig,
    pub credentials: Option<SiteCredentials>,
    pub tasks: TaskManagerConfig,
    pub log: LogConfig,
    pub verify: VerifyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut session = SessionConfig::default();
        if let Some(base_url) = var("TRADE_SITE_URL") {
            session.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(endpoint) = var("WEBDRIVER_URL") {
            session.webdriver_url = endpoint;
        }
        if let Some(headless) = var("WEBDRIVER_HEADLESS") {
            session.headless = parse_bool("WEBDRIVER_HEADLESS", &headless)?;
        }
        session.proxy = ProxyConfig::resolve(
            var("PROXY_SERVER"),
            var("PROXY_USERNAME"),
            var("PROXY_PASSWORD"),
        );

        let credentials = match (var("TRADE_EMAIL"), var("TRADE_PASSWORD")) {
            (Some(email), Some(password)) => Some(SiteCredentials::new(email, password)),
            _ => None,
        };

        let mut tasks = TaskManagerConfig::default();
        if let Some(dir) = var("TASK_DIR") {
            tasks.task_dir = PathBuf::from(dir);
        }

        let mut log = LogConfig::default();
        if let Some(path) = var("LOG_FILE") {
            log.file = Some(PathBuf::from(path));
        }
        session.log_file = log.file.clone();

        let mut verify = VerifyConfig {
            tavily_api_key: var("TAVILY_API_KEY").map(SecretString::new),
            llm_api_key: var("LLM_API_KEY").map(SecretString::new),
            ..VerifyConfig::default()
        };
        if let Some(base_url) = var("LLM_BASE_URL") {
            verify.llm_base_url = base_url;
        }
        if let Some(model) = var("LLM_MODEL") {
            verify.llm_model = model;
        }

        Ok(Self {
            session,
            credentials,
            tasks,
            log,
            verify,
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

/// Upstream proxy for the browser context.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub server: String,
    pub username: String,
    pub password: SecretString,
}

impl ProxyConfig {
    /// Build a proxy only when server, username and password are all present.
    ///
    /// Anything less is treated as "no proxy" and logged.
    pub fn resolve(
        server: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Option<Self> {
        match (server, username, password) {
            (Some(server), Some(username), Some(password)) => Some(Self {
                server,
                username,
                password: SecretString::new(password),
            }),
            (None, None, None) => None,
            (server, username, password) => {
                warn!(
                    has_server = server.is_some(),
                    has_username = username.is_some(),
                    has_password = password.is_some(),
                    "incomplete proxy configuration, continuing without proxy"
                );
                None
            }
        }
    }
}

/// Authenticated scrape session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Trade-data site origin, without trailing slash.
    pub base_url: String,
    pub login_path: String,
    /// Page only reachable when logged in; used for session checks.
    pub landing_path: String,
    /// Result page templates; `{company}` is replaced by the percent-encoded name.
    pub buyer_path: String,
    pub supplier_path: String,

    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub proxy: Option<ProxyConfig>,

    pub navigation_timeout: Duration,
    pub network_idle_timeout: Duration,
    /// Extra wait after network idle for client-side rendering.
    pub settle_delay: Duration,
    /// Wait after submitting the login form.
    pub login_settle_delay: Duration,

    /// Title fragments of the site's bot-protection wall.
    pub bot_challenge_titles: Vec<String>,
    /// Title fragments that confirm an authenticated page.
    pub authenticated_titles: Vec<String>,
    /// Page text that means we are still looking at a login prompt.
    pub login_prompt_texts: Vec<String>,

    pub log_file: Option<PathBuf>,
    pub log_rotate_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.importyeti.com".to_string(),
            login_path: "/login".to_string(),
            landing_path: "/dashboard".to_string(),
            buyer_path: "/company/{company}/buyers".to_string(),
            supplier_path: "/company/{company}/suppliers".to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            user_agent: DESKTOP_USER_AGENT.to_string(),
            proxy: None,
            navigation_timeout: Duration::from_secs(60),
            network_idle_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(3),
            login_settle_delay: Duration::from_secs(5),
            bot_challenge_titles: strings(&[
                "Attention Required",
                "Just a moment",
                "Access denied",
                "Security check",
                "Verify you are human",
            ]),
            authenticated_titles: strings(&["Dashboard", "My Account", "Saved Searches"]),
            login_prompt_texts: strings(&["Log in", "Sign in", "Forgot password"]),
            log_file: None,
            log_rotate_bytes: SESSION_LOG_ROTATE_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Zero out the fixed waits, for tests against a fake site.
    pub fn without_delays(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self.login_settle_delay = Duration::ZERO;
        self.network_idle_timeout = Duration::from_millis(50);
        self
    }

    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_path)
    }

    pub fn landing_url(&self) -> String {
        format!("{}{}", self.base_url, self.landing_path)
    }

    pub fn buyer_url(&self, company_name: &str) -> String {
        self.result_url(&self.buyer_path, company_name)
    }

    pub fn supplier_url(&self, company_name: &str) -> String {
        self.result_url(&self.supplier_path, company_name)
    }

    fn result_url(&self, template: &str, company_name: &str) -> String {
        let encoded = urlencoding::encode(company_name.trim());
        format!(
            "{}{}",
            self.base_url,
            template.replace("{company}", encoded.as_ref())
        )
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Task manager and store settings.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub task_dir: PathBuf,
    /// Watchdog deadline measured from dispatch.
    pub timeout: Duration,
    /// Records older than this are removed by cleanup.
    pub retention: Duration,
    pub offload_threshold: usize,
    /// Pause between creating a task and moving it to RUNNING.
    pub dispatch_delay: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            task_dir: PathBuf::from("./data/tasks"),
            timeout: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            offload_threshold: RESULT_OFFLOAD_BYTES,
            dispatch_delay: Duration::ZERO,
        }
    }
}

impl TaskManagerConfig {
    pub fn with_task_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info,company_intel=debug".to_string(),
            file: Some(PathBuf::from("./logs/company-intel.log")),
        }
    }
}

/// LinkedIn verification collaborators.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub tavily_api_key: Option<SecretString>,
    pub llm_api_key: Option<SecretString>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub search_limit: usize,
    pub fetch_retries: usize,
    pub fetch_timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tavily_api_key: None,
            llm_api_key: None,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            search_limit: 10,
            fetch_retries: 2,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_proxy_is_used() {
        let proxy = ProxyConfig::resolve(
            Some("http://proxy.local:8080".into()),
            Some("user".into()),
            Some("pass".into()),
        )
        .unwrap();
        assert_eq!(proxy.server, "http://proxy.local:8080");
        assert_eq!(proxy.password.expose(), "pass");
    }

    #[test]
    fn test_partial_proxy_means_no_proxy() {
        assert!(ProxyConfig::resolve(Some("http://proxy.local:8080".into()), None, None).is_none());
        assert!(ProxyConfig::resolve(None, Some("user".into()), Some("pass".into())).is_none());
        assert!(ProxyConfig::resolve(None, None, None).is_none());
    }

    #[test]
    fn test_result_urls_percent_encode_company() {
        let config = SessionConfig::default().with_base_url("https://trade.example/");
        assert_eq!(
            config.buyer_url("Acme & Sons Inc"),
            "https://trade.example/company/Acme%20%26%20Sons%20Inc/buyers"
        );
        assert_eq!(
            config.supplier_url(" Widgets/Co "),
            "https://trade.example/company/Widgets%2FCo/suppliers"
        );
        assert_eq!(config.login_url(), "https://trade.example/login");
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_task_defaults() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.retention, Duration::from_secs(604_800));
        assert_eq!(config.offload_threshold, 1_048_576);
    }
}
