//! Typed errors for the company-intel library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match on
//! the failure class: the task manager records any of these as a FAILED
//! message, the scrape session decides between abort, retry and degrade.

use thiserror::Error;
use uuid::Uuid;

use crate::semaphore::GateClosed;
use crate::tasks::TaskType;

/// Errors raised by the authenticated scrape session and its browser driver.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The site served its automated-traffic wall. Never retried.
    #[error("bot challenge detected at {url} (title: {title:?})")]
    BotChallenge { url: String, title: String },

    /// Login completed but the authenticated page did not confirm it.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The session check was redirected back to the login surface.
    #[error("session invalidated: redirected to login")]
    SessionInvalidated,

    /// `init` was never called, so there is nothing to log in with.
    #[error("scrape session has no credentials; call init first")]
    MissingCredentials,

    /// The browser could not be started or reached.
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// A WebDriver command returned an error payload.
    #[error("webdriver {command} failed: {message}")]
    Driver { command: String, message: String },

    /// Transport failure talking to the driver.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A page operation exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Local file handling failed (session log, proxy auth extension).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScrapeError {
    pub(crate) fn driver(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Errors that must abort the whole operation chain instead of degrading
    /// to a partial record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScrapeError::BotChallenge { .. }
                | ScrapeError::LoginFailed(_)
                | ScrapeError::SessionInvalidated
                | ScrapeError::MissingCredentials
        )
    }

    pub fn is_session_invalidated(&self) -> bool {
        matches!(self, ScrapeError::SessionInvalidated)
    }
}

impl From<GateClosed> for ScrapeError {
    fn from(err: GateClosed) -> Self {
        ScrapeError::BrowserUnavailable(err.to_string())
    }
}

/// Errors from the file-backed task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("off-loaded result missing for task {0}")]
    MissingResult(Uuid),
}

/// Errors from the task manager.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("no handler registered for task type {0}")]
    NoHandler(TaskType),

    #[error("invalid task params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),

    /// A handler finished without producing anything usable.
    #[error("{0}")]
    Handler(String),
}

/// Any error the library can produce, for callers that wire the whole stack.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("task error: {0}")]
    Task(#[from] TaskError),

    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the LinkedIn verification collaborators.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("search failed: {0}")]
    Search(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Gate(#[from] GateClosed),
}

/// Errors loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Result type alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for scrape operations.
pub type ScrapeResult<T> = std::result::Result<T, ScrapeError>;

/// Result type alias for task store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for task manager operations.
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Result type alias for verification operations.
pub type VerifyResult<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let challenge = ScrapeError::BotChallenge {
            url: "https://example.com/login".into(),
            title: "Attention Required! | Cloudflare".into(),
        };
        assert!(challenge.is_fatal());
        assert!(ScrapeError::SessionInvalidated.is_fatal());
        assert!(ScrapeError::SessionInvalidated.is_session_invalidated());
        assert!(!ScrapeError::driver("title", "no such window").is_fatal());
        assert!(!ScrapeError::Timeout("network idle".into()).is_fatal());
    }

    #[test]
    fn test_handler_error_message_is_verbatim() {
        let err = TaskError::Handler("no data retrieved".into());
        assert_eq!(err.to_string(), "no data retrieved");
    }
}
