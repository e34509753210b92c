//! Company intelligence toolkit.
//!
//! Two capabilities behind one boundary:
//!
//! - **Trade data**: buyers and suppliers of a company, scraped from an
//!   authenticated, bot-protected trade-data site through a real browser.
//!   Scrapes are slow, so they run as durable background tasks that callers
//!   create and then poll.
//! - **LinkedIn verification**: does a company have an official LinkedIn
//!   company page? Search, fetch and score candidates in one call.
//!
//! # Usage
//!
//! ```rust,ignore
//! use company_intel::{CompanyIntelTools, Config, TaskType};
//!
//! let config = Config::from_env()?;
//! company_intel::logging::init(&config.log)?;
//!
//! let tools = CompanyIntelTools::from_config(&config).await?;
//! let task = tools.create_task("Acme Inc", TaskType::Both).await?;
//!
//! // later
//! let status = tools.get_task_status(task.task_id).await?;
//! ```
//!
//! # Modules
//!
//! - [`scrape`] - Browser abstraction, WebDriver backend, login session and
//!   result-page extraction
//! - [`tasks`] - Task records, file store, manager with watchdog, handlers
//! - [`verify`] - LinkedIn search, page fetch and match scoring
//! - [`semaphore`] - FIFO admission gate bounding concurrent page work
//! - [`tools`] - The operations exposed to the dispatch shell
//! - [`testing`] - Mock site, scripted handler and verification mocks

pub mod config;
pub mod error;
pub mod logging;
pub mod scrape;
pub mod security;
pub mod semaphore;
pub mod tasks;
pub mod testing;
pub mod tools;
pub mod verify;

// Re-export core types at crate root
pub use config::{
    Config, LogConfig, ProxyConfig, SessionConfig, TaskManagerConfig, VerifyConfig,
};
pub use error::{
    ConfigError, Error, Result, ScrapeError, StoreError, TaskError, VerifyError,
};
pub use scrape::{CompanyRecord, CrawlKind, CrawlOutcome, PageExtraction, ScrapeSession};
pub use security::{SecretString, SiteCredentials};
pub use semaphore::{AdmissionGate, GatePermit};
pub use tasks::{Task, TaskManager, TaskStatus, TaskType};
pub use tools::{CompanyIntelTools, TaskDescriptor, TaskStatusView};
pub use verify::{VerificationReport, VerificationWorkflow};
