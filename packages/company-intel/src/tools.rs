//! Boundary operations for the dispatch shell.
//!
//! Every operation returns a serializable view; task failures show up as a
//! terminal status with a message, never as an error from these calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, TaskError, TaskResult, VerifyError, VerifyResult};
use crate::scrape::{ScrapeSession, WebDriverLauncher};
use crate::tasks::{HandlerRegistry, TaskManager, TaskStatus, TaskType, TradeDataHandler};
use crate::verify::{
    scorer_from_config, HttpPageFetcher, TavilyWebSearcher, VerificationReport,
    VerificationWorkflow,
};

/// Returned by `create_task`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub estimated_seconds: u64,
    pub message: String,
}

/// Returned by `get_task_status`. Which optional fields are set depends on
/// the status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// PENDING and RUNNING only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<u64>,
    /// COMPLETED only; off-loaded payloads are read back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// FAILED and TIMEOUT only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn remaining_seconds(task_type: TaskType, progress: u8) -> u64 {
    let left = 100 - u64::from(progress.min(100));
    task_type.typical_seconds() * left / 100
}

pub struct CompanyIntelTools {
    tasks: TaskManager,
    session: Option<Arc<ScrapeSession>>,
    verifier: Option<VerificationWorkflow>,
}

impl CompanyIntelTools {
    pub fn new(tasks: TaskManager, verifier: Option<VerificationWorkflow>) -> Self {
        Self {
            tasks,
            session: None,
            verifier,
        }
    }

    /// Wire the production stack: WebDriver-backed session, trade-data
    /// handlers, file task store and the verification collaborators.
    ///
    /// Tasks left unfinished by a previous process are failed first.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let launcher = WebDriverLauncher::from_config(&config.session)?;
        let session = Arc::new(ScrapeSession::new(config.session.clone(), Arc::new(launcher)));
        match &config.credentials {
            Some(credentials) => session.init(credentials.clone()).await?,
            None => warn!("no trade site credentials configured; trade-data tasks will fail"),
        }

        let mut registry = HandlerRegistry::new();
        registry.register_all(Arc::new(TradeDataHandler::new(session.clone())));
        let tasks = TaskManager::new(config.tasks.clone(), registry);
        let recovered = tasks.recover().await?;
        if recovered > 0 {
            info!(recovered, "failed tasks interrupted by restart");
        }

        let verifier = match &config.verify.tavily_api_key {
            Some(key) => Some(VerificationWorkflow::new(
                Arc::new(TavilyWebSearcher::new(key.clone())),
                Arc::new(HttpPageFetcher::from_config(&config.verify)?),
                scorer_from_config(&config.verify),
                &config.verify,
            )),
            None => {
                warn!("TAVILY_API_KEY not set; company verification disabled");
                None
            }
        };

        Ok(Self {
            tasks,
            session: Some(session),
            verifier,
        })
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    /// Start a background trade-data job for `company_name`.
    pub async fn create_task(
        &self,
        company_name: &str,
        job_type: TaskType,
    ) -> TaskResult<TaskDescriptor> {
        let company_name = company_name.trim();
        if company_name.is_empty() {
            return Err(TaskError::InvalidParams("company name is required".to_string()));
        }

        let task = self
            .tasks
            .create_task(job_type, json!({ "companyName": company_name }))
            .await?;
        Ok(TaskDescriptor {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            created_at: task.created_at,
            estimated_seconds: job_type.typical_seconds(),
            message: format!(
                "{} task created for {company_name}; poll get_task_status with the task id",
                job_type
            ),
        })
    }

    pub async fn get_task_status(&self, task_id: Uuid) -> TaskResult<TaskStatusView> {
        let task = self
            .tasks
            .get_task_status(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;

        let mut view = TaskStatusView {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            created_at: task.created_at,
            updated_at: task.updated_at,
            estimated_remaining_seconds: None,
            result: None,
            error: None,
        };
        match task.status {
            TaskStatus::Pending | TaskStatus::Running => {
                view.estimated_remaining_seconds =
                    Some(remaining_seconds(task.task_type, task.progress));
            }
            TaskStatus::Completed => {
                view.result = self.tasks.load_result(&task).await?;
            }
            TaskStatus::Failed | TaskStatus::Timeout => {
                view.error = task.error.clone();
            }
        }
        Ok(view)
    }

    /// Check whether `company_name` has an official LinkedIn company page.
    pub async fn verify_company(
        &self,
        company_name: &str,
        official_website: Option<&str>,
    ) -> VerifyResult<VerificationReport> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or(VerifyError::NotConfigured("search API key"))?;
        verifier
            .run(company_name.trim(), official_website.filter(|w| !w.trim().is_empty()))
            .await
    }

    pub async fn cleanup_tasks(&self) -> TaskResult<usize> {
        self.tasks.cleanup_tasks().await
    }

    /// Close the browser, if this instance owns one.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(session) = &self.session {
            session.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_seconds_scales_with_progress() {
        assert_eq!(remaining_seconds(TaskType::BuyerData, 0), 120);
        assert_eq!(remaining_seconds(TaskType::BuyerData, 50), 60);
        assert_eq!(remaining_seconds(TaskType::Both, 90), 24);
        assert_eq!(remaining_seconds(TaskType::Both, 100), 0);
    }
}
