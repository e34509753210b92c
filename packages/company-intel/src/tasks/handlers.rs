//! Task handlers: the work a dispatched task actually performs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{ScrapeError, TaskError, TaskResult};
use crate::scrape::{CrawlKind, CrawlOutcome, ScrapeSession};
use crate::tasks::manager::ProgressReporter;
use crate::tasks::task::{Task, TaskType};

/// Executes one task type.
///
/// Returning `Ok(Some(value))` completes the task with that result.
/// `Ok(None)` completes it with the result already stored through
/// [`ProgressReporter::store_result`], or fails it when there is none. An
/// error fails it with the error's message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task, progress: &ProgressReporter) -> TaskResult<Option<Value>>;
}

/// Crawls buyer and/or supplier pages through the shared scrape session.
pub struct TradeDataHandler {
    session: Arc<ScrapeSession>,
}

impl TradeDataHandler {
    pub fn new(session: Arc<ScrapeSession>) -> Self {
        Self { session }
    }

    async fn crawl(&self, kind: CrawlKind, company: &str) -> TaskResult<Option<CrawlOutcome>> {
        let outcome = self.session.crawl(kind, company).await?;
        match &outcome {
            Some(o) => info!(
                company = %company,
                kind = kind.as_str(),
                companies = o.companies().len(),
                degraded = o.is_degraded(),
                "crawl finished"
            ),
            None => info!(company = %company, kind = kind.as_str(), "crawl returned nothing"),
        }
        Ok(outcome)
    }
}

#[async_trait]
impl TaskHandler for TradeDataHandler {
    async fn run(&self, task: &Task, progress: &ProgressReporter) -> TaskResult<Option<Value>> {
        let company = task
            .company_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TaskError::InvalidParams("companyName is required".to_string()))?
            .to_string();

        if !self.session.has_credentials().await {
            return Err(ScrapeError::MissingCredentials.into());
        }
        progress.report(20).await;

        let (buyers, suppliers) = match task.task_type {
            TaskType::BuyerData => (self.crawl(CrawlKind::Buyers, &company).await?, None),
            TaskType::SupplierData => (None, self.crawl(CrawlKind::Suppliers, &company).await?),
            // Sequential: both crawls share one logged-in context.
            TaskType::Both => {
                let buyers = self.crawl(CrawlKind::Buyers, &company).await?;
                if buyers.is_some() {
                    progress
                        .store_result(trade_result(&company, buyers.as_ref(), None, task.task_type))
                        .await;
                }
                progress.report(50).await;
                let suppliers = self.crawl(CrawlKind::Suppliers, &company).await?;
                (buyers, suppliers)
            }
        };

        if buyers.is_none() && suppliers.is_none() {
            return Err(TaskError::Handler(format!(
                "no {} data retrieved for {company}",
                match task.task_type {
                    TaskType::BuyerData => "buyer",
                    TaskType::SupplierData => "supplier",
                    TaskType::Both => "trade",
                }
            )));
        }
        progress.report(90).await;

        Ok(Some(trade_result(
            &company,
            buyers.as_ref(),
            suppliers.as_ref(),
            task.task_type,
        )))
    }
}

fn trade_result(
    company: &str,
    buyers: Option<&CrawlOutcome>,
    suppliers: Option<&CrawlOutcome>,
    task_type: TaskType,
) -> Value {
    let mut result = json!({
        "companyName": company,
        "retrievedAt": Utc::now(),
    });
    if matches!(task_type, TaskType::BuyerData | TaskType::Both) {
        result["buyers"] = serde_json::to_value(buyers).unwrap_or(Value::Null);
    }
    if matches!(task_type, TaskType::SupplierData | TaskType::Both) {
        result["suppliers"] = serde_json::to_value(suppliers).unwrap_or(Value::Null);
    }
    result
}
