//! Task model for background scrape jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Which trade-data job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BuyerData,
    SupplierData,
    /// Buyers then suppliers, sequentially on one session.
    Both,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BuyerData => "buyer_data",
            TaskType::SupplierData => "supplier_data",
            TaskType::Both => "both",
        }
    }

    /// Typical wall-clock duration, used for remaining-time estimates.
    pub fn typical_seconds(&self) -> u64 {
        match self {
            TaskType::BuyerData | TaskType::SupplierData => 120,
            TaskType::Both => 240,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "buyer_data" | "buyer" | "buyers" => Ok(TaskType::BuyerData),
            "supplier_data" | "supplier" | "suppliers" => Ok(TaskType::SupplierData),
            "both" | "all" => Ok(TaskType::Both),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    /// Terminal states are sticky: a task in one is never dispatched or
    /// rewritten again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Result payload
// ============================================================================

/// Pointer to a result payload stored in the `<id>_result` companion file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultReference {
    pub reference: String,
    pub timestamp: DateTime<Utc>,
}

/// A completed task's result as persisted in the primary record.
///
/// A reference is written as `{"$offloaded": {reference, timestamp}}`, so an
/// inline payload that happens to carry `reference` and `timestamp` keys
/// stays inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredResult {
    #[serde(with = "offloaded")]
    Reference(ResultReference),
    Inline(Value),
}

mod offloaded {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ResultReference;

    #[derive(Serialize)]
    struct MarkerRef<'a> {
        #[serde(rename = "$offloaded")]
        offloaded: &'a ResultReference,
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Marker {
        #[serde(rename = "$offloaded")]
        offloaded: ResultReference,
    }

    pub fn serialize<S: Serializer>(pointer: &ResultReference, s: S) -> Result<S::Ok, S::Error> {
        MarkerRef { offloaded: pointer }.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ResultReference, D::Error> {
        Marker::deserialize(d).map(|m| m.offloaded)
    }
}

impl StoredResult {
    pub fn is_reference(&self) -> bool {
        matches!(self, StoredResult::Reference(_))
    }
}

// ============================================================================
// Task Model
// ============================================================================

/// Durable record of one background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Opaque job payload (company name and similar).
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(task_type: TaskType, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            params,
            created_at: now,
            updated_at: now,
            progress: 0,
            result: None,
            error: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.touch();
    }

    /// Raise progress; never lowers it and caps at 100.
    pub(crate) fn advance_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if progress <= self.progress {
            return false;
        }
        self.progress = progress;
        self.touch();
        true
    }

    /// Partial result written while still RUNNING.
    pub(crate) fn store_result(&mut self, result: Value) {
        self.result = Some(StoredResult::Inline(result));
        self.touch();
    }

    /// Completion keeps an existing result when the handler returns none.
    pub(crate) fn mark_completed(&mut self, result: Option<Value>) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        if let Some(value) = result {
            self.result = Some(StoredResult::Inline(value));
        }
        self.error = None;
        self.touch();
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.touch();
    }

    pub(crate) fn mark_timed_out(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Timeout;
        self.error = Some(error.into());
        self.result = None;
        self.touch();
    }

    /// `params.companyName` (or `company_name`), if present.
    pub fn company_name(&self) -> Option<&str> {
        self.params
            .get("companyName")
            .or_else(|| self.params.get("company_name"))
            .and_then(|v| v.as_str())
    }
}
