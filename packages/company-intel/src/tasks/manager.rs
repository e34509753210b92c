//! Task lifecycle: creation, background dispatch, watchdog and status reads.
//!
//! # Architecture
//!
//! ```text
//! create_task
//!     │
//!     ├─► persist PENDING record (TaskStore)
//!     └─► spawn dispatch
//!             ├─► PENDING → RUNNING
//!             ├─► spawn handler ─────────────┐
//!             ├─► spawn watchdog (deadline)  │
//!             └─► await handler ◄────────────┘
//!                     ├─► Ok   → COMPLETED (FAILED if no result at all)
//!                     └─► Err  → FAILED
//!                 watchdog fires first → TIMEOUT, handler aborted
//! ```
//!
//! Every write goes through [`TaskManager::transition`], which re-reads the
//! record under a store-wide lock and refuses to touch a task that is already
//! terminal. Completion and the watchdog can race freely; whichever commits
//! first wins and the loser is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TaskManagerConfig;
use crate::error::{TaskError, TaskResult};
use crate::tasks::handlers::TaskHandler;
use crate::tasks::store::TaskStore;
use crate::tasks::task::{Task, TaskStatus, TaskType};

/// Error recorded when the watchdog wins.
pub const TIMEOUT_MESSAGE: &str = "task execution timed out";

/// Error recorded for work left behind by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Error recorded when a handler finishes without returning or storing a result.
pub const NO_RESULT_MESSAGE: &str = "task finished without producing a result";

const EVENT_CAPACITY: usize = 64;

/// A persisted change to a task, published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            updated_at: task.updated_at,
        }
    }
}

/// Maps task types to the handler that executes them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type, handler);
        self
    }

    /// Register one handler for every task type.
    pub fn register_all(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        for task_type in [TaskType::BuyerData, TaskType::SupplierData, TaskType::Both] {
            self.register(task_type, handler.clone());
        }
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn is_registered(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }
}

struct Inner {
    store: TaskStore,
    handlers: HandlerRegistry,
    config: TaskManagerConfig,
    /// Serializes every read-modify-write of a task record.
    write_lock: Mutex<()>,
    events: broadcast::Sender<TaskEvent>,
}

/// Creates tasks and drives them through their lifecycle.
///
/// Cheap to clone; clones share the same store, lock and event channel.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, handlers: HandlerRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store: TaskStore::new(config.task_dir.clone(), config.offload_threshold),
                handlers,
                config,
                write_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.inner.config
    }

    /// Receive every persisted task change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Persist a PENDING task and schedule it in the background.
    ///
    /// Returns the record as created; the caller never waits on the job.
    pub async fn create_task(&self, task_type: TaskType, params: Value) -> TaskResult<Task> {
        if !self.inner.handlers.is_registered(task_type) {
            return Err(TaskError::NoHandler(task_type));
        }

        let task = self.inner.store.save(&Task::new(task_type, params)).await?;
        info!(task_id = %task.id, task_type = %task_type, "task created");
        self.publish(&task);

        let manager = self.clone();
        let task_id = task.id;
        tokio::spawn(async move { manager.dispatch(task_id).await });

        Ok(task)
    }

    /// Current persisted record, or `None` if no such task exists.
    pub async fn get_task_status(&self, id: Uuid) -> TaskResult<Option<Task>> {
        Ok(self.inner.store.load(id).await?)
    }

    /// Resolve a task's result, reading an off-loaded payload if needed.
    pub async fn load_result(&self, task: &Task) -> TaskResult<Option<Value>> {
        Ok(self.inner.store.load_result(task).await?)
    }

    /// Delete task files older than the retention window.
    pub async fn cleanup_tasks(&self) -> TaskResult<usize> {
        let removed = self.inner.store.cleanup(self.inner.config.retention).await?;
        info!(removed, "task cleanup finished");
        Ok(removed)
    }

    /// Fail every task a previous process left PENDING or RUNNING.
    ///
    /// Call once at startup, before creating new tasks.
    pub async fn recover(&self) -> TaskResult<usize> {
        let mut recovered = 0;
        for task in self.inner.store.list().await? {
            if task.status.is_terminal() {
                continue;
            }
            let updated = self
                .transition(task.id, |t| {
                    t.mark_failed(INTERRUPTED_MESSAGE);
                    true
                })
                .await?;
            if updated.is_some() {
                warn!(task_id = %task.id, status = %task.status, "recovered interrupted task");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Apply `update` to the persisted record under the write lock.
    ///
    /// Returns `Ok(None)` without writing when the task is already terminal
    /// or `update` reports no change. Otherwise returns the saved record.
    pub(crate) async fn transition<F>(&self, id: Uuid, update: F) -> TaskResult<Option<Task>>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let _guard = self.inner.write_lock.lock().await;

        let mut task = self
            .inner
            .store
            .load(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "task already terminal, skipping write");
            return Ok(None);
        }
        if !update(&mut task) {
            return Ok(None);
        }

        let saved = self.inner.store.save(&task).await?;
        self.publish(&saved);
        Ok(Some(saved))
    }

    fn publish(&self, task: &Task) {
        // No subscribers is fine.
        let _ = self.inner.events.send(TaskEvent::from(task));
    }

    async fn dispatch(self, id: Uuid) {
        let delay = self.inner.config.dispatch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let task = match self
            .transition(id, |t| {
                if t.status != TaskStatus::Pending {
                    return false;
                }
                t.mark_running();
                true
            })
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %id, "task no longer pending, not dispatching");
                return;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to start task");
                return;
            }
        };
        info!(task_id = %id, task_type = %task.task_type, "task running");

        let Some(handler) = self.inner.handlers.get(task.task_type) else {
            let message = TaskError::NoHandler(task.task_type).to_string();
            self.finish_failed(id, message).await;
            return;
        };

        let reporter = ProgressReporter::attached(id, self.clone());
        let mut handle = tokio::spawn(async move { handler.run(&task, &reporter).await });

        let watchdog = CancellationToken::new();
        self.spawn_watchdog(id, handle.abort_handle(), watchdog.clone());

        let outcome = (&mut handle).await;
        watchdog.cancel();

        match outcome {
            Ok(Ok(result)) => {
                // Merge with the record: a result stored mid-run survives.
                match self
                    .transition(id, |t| {
                        if result.is_none() && t.result.is_none() {
                            t.mark_failed(NO_RESULT_MESSAGE);
                        } else {
                            t.mark_completed(result);
                        }
                        true
                    })
                    .await
                {
                    Ok(Some(task)) if task.status == TaskStatus::Failed => {
                        warn!(task_id = %id, "task finished without a result");
                    }
                    Ok(Some(_)) => info!(task_id = %id, "task completed"),
                    Ok(None) => debug!(task_id = %id, "completion lost to an earlier terminal write"),
                    Err(e) => error!(task_id = %id, error = %e, "failed to record task completion"),
                }
            }
            Ok(Err(e)) => {
                error!(task_id = %id, error = %e, "task failed");
                self.finish_failed(id, e.to_string()).await;
            }
            // Aborted by the watchdog, which already wrote TIMEOUT.
            Err(join) if join.is_cancelled() => {
                debug!(task_id = %id, "task handler aborted");
            }
            Err(join) => {
                error!(task_id = %id, error = %join, "task handler panicked");
                self.finish_failed(id, format!("task handler panicked: {join}"))
                    .await;
            }
        }
    }

    fn spawn_watchdog(&self, id: Uuid, handler: tokio::task::AbortHandle, cancel: CancellationToken) {
        let manager = self.clone();
        let deadline = self.inner.config.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    match manager
                        .transition(id, |t| {
                            t.mark_timed_out(TIMEOUT_MESSAGE);
                            true
                        })
                        .await
                    {
                        Ok(Some(_)) => {
                            warn!(task_id = %id, timeout_secs = deadline.as_secs(), "task timed out");
                            handler.abort();
                        }
                        Ok(None) => debug!(task_id = %id, "watchdog fired after terminal state"),
                        Err(e) => error!(task_id = %id, error = %e, "failed to record task timeout"),
                    }
                }
            }
        });
    }

    async fn finish_failed(&self, id: Uuid, message: String) {
        let result = self
            .transition(id, |t| {
                t.mark_failed(message);
                true
            })
            .await;
        if let Err(e) = result {
            error!(task_id = %id, error = %e, "failed to record task failure");
        }
    }
}

/// Progress and partial-result sink handed to a running handler.
///
/// A detached reporter accepts every call and records nothing.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    manager: Option<TaskManager>,
}

impl ProgressReporter {
    pub(crate) fn attached(task_id: Uuid, manager: TaskManager) -> Self {
        Self {
            task_id,
            manager: Some(manager),
        }
    }

    pub fn detached(task_id: Uuid) -> Self {
        Self {
            task_id,
            manager: None,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Record a progress checkpoint. Lower values than the current one and
    /// writes after the task left RUNNING are ignored.
    pub async fn report(&self, progress: u8) {
        let Some(manager) = &self.manager else {
            return;
        };
        let result = manager
            .transition(self.task_id, |t| {
                t.status == TaskStatus::Running && t.advance_progress(progress)
            })
            .await;
        match result {
            Ok(Some(task)) => debug!(task_id = %self.task_id, progress = task.progress, "task progress"),
            Ok(None) => {}
            Err(e) => warn!(task_id = %self.task_id, error = %e, "failed to record task progress"),
        }
    }

    /// Persist a result before the handler returns, replacing any earlier one.
    ///
    /// Oversized payloads are off-loaded like a final result. Ignored once the
    /// task has left RUNNING. Returns whether the result was written.
    pub async fn store_result(&self, result: Value) -> bool {
        let Some(manager) = &self.manager else {
            return false;
        };
        let written = manager
            .transition(self.task_id, |t| {
                if t.status != TaskStatus::Running {
                    return false;
                }
                t.store_result(result);
                true
            })
            .await;
        match written {
            Ok(Some(_)) => {
                debug!(task_id = %self.task_id, "partial task result stored");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "failed to store task result");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedHandler;
    use serde_json::json;
    use std::time::Duration;

    fn manager(dir: &std::path::Path, handler: ScriptedHandler) -> TaskManager {
        let mut registry = HandlerRegistry::new();
        registry.register_all(Arc::new(handler));
        TaskManager::new(
            TaskManagerConfig::default()
                .with_task_dir(dir)
                .with_timeout(Duration::from_secs(5)),
            registry,
        )
    }

    #[tokio::test]
    async fn test_unregistered_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TaskManager::new(
            TaskManagerConfig::default().with_task_dir(dir.path()),
            HandlerRegistry::new(),
        );

        let err = manager
            .create_task(TaskType::BuyerData, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NoHandler(TaskType::BuyerData)));
    }

    #[tokio::test]
    async fn test_transition_refuses_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedHandler::succeeding(json!({"ok": true})));

        let mut task = Task::new(TaskType::BuyerData, json!({}));
        task.mark_running();
        task.mark_completed(Some(json!({"buyers": []})));
        manager.store().save(&task).await.unwrap();

        let written = manager
            .transition(task.id, |t| {
                t.mark_timed_out(TIMEOUT_MESSAGE);
                true
            })
            .await
            .unwrap();
        assert!(written.is_none());

        let stored = manager.get_task_status(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_transition_on_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedHandler::succeeding(json!({})));

        let missing = Uuid::new_v4();
        let err = manager.transition(missing, |_| true).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedHandler::succeeding(json!({})));

        let pending = Task::new(TaskType::BuyerData, json!({}));
        let mut running = Task::new(TaskType::SupplierData, json!({}));
        running.mark_running();
        let mut done = Task::new(TaskType::Both, json!({}));
        done.mark_completed(Some(json!({"ok": true})));
        for task in [&pending, &running, &done] {
            manager.store().save(task).await.unwrap();
        }

        assert_eq!(manager.recover().await.unwrap(), 2);

        for id in [pending.id, running.id] {
            let task = manager.get_task_status(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        }
        let task = manager.get_task_status(done.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_detached_reporter_is_a_no_op() {
        let reporter = ProgressReporter::detached(Uuid::new_v4());
        reporter.report(50).await;
        assert!(!reporter.store_result(json!({"buyers": []})).await);
    }

    #[tokio::test]
    async fn test_stored_result_is_refused_after_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedHandler::succeeding(json!({})));

        let mut task = Task::new(TaskType::BuyerData, json!({}));
        task.mark_running();
        task.mark_timed_out(TIMEOUT_MESSAGE);
        manager.store().save(&task).await.unwrap();

        let reporter = ProgressReporter::attached(task.id, manager.clone());
        assert!(!reporter.store_result(json!({"late": true})).await);

        let stored = manager.get_task_status(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Timeout);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn test_progress_events_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ScriptedHandler::succeeding(json!({"ok": true})).with_checkpoints(vec![20, 90]);
        let manager = manager(dir.path(), handler);
        let mut events = manager.subscribe();

        let task = manager
            .create_task(TaskType::BuyerData, json!({"companyName": "Acme Inc"}))
            .await
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.task_id, task.id);
            seen.push((event.status, event.progress));
            if event.status.is_terminal() {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                (TaskStatus::Pending, 0),
                (TaskStatus::Running, 0),
                (TaskStatus::Running, 20),
                (TaskStatus::Running, 90),
                (TaskStatus::Completed, 100),
            ]
        );
    }
}
