//! Task lifecycle through the boundary tools: creation, dispatch, watchdog,
//! terminal-state stickiness and result off-loading.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use company_intel::tasks::{HandlerRegistry, NO_RESULT_MESSAGE, TIMEOUT_MESSAGE};
use company_intel::testing::ScriptedHandler;
use company_intel::{
    CompanyIntelTools, TaskError, TaskManager, TaskManagerConfig, TaskStatus, TaskStatusView,
    TaskType, VerifyError,
};
use serde_json::json;
use uuid::Uuid;

fn tools(dir: &Path, handler: ScriptedHandler, config: TaskManagerConfig) -> CompanyIntelTools {
    let mut registry = HandlerRegistry::new();
    registry.register_all(Arc::new(handler));
    let manager = TaskManager::new(config.with_task_dir(dir), registry);
    CompanyIntelTools::new(manager, None)
}

fn default_tools(dir: &Path, handler: ScriptedHandler) -> CompanyIntelTools {
    tools(
        dir,
        handler,
        TaskManagerConfig::default().with_timeout(Duration::from_secs(5)),
    )
}

async fn wait_for_terminal(tools: &CompanyIntelTools, id: Uuid) -> TaskStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let view = tools.get_task_status(id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {:?}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_new_task_is_pending_at_zero() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(
        dir.path(),
        ScriptedHandler::succeeding(json!({"ok": true})),
        TaskManagerConfig::default().with_dispatch_delay(Duration::from_millis(300)),
    );

    let created = tools.create_task("Acme Inc", TaskType::Both).await.unwrap();
    assert_eq!(created.status, TaskStatus::Pending);
    assert_eq!(created.estimated_seconds, 240);

    let view = tools.get_task_status(created.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Pending);
    assert_eq!(view.progress, 0);
    assert_eq!(view.estimated_remaining_seconds, Some(240));
    assert!(view.result.is_none());
    assert!(view.error.is_none());
}

#[tokio::test]
async fn test_completed_task_exposes_result() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ScriptedHandler::succeeding(json!({"companyName": "Acme Inc", "buyers": []}))
        .with_checkpoints(vec![20, 90]);
    let tools = default_tools(dir.path(), handler);

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.progress, 100);
    assert_eq!(view.result, Some(json!({"companyName": "Acme Inc", "buyers": []})));
    assert!(view.error.is_none());
    assert!(view.estimated_remaining_seconds.is_none());
}

#[tokio::test]
async fn test_params_carry_company_name_only() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(dir.path(), ScriptedHandler::succeeding(json!({})));

    let created = tools
        .create_task("  Acme Inc  ", TaskType::SupplierData)
        .await
        .unwrap();
    let task = tools
        .task_manager()
        .get_task_status(created.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.params, json!({"companyName": "Acme Inc"}));
}

#[tokio::test]
async fn test_handler_error_fails_task_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(
        dir.path(),
        ScriptedHandler::failing("no buyer data retrieved for Acme Inc"),
    );

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error.as_deref(), Some("no buyer data retrieved for Acme Inc"));
    assert!(view.result.is_none());
}

#[tokio::test]
async fn test_panicking_handler_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(dir.path(), ScriptedHandler::panicking("selector table corrupted"));

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;

    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_watchdog_times_out_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ScriptedHandler::succeeding(json!({"late": true}))
        .with_checkpoints(vec![20])
        .with_delay(Duration::from_secs(10));
    let tools = tools(
        dir.path(),
        handler,
        TaskManagerConfig::default().with_timeout(Duration::from_millis(100)),
    );

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;

    assert_eq!(view.status, TaskStatus::Timeout);
    assert_eq!(view.error.as_deref(), Some(TIMEOUT_MESSAGE));
    assert!(view.result.is_none());
}

#[tokio::test]
async fn test_completion_just_before_deadline_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let handler =
        ScriptedHandler::succeeding(json!({"buyers": []})).with_delay(Duration::from_millis(150));
    let tools = tools(
        dir.path(),
        handler,
        TaskManagerConfig::default().with_timeout(Duration::from_millis(300)),
    );

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);

    // Well past the deadline: a late watchdog must not have rewritten it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let view = tools.get_task_status(created.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert!(view.error.is_none());
    assert_eq!(view.result, Some(json!({"buyers": []})));
}

#[tokio::test]
async fn test_terminal_states_are_sticky_under_racing_deadlines() {
    let dir = tempfile::tempdir().unwrap();
    // Handler durations around the deadline so both sides of the race occur.
    for delay_ms in [0u64, 40, 50, 60, 120] {
        let handler = ScriptedHandler::succeeding(json!({"delay": delay_ms}))
            .with_delay(Duration::from_millis(delay_ms));
        let tools = tools(
            dir.path(),
            handler,
            TaskManagerConfig::default().with_timeout(Duration::from_millis(50)),
        );

        let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
        let first = wait_for_terminal(&tools, created.task_id).await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let again = tools.get_task_status(created.task_id).await.unwrap();
            assert_eq!(again.status, first.status, "delay {delay_ms}ms");
            assert_eq!(again.error, first.error);
            assert_eq!(again.result, first.result);
        }

        match first.status {
            TaskStatus::Completed => {
                assert!(first.error.is_none());
                assert_eq!(first.result, Some(json!({"delay": delay_ms})));
            }
            TaskStatus::Timeout => {
                assert_eq!(first.error.as_deref(), Some(TIMEOUT_MESSAGE));
                assert!(first.result.is_none());
            }
            other => panic!("unexpected terminal status {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_oversized_result_is_offloaded_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let payload = json!({"buyers": "x".repeat(4096)});
    let mut config = TaskManagerConfig::default().with_timeout(Duration::from_secs(5));
    config.offload_threshold = 1024;
    let tools = tools(dir.path(), ScriptedHandler::succeeding(payload.clone()), config);

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.result, Some(payload));

    let manager = tools.task_manager();
    let record = manager
        .get_task_status(created.task_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.result.unwrap().is_reference());
    assert!(manager.store().result_path(created.task_id).exists());
}

#[tokio::test]
async fn test_result_stored_mid_run_survives_completion() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ScriptedHandler::succeeding_without_result()
        .with_checkpoints(vec![20, 50])
        .with_stored_result(json!({"buyers": ["Acme Inc"]}));
    let tools = default_tools(dir.path(), handler);

    let created = tools.create_task("Acme Inc", TaskType::Both).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.progress, 100);
    assert_eq!(view.result, Some(json!({"buyers": ["Acme Inc"]})));
    assert!(view.error.is_none());
}

#[tokio::test]
async fn test_returned_result_replaces_stored_partial() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ScriptedHandler::succeeding(json!({"buyers": [], "suppliers": []}))
        .with_stored_result(json!({"buyers": []}));
    let tools = default_tools(dir.path(), handler);

    let created = tools.create_task("Acme Inc", TaskType::Both).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.result, Some(json!({"buyers": [], "suppliers": []})));
}

#[tokio::test]
async fn test_offloaded_partial_result_survives_completion() {
    let dir = tempfile::tempdir().unwrap();
    let payload = json!({"buyers": "x".repeat(4096)});
    let handler = ScriptedHandler::succeeding_without_result().with_stored_result(payload.clone());
    let mut config = TaskManagerConfig::default().with_timeout(Duration::from_secs(5));
    config.offload_threshold = 1024;
    let tools = tools(dir.path(), handler, config);

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.result, Some(payload));
}

#[tokio::test]
async fn test_completion_without_any_result_fails() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(dir.path(), ScriptedHandler::succeeding_without_result());

    let created = tools.create_task("Acme Inc", TaskType::BuyerData).await.unwrap();
    let view = wait_for_terminal(&tools, created.task_id).await;
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error.as_deref(), Some(NO_RESULT_MESSAGE));
    assert!(view.result.is_none());
}

#[tokio::test]
async fn test_blank_company_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ScriptedHandler::succeeding(json!({}));
    let tools = default_tools(dir.path(), handler.clone());

    let err = tools.create_task("   ", TaskType::Both).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));
    assert_eq!(handler.runs(), 0);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(dir.path(), ScriptedHandler::succeeding(json!({})));

    let id = Uuid::new_v4();
    let err = tools.get_task_status(id).await.unwrap_err();
    assert!(matches!(err, TaskError::NotFound(missing) if missing == id));
}

#[tokio::test]
async fn test_verification_unavailable_without_search_backend() {
    let dir = tempfile::tempdir().unwrap();
    let tools = default_tools(dir.path(), ScriptedHandler::succeeding(json!({})));

    let err = tools.verify_company("Acme Inc", None).await.unwrap_err();
    assert!(matches!(err, VerifyError::NotConfigured(_)));
}
