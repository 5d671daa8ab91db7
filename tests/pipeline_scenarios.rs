use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use phaseflow_core::config::{EngineConfig, PipelineFile};
use phaseflow_core::event::EventBus;
use phaseflow_core::handover::{validate_phase_completion, HandoverDocument, Phase};
use phaseflow_core::traits::StateStore;
use phaseflow_core::types::{Payload, StageStatus, ToolOutcome, WorkflowStatus};
use phaseflow_engine::{
    spawn_run_logger, PipelineCoordinator, PipelineStatus, StageScheduler, WorkerPool,
};
use phaseflow_store::SqliteStateStore;
use phaseflow_test_utils::{payload, ProbeTool};
use phaseflow_tools::ToolRegistry;

const ERP_PIPELINES: &str = r#"{
  "pipelines": {
    "inventory": {
      "stages": [
        { "name": "analyze", "agentType": "van", "tasks": ["echo", { "name": "validate", "tool": "fail", "args": { "message": "negative stock" } }] },
        { "name": "plan", "agentType": "plan", "tasks": ["echo"], "dependencies": ["analyze"] },
        { "name": "implement", "agentType": "implement", "tasks": ["echo"], "dependencies": ["plan"] },
        { "name": "review", "agentType": "review", "tasks": ["echo"], "dependencies": ["plan"] }
      ]
    },
    "sales": {
      "stages": [ { "name": "collect", "tasks": [{ "tool": "delay", "args": { "ms": 30 } }] } ]
    },
    "reporting": {
      "stages": [ { "name": "render", "tasks": ["echo"] } ]
    }
  },
  "dependencies": { "reporting": ["inventory", "sales"] },
  "executionConfig": { "maxParallelPipelines": 2 }
}"#;

fn scheduler(store: Arc<dyn StateStore>, pool: usize) -> Arc<StageScheduler> {
    Arc::new(StageScheduler::new(
        Arc::new(ToolRegistry::with_builtins()),
        store,
        WorkerPool::new(pool),
    ))
}

async fn disk_store(dir: &tempfile::TempDir) -> Arc<dyn StateStore> {
    let store = SqliteStateStore::open(&dir.path().join("state.db")).unwrap();
    store.init_schema().await.unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_erp_run_from_pipeline_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = disk_store(&dir).await;
    let file = PipelineFile::from_json(ERP_PIPELINES).unwrap();
    let coordinator =
        PipelineCoordinator::from_config(scheduler(store.clone(), 8), &file, &EngineConfig::default())
            .unwrap();

    assert_eq!(
        coordinator.scheduler().plan("inventory").unwrap(),
        vec![
            vec!["analyze".to_string()],
            vec!["plan".to_string()],
            vec!["implement".to_string(), "review".to_string()],
        ]
    );

    let input = payload(json!({ "warehouse": "north" }));
    let report = coordinator.run_all(input, CancellationToken::new()).await;
    assert!(report.all_completed(), "failed: {:?}", report.failed());
    assert_eq!(report.outcomes.len(), 3);

    let inventory = report.get("inventory").unwrap();
    let workflow_id = inventory.workflow_id.clone().unwrap();
    assert!(workflow_id.starts_with("inventory-"));

    // The failing validation task is recorded but does not stop the pipeline.
    let workflow = inventory.workflow.as_ref().unwrap();
    let analyze = &workflow.stages["analyze"];
    assert_eq!(analyze.status, StageStatus::Completed);
    assert!(matches!(
        &analyze.results["validate"],
        ToolOutcome::Error(msg) if msg.contains("negative stock")
    ));

    // Plan sees the workflow input and the successful analyze output only.
    let plan = workflow.stages["plan"].results["echo"].as_success().unwrap();
    assert_eq!(plan["warehouse"], "north");
    assert_eq!(plan["upstream"]["analyze"]["echo"]["stage"], "analyze");
    assert!(plan["upstream"]["analyze"].get("validate").is_none());

    let state = store.get_workflow_state(&workflow_id).await.unwrap().unwrap();
    assert_eq!(state.workflow.status, WorkflowStatus::Completed);
    assert_eq!(state.stages.len(), 4);
    assert!(state.stages.iter().all(|s| s.finished_at.is_some()));
    assert_eq!(state.latest_result("analyze").unwrap().error_count(), 1);
    assert!(store.list_active_workflows().await.unwrap().is_empty());

    // Reporting waits for both prerequisites.
    let reporting = report.get("reporting").unwrap();
    let started = reporting.started_at.unwrap();
    assert!(started >= inventory.finished_at);
    assert!(started >= report.get("sales").unwrap().finished_at);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let file = PipelineFile::from_json(ERP_PIPELINES).unwrap();

    let workflow_id = {
        let store = disk_store(&dir).await;
        let coordinator =
            PipelineCoordinator::from_config(scheduler(store, 4), &file, &EngineConfig::default())
                .unwrap();
        let report = coordinator.run_all(Payload::new(), CancellationToken::new()).await;
        report.get("sales").unwrap().workflow_id.clone().unwrap()
    };

    let reopened = disk_store(&dir).await;
    let state = reopened.get_workflow_state(&workflow_id).await.unwrap().unwrap();
    assert_eq!(state.workflow.pipeline_name, "sales");
    let collect = state.latest_result("collect").unwrap();
    assert_eq!(
        collect.results["delay"].as_success().unwrap()["sleptMs"],
        30
    );
}

#[tokio::test]
async fn test_cap_one_runs_pipelines_one_at_a_time() {
    let probe = ProbeTool::new("probe", Duration::from_millis(20));
    let mut registry = ToolRegistry::new();
    registry.register(probe.clone());
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
    let scheduler = Arc::new(StageScheduler::new(
        Arc::new(registry),
        store,
        WorkerPool::new(8),
    ));

    let file = PipelineFile::from_json(
        r#"{
          "pipelines": {
            "finance": { "stages": [ { "name": "close", "tasks": ["probe"] } ] },
            "hr": { "stages": [ { "name": "payroll", "tasks": ["probe"] } ] },
            "crm": { "stages": [ { "name": "sync", "tasks": ["probe"] } ] }
          },
          "executionConfig": { "maxParallelPipelines": 1 }
        }"#,
    )
    .unwrap();
    let coordinator =
        PipelineCoordinator::from_config(scheduler, &file, &EngineConfig::default()).unwrap();
    assert_eq!(coordinator.max_parallel(), 1);

    let report = coordinator.run_all(Payload::new(), CancellationToken::new()).await;
    assert!(report.all_completed());
    assert_eq!(probe.call_count(), 3);
    assert_eq!(probe.max_concurrency(), 1);
}

#[tokio::test]
async fn test_timeout_isolated_within_pipeline() {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
    let file = PipelineFile::from_json(
        r#"{
          "pipelines": {
            "inventory": {
              "stages": [
                { "name": "analyze", "timeoutSecs": 1,
                  "tasks": [{ "name": "stuck", "tool": "delay", "args": { "ms": 5000 } }, "echo"] },
                { "name": "plan", "tasks": ["echo"], "dependencies": ["analyze"] }
              ]
            }
          }
        }"#,
    )
    .unwrap();
    let coordinator =
        PipelineCoordinator::from_config(scheduler(store, 4), &file, &EngineConfig::default())
            .unwrap();

    let report = coordinator.run_all(Payload::new(), CancellationToken::new()).await;
    let outcome = report.get("inventory").unwrap();
    assert_eq!(outcome.status, PipelineStatus::Completed);

    let workflow = outcome.workflow.as_ref().unwrap();
    let analyze = &workflow.stages["analyze"];
    assert!(matches!(
        &analyze.results["stuck"],
        ToolOutcome::Error(msg) if msg.contains("timeout")
    ));
    assert!(!analyze.results["echo"].is_error());
    assert!(workflow.stages.contains_key("plan"));
}

#[tokio::test]
async fn test_stage_max_parallel_respected() {
    let probe = ProbeTool::new("probe", Duration::from_millis(20));
    let mut registry = ToolRegistry::new();
    registry.register(probe.clone());
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
    let scheduler = Arc::new(StageScheduler::new(
        Arc::new(registry),
        store,
        WorkerPool::new(16),
    ));

    let tasks: Vec<serde_json::Value> = (0..6)
        .map(|i| json!({ "name": format!("t{}", i), "tool": "probe" }))
        .collect();
    let file = PipelineFile::from_json(
        &json!({
            "pipelines": {
                "batch": { "stages": [ { "name": "load", "maxParallel": 2, "tasks": tasks } ] }
            }
        })
        .to_string(),
    )
    .unwrap();
    let coordinator =
        PipelineCoordinator::from_config(scheduler, &file, &EngineConfig::default()).unwrap();

    let report = coordinator.run_all(Payload::new(), CancellationToken::new()).await;
    assert!(report.all_completed());
    assert_eq!(probe.call_count(), 6);
    assert_eq!(probe.max_concurrency(), 2);
}

#[test]
fn test_cyclic_pipeline_file_rejected() {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());

    let stage_cycle = PipelineFile::from_json(
        r#"{ "pipelines": { "p": { "stages": [
            { "name": "a", "tasks": ["echo"], "dependencies": ["b"] },
            { "name": "b", "tasks": ["echo"], "dependencies": ["a"] }
        ] } } }"#,
    )
    .unwrap();
    let err = PipelineCoordinator::from_config(
        scheduler(store.clone(), 4),
        &stage_cycle,
        &EngineConfig::default(),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("cycle"));

    let pipeline_cycle = PipelineFile::from_json(
        r#"{
          "pipelines": {
            "a": { "stages": [ { "name": "s", "tasks": ["echo"] } ] },
            "b": { "stages": [ { "name": "s", "tasks": ["echo"] } ] }
          },
          "dependencies": { "a": ["b"], "b": ["a"] }
        }"#,
    )
    .unwrap();
    let err = PipelineCoordinator::from_config(
        scheduler(store, 4),
        &pipeline_cycle,
        &EngineConfig::default(),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("pipeline dependency cycle"));
}

#[tokio::test]
async fn test_run_log_written_for_coordinated_run() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
    let bus = Arc::new(EventBus::default());
    let scheduler = Arc::new(
        StageScheduler::new(
            Arc::new(ToolRegistry::with_builtins()),
            store,
            WorkerPool::new(4),
        )
        .with_event_bus(bus.clone()),
    );
    let file = PipelineFile::from_json(ERP_PIPELINES).unwrap();
    let coordinator =
        PipelineCoordinator::from_config(scheduler, &file, &EngineConfig::default()).unwrap();

    let (stop, handle) =
        spawn_run_logger(Some(dir.path()), 1, bus.clone(), "run-erp".into()).unwrap();
    let report = coordinator.run_all(Payload::new(), CancellationToken::new()).await;
    assert!(report.all_completed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.cancel();
    handle.await.unwrap();

    let content = std::fs::read_to_string(dir.path().join("run-erp.jsonl")).unwrap();
    let events: Vec<String> = content
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["event_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(events.iter().filter(|e| *e == "pipeline_launched").count(), 3);
    assert_eq!(events.iter().filter(|e| *e == "pipeline_done").count(), 3);
    assert!(!events.iter().any(|e| e == "stage_started"));
}

#[test]
fn test_handover_chain_wraps_to_van() {
    let review = HandoverDocument::new(Phase::Review, "Quarterly close", "All checks green")
        .with_context("ledger", json!("2026-Q3"))
        .with_metric("quality_score", 0.92);

    let next = review.next_phase();
    assert_eq!(next.phase, Phase::Van);
    assert_eq!(next.source_agent_id, "review-agent");
    assert_eq!(next.target_agent_id, "van-agent");
    assert_eq!(next.context["previousPhase"], "review");
    assert_eq!(next.context["previousContext"]["ledger"], "2026-Q3");
    assert!(next.metrics.is_empty());

    let round_trip = HandoverDocument::from_json(&next.to_json().unwrap()).unwrap();
    assert_eq!(round_trip, next);
}

#[test]
fn test_phase_gate_on_stage_outputs() {
    let partial = payload(json!({
        "test_results": { "passed": 41 },
        "quality_score": 0.95,
    }));
    assert!(!validate_phase_completion(Phase::Review, &partial));

    let mut van = payload(json!({
        "system_analysis": "stock drift in north warehouse",
        "data_insights": ["late receipts"],
        "requirement_validation": "ok",
        "metrics_collection": { "skus": 1200 },
        "analysis_complete": true,
        "insights_identified": true,
        "requirements_validated": true,
        "metrics_collected": true,
        "analysis_coverage": 0.85,
        "validation_accuracy": 0.93,
        "insight_relevance": 0.7,
    }));
    assert!(validate_phase_completion(Phase::Van, &van));

    van.insert("validation_accuracy".into(), json!(0.5));
    assert!(!validate_phase_completion(Phase::Van, &van));
}
