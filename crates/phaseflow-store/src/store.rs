use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::StateStore;
use phaseflow_core::types::{
    Payload, ResultRecord, StageExecutionRecord, StageStatus, ToolOutcome, Workflow,
    WorkflowState, WorkflowStatus,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        pipeline_name TEXT NOT NULL,
        input TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_id ON workflows(workflow_id);
    CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
    CREATE INDEX IF NOT EXISTS idx_workflows_pipeline ON workflows(pipeline_name);

    CREATE TABLE IF NOT EXISTS stage_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        config TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_stages_key
        ON stage_executions(workflow_id, stage_name);
    CREATE INDEX IF NOT EXISTS idx_stages_status ON stage_executions(status);

    CREATE TABLE IF NOT EXISTS results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        results TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_results_workflow
        ON results(workflow_id, timestamp);";

/// SQLite-backed workflow state store.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PhaseflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "State store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PhaseflowError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> PhaseflowError {
    PhaseflowError::Database(e.to_string())
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PhaseflowError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

type WorkflowRow = (String, String, String, String, Option<String>, String, String);

fn workflow_from_row(row: WorkflowRow) -> Result<Workflow> {
    let (workflow_id, pipeline_name, input, status, error, created_at, updated_at) = row;
    Ok(Workflow {
        workflow_id,
        pipeline_name,
        input: serde_json::from_str::<Payload>(&input)?,
        status: status.parse()?,
        error,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn read_workflow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

const WORKFLOW_COLUMNS: &str =
    "workflow_id, pipeline_name, input, status, error, created_at, updated_at";

impl StateStore for SqliteStateStore {
    fn init_schema(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute_batch(SCHEMA).map_err(db_err)?;
            Ok(())
        })
    }

    fn create_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();

        Box::pin(async move {
            let input = serde_json::to_string(&workflow.input)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (workflow_id, pipeline_name, input, status, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    workflow.workflow_id,
                    workflow.pipeline_name,
                    input,
                    workflow.status.as_str(),
                    workflow.error,
                    ts(&workflow.created_at),
                    ts(&workflow.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        let workflow_id = workflow_id.to_string();
        let error = error.map(str::to_string);

        Box::pin(async move {
            let conn = self.lock()?;

            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM workflows WHERE workflow_id = ?1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            let current: WorkflowStatus = current
                .ok_or_else(|| PhaseflowError::WorkflowNotFound(workflow_id.clone()))?
                .parse()?;

            if !current.can_transition_to(status) {
                return Err(PhaseflowError::InvalidTransition {
                    entity: format!("workflow {}", workflow_id),
                    from: current.to_string(),
                    to: status.to_string(),
                });
            }

            conn.execute(
                "UPDATE workflows SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
                 WHERE workflow_id = ?4",
                params![status.as_str(), error, ts(&Utc::now()), workflow_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn create_stage_record(&self, record: &StageExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let config = serde_json::to_string(&record.config)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO stage_executions
                    (workflow_id, stage_name, config, status, error, created_at, started_at, finished_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.workflow_id,
                    record.stage_name,
                    config,
                    record.status.as_str(),
                    record.error,
                    ts(&record.created_at),
                    record.started_at.as_ref().map(ts),
                    record.finished_at.as_ref().map(ts),
                    ts(&record.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn update_stage_status(
        &self,
        workflow_id: &str,
        stage_name: &str,
        status: StageStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        let workflow_id = workflow_id.to_string();
        let stage_name = stage_name.to_string();
        let error = error.map(str::to_string);

        Box::pin(async move {
            let conn = self.lock()?;

            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM stage_executions WHERE workflow_id = ?1 AND stage_name = ?2",
                    params![workflow_id, stage_name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            let current: StageStatus = current
                .ok_or_else(|| PhaseflowError::StageExecution {
                    stage: stage_name.clone(),
                    message: format!("no execution record in workflow {}", workflow_id),
                })?
                .parse()?;

            if !current.can_transition_to(status) {
                return Err(PhaseflowError::InvalidTransition {
                    entity: format!("stage {}/{}", workflow_id, stage_name),
                    from: current.to_string(),
                    to: status.to_string(),
                });
            }

            let now = ts(&Utc::now());
            let started = (status == StageStatus::Running).then(|| now.clone());
            let finished = status.is_terminal().then(|| now.clone());

            conn.execute(
                "UPDATE stage_executions
                 SET status = ?1,
                     error = COALESCE(?2, error),
                     started_at = COALESCE(?3, started_at),
                     finished_at = COALESCE(?4, finished_at),
                     updated_at = ?5
                 WHERE workflow_id = ?6 AND stage_name = ?7",
                params![status.as_str(), error, started, finished, now, workflow_id, stage_name],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn store_result(&self, record: &ResultRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let results = serde_json::to_string(&record.results)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO results (workflow_id, stage_name, timestamp, results)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.workflow_id,
                    record.stage_name,
                    ts(&record.timestamp),
                    results
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_workflow_state(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowState>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;

            let row = conn
                .query_row(
                    &format!("SELECT {} FROM workflows WHERE workflow_id = ?1", WORKFLOW_COLUMNS),
                    params![workflow_id],
                    read_workflow_row,
                )
                .optional()
                .map_err(db_err)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let workflow = workflow_from_row(row)?;

            let mut stmt = conn
                .prepare(
                    "SELECT stage_name, config, status, error, created_at, started_at, finished_at, updated_at
                     FROM stage_executions
                     WHERE workflow_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![workflow_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })
                .map_err(db_err)?;

            let mut stages = Vec::new();
            for row in rows {
                let (stage_name, config, status, error, created, started, finished, updated) =
                    row.map_err(db_err)?;
                stages.push(StageExecutionRecord {
                    workflow_id: workflow_id.clone(),
                    stage_name,
                    config: serde_json::from_str(&config)?,
                    status: status.parse()?,
                    error,
                    created_at: parse_ts(&created)?,
                    started_at: parse_opt_ts(started)?,
                    finished_at: parse_opt_ts(finished)?,
                    updated_at: parse_ts(&updated)?,
                });
            }

            let mut stmt = conn
                .prepare(
                    "SELECT stage_name, timestamp, results FROM results
                     WHERE workflow_id = ?1
                     ORDER BY timestamp DESC, id DESC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![workflow_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(db_err)?;

            let mut results = Vec::new();
            for row in rows {
                let (stage_name, timestamp, body) = row.map_err(db_err)?;
                results.push(ResultRecord {
                    workflow_id: workflow_id.clone(),
                    stage_name,
                    timestamp: parse_ts(&timestamp)?,
                    results: serde_json::from_str::<BTreeMap<String, ToolOutcome>>(&body)?,
                });
            }

            Ok(Some(WorkflowState {
                workflow,
                stages,
                results,
            }))
        })
    }

    fn list_active_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        Box::pin(async move {
            let conn = self.lock()?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM workflows
                     WHERE status IN ('initialized', 'running')
                     ORDER BY created_at ASC, id ASC",
                    WORKFLOW_COLUMNS
                ))
                .map_err(db_err)?;

            let rows = stmt.query_map([], read_workflow_row).map_err(db_err)?;

            let mut workflows = Vec::new();
            for row in rows {
                workflows.push(workflow_from_row(row.map_err(db_err)?)?);
            }
            Ok(workflows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use phaseflow_core::types::Stage;
    use serde_json::json;

    fn count_indexes(store: &SqliteStateStore) -> i64 {
        let conn = store.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn input() -> Payload {
        let mut p = Payload::new();
        p.insert("warehouse".into(), json!("north"));
        p
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let store = SqliteStateStore::in_memory().unwrap();
        let before = count_indexes(&store);
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
        assert_eq!(count_indexes(&store), before);
        assert_eq!(before, 6);
    }

    #[tokio::test]
    async fn test_workflow_lifecycle() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .create_workflow(&Workflow::new("wf-1", "inventory", input()))
            .await
            .unwrap();

        store
            .update_workflow_status("wf-1", WorkflowStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(store.list_active_workflows().await.unwrap().len(), 1);

        store
            .update_workflow_status("wf-1", WorkflowStatus::Failed, Some("stage 'plan' failed"))
            .await
            .unwrap();
        assert!(store.list_active_workflows().await.unwrap().is_empty());

        let err = store
            .update_workflow_status("wf-1", WorkflowStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidTransition { .. }));

        let state = store.get_workflow_state("wf-1").await.unwrap().unwrap();
        assert_eq!(state.workflow.status, WorkflowStatus::Failed);
        assert_eq!(state.workflow.error.as_deref(), Some("stage 'plan' failed"));
        assert_eq!(state.workflow.input["warehouse"], "north");
        assert!(state.workflow.updated_at >= state.workflow.created_at);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_rejected() {
        let store = SqliteStateStore::in_memory().unwrap();
        let wf = Workflow::new("wf-dup", "inventory", Payload::new());
        store.create_workflow(&wf).await.unwrap();
        assert!(store.create_workflow(&wf).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let store = SqliteStateStore::in_memory().unwrap();
        assert!(store.get_workflow_state("nope").await.unwrap().is_none());
        let err = store
            .update_workflow_status("nope", WorkflowStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_stage_records_and_timestamps() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .create_workflow(&Workflow::new("wf-2", "inventory", Payload::new()))
            .await
            .unwrap();

        let stage = Stage::new("analyze").with_tool("scan");
        store
            .create_stage_record(&StageExecutionRecord::pending("wf-2", &stage))
            .await
            .unwrap();
        // (workflow id, stage name) is unique
        assert!(store
            .create_stage_record(&StageExecutionRecord::pending("wf-2", &stage))
            .await
            .is_err());

        store
            .update_stage_status("wf-2", "analyze", StageStatus::Running, None)
            .await
            .unwrap();
        store
            .update_stage_status("wf-2", "analyze", StageStatus::Completed, None)
            .await
            .unwrap();

        let state = store.get_workflow_state("wf-2").await.unwrap().unwrap();
        let record = state.stage("analyze").unwrap();
        assert_eq!(record.status, StageStatus::Completed);
        assert_eq!(record.config["name"], "analyze");
        let started = record.started_at.unwrap();
        let finished = record.finished_at.unwrap();
        assert!(finished >= started);

        let err = store
            .update_stage_status("wf-2", "analyze", StageStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_results_newest_first() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .create_workflow(&Workflow::new("wf-3", "inventory", Payload::new()))
            .await
            .unwrap();

        let mut first = ResultRecord::new("wf-3", "analyze", BTreeMap::new());
        first.results.insert("scan".into(), ToolOutcome::error("timeout"));
        let mut second = ResultRecord::new("wf-3", "plan", BTreeMap::new());
        second.timestamp = first.timestamp + Duration::milliseconds(5);
        second
            .results
            .insert("outline".into(), ToolOutcome::Success(input()));

        store.store_result(&first).await.unwrap();
        store.store_result(&second).await.unwrap();

        let state = store.get_workflow_state("wf-3").await.unwrap().unwrap();
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.results[0].stage_name, "plan");
        assert_eq!(state.results[1].results["scan"], ToolOutcome::error("timeout"));
        assert_eq!(
            state.latest_result("plan").unwrap().results["outline"]
                .as_success()
                .unwrap()["warehouse"],
            "north"
        );
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store
                .create_workflow(&Workflow::new("wf-disk", "reporting", Payload::new()))
                .await
                .unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        store.init_schema().await.unwrap();
        let active = store.list_active_workflows().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pipeline_name, "reporting");
    }
}
