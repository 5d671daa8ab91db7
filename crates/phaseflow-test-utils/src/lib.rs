//! Mock tools, store doubles, and pipeline fixtures shared by Phaseflow tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::time::Instant;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::{StateStore, Tool};
use phaseflow_core::types::*;

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".into(), other);
            map
        }
    }
}

// ── Tools ───────────────────────────────────────────────────────

/// Returns a fixed payload and records every input it was called with.
#[derive(Clone)]
pub struct StaticTool {
    name: String,
    output: Payload,
    calls: Arc<Mutex<Vec<Payload>>>,
}

impl StaticTool {
    pub fn new(name: &str, output: Value) -> Self {
        Self {
            name: name.to_string(),
            output: to_payload(output),
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn calls(&self) -> Vec<Payload> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: Payload, _ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        self.calls.lock().unwrap().push(input);
        let output = self.output.clone();
        Box::pin(async move { Ok(output) })
    }
}

/// Always fails with a tool execution error.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload, _ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            Err(PhaseflowError::ToolExecution {
                tool: self.name.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Sleeps for a fixed duration, then succeeds.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload, _ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let slept_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
            Ok(to_payload(json!({ "sleptMs": slept_ms })))
        })
    }
}

/// One observed invocation of a [`ProbeTool`].
#[derive(Debug, Clone)]
pub struct ProbeSpan {
    pub stage: String,
    pub task: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Sleeps for a fixed duration while tracking how many invocations overlap.
///
/// Clones share counters, so keep one clone to inspect after the run.
#[derive(Clone)]
pub struct ProbeTool {
    name: String,
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    spans: Arc<Mutex<Vec<ProbeSpan>>>,
}

impl ProbeTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            spans: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Highest number of simultaneously running invocations observed.
    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<ProbeSpan> {
        self.spans.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }
}

impl Tool for ProbeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload, ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let started = Instant::now();
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.current.fetch_sub(1, Ordering::SeqCst);
            self.spans.lock().unwrap().push(ProbeSpan {
                stage: ctx.stage_name.clone(),
                task: ctx.task_name.clone(),
                started,
                finished: Instant::now(),
            });
            Ok(to_payload(json!({ "task": ctx.task_name })))
        })
    }
}

// ── Stores ──────────────────────────────────────────────────────

/// Delegates to an inner store but rejects selected writes.
pub struct FailingStore {
    inner: Arc<dyn StateStore>,
    failing_stages: HashSet<String>,
    failing_records: HashSet<String>,
    failing_workflow_status: Option<WorkflowStatus>,
}

fn injected<T: Send + 'static>(what: String) -> BoxFuture<'static, Result<T>> {
    Box::pin(async move {
        Err(PhaseflowError::Database(format!(
            "injected write failure for {}",
            what
        )))
    })
}

impl FailingStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            failing_stages: HashSet::new(),
            failing_records: HashSet::new(),
            failing_workflow_status: None,
        }
    }

    /// Refuse to mark `stage` running, so it fails at the stage level.
    pub fn fail_stage(mut self, stage: &str) -> Self {
        self.failing_stages.insert(stage.to_string());
        self
    }

    /// Refuse to create the execution record of `stage`.
    pub fn fail_stage_record(mut self, stage: &str) -> Self {
        self.failing_records.insert(stage.to_string());
        self
    }

    /// Refuse every workflow transition to `status`.
    pub fn fail_workflow_status(mut self, status: WorkflowStatus) -> Self {
        self.failing_workflow_status = Some(status);
        self
    }
}

impl StateStore for FailingStore {
    fn init_schema(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.init_schema()
    }

    fn create_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>> {
        self.inner.create_workflow(workflow)
    }

    fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        if self.failing_workflow_status == Some(status) {
            return injected(format!("workflow '{}' -> {}", workflow_id, status));
        }
        self.inner.update_workflow_status(workflow_id, status, error)
    }

    fn create_stage_record(&self, record: &StageExecutionRecord) -> BoxFuture<'_, Result<()>> {
        if self.failing_records.contains(&record.stage_name) {
            return injected(format!("stage record '{}'", record.stage_name));
        }
        self.inner.create_stage_record(record)
    }

    fn update_stage_status(
        &self,
        workflow_id: &str,
        stage_name: &str,
        status: StageStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        if status == StageStatus::Running && self.failing_stages.contains(stage_name) {
            return injected(format!("stage '{}'", stage_name));
        }
        self.inner
            .update_stage_status(workflow_id, stage_name, status, error)
    }

    fn store_result(&self, record: &ResultRecord) -> BoxFuture<'_, Result<()>> {
        self.inner.store_result(record)
    }

    fn get_workflow_state(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowState>>> {
        self.inner.get_workflow_state(workflow_id)
    }

    fn list_active_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        self.inner.list_active_workflows()
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// analyze → plan → {implement, review}, each stage running `tool`.
pub fn phase_stages(tool: &str) -> Vec<Stage> {
    vec![
        Stage::new("analyze").with_agent_type("van").with_tool(tool),
        Stage::new("plan")
            .with_agent_type("plan")
            .with_tool(tool)
            .depends_on("analyze"),
        Stage::new("implement")
            .with_agent_type("implement")
            .with_tool(tool)
            .depends_on("plan"),
        Stage::new("review")
            .with_agent_type("review")
            .with_tool(tool)
            .depends_on("plan"),
    ]
}

pub fn payload(value: Value) -> Payload {
    to_payload(value)
}
