use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PhaseflowError;

/// Open key/value payload passed to and returned from tools.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

// ── Static pipeline shape ───────────────────────────────────────

/// A reference from a stage to a tool in the registry.
///
/// `name` is the key the tool's outcome is recorded under; it defaults to
/// the tool name and must be unique within its stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub name: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: Payload,
}

impl TaskRef {
    pub fn new(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self {
            name: tool.clone(),
            tool,
            args: Payload::new(),
        }
    }

    pub fn named(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            args: Payload::new(),
        }
    }

    pub fn with_args(mut self, args: Payload) -> Self {
        self.args = args;
        self
    }
}

/// A named unit of work inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    /// Role / agent-type tag (e.g. "van", "plan"). Informational only.
    #[serde(default)]
    pub agent_type: Option<String>,
    pub tasks: Vec<TaskRef>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Admission cap for this stage's tool tasks.
    pub max_parallel: usize,
    /// Per-tool timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: None,
            tasks: vec![],
            dependencies: BTreeSet::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
        }
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Append a task that invokes `tool` under its own name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tasks.push(TaskRef::new(tool));
        self
    }

    pub fn with_task(mut self, task: TaskRef) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.dependencies.insert(stage.into());
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// JSON snapshot stored alongside the stage's execution record.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A named, reusable stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
    /// Pipelines that must be done before this one is launched.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Run the stages of a wave one at a time instead of concurrently.
    #[serde(default)]
    pub sequential: bool,
    /// Higher priority launches first when several pipelines are ready.
    #[serde(default)]
    pub priority: i32,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            description: None,
            stages,
            depends_on: BTreeSet::new(),
            sequential: false,
            priority: 0,
        }
    }

    pub fn depends_on(mut self, pipeline: impl Into<String>) -> Self {
        self.depends_on.insert(pipeline.into());
        self
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

// ── Status enums ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Initialized,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Status only moves forward; terminal states are final.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initialized, Self::Running)
                | (Self::Initialized, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = PhaseflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PhaseflowError::Database(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = PhaseflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PhaseflowError::Database(format!(
                "unknown stage status '{}'",
                other
            ))),
        }
    }
}

// ── Persisted records ───────────────────────────────────────────

/// One execution run of a pipeline against a given input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub pipeline_name: String,
    pub input: Payload,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        workflow_id: impl Into<String>,
        pipeline_name: impl Into<String>,
        input: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            pipeline_name: pipeline_name.into(),
            input,
            status: WorkflowStatus::Initialized,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    pub workflow_id: String,
    pub stage_name: String,
    /// Snapshot of the stage configuration at execution time.
    pub config: serde_json::Value,
    pub status: StageStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StageExecutionRecord {
    pub fn pending(workflow_id: impl Into<String>, stage: &Stage) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            stage_name: stage.name.clone(),
            config: stage.snapshot(),
            status: StageStatus::Pending,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// Outcome of a single tool task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(Payload),
    Error(String),
}

impl ToolOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn as_success(&self) -> Option<&Payload> {
        match self {
            Self::Success(p) => Some(p),
            Self::Error(_) => None,
        }
    }
}

/// Append-only record of a stage's tool outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub workflow_id: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    pub results: BTreeMap<String, ToolOutcome>,
}

impl ResultRecord {
    pub fn new(
        workflow_id: impl Into<String>,
        stage_name: impl Into<String>,
        results: BTreeMap<String, ToolOutcome>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage_name: stage_name.into(),
            timestamp: Utc::now(),
            results,
        }
    }

    pub fn error_count(&self) -> usize {
        self.results.values().filter(|o| o.is_error()).count()
    }
}

/// Composite read model for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow: Workflow,
    pub stages: Vec<StageExecutionRecord>,
    /// Newest first.
    pub results: Vec<ResultRecord>,
}

impl WorkflowState {
    pub fn stage(&self, name: &str) -> Option<&StageExecutionRecord> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    pub fn latest_result(&self, stage_name: &str) -> Option<&ResultRecord> {
        self.results.iter().find(|r| r.stage_name == stage_name)
    }
}

// ── Runtime context ─────────────────────────────────────────────

/// Context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workflow_id: String,
    pub stage_name: String,
    pub task_name: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn detached(stage_name: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            workflow_id: String::new(),
            stage_name: stage_name.into(),
            task_name: task_name.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Lifecycle events published on the event bus.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Workflow moved to running.
    WorkflowStarted { workflow_id: String, pipeline: String },
    /// A wave of stages is about to run.
    WaveStarted {
        workflow_id: String,
        index: usize,
        stages: Vec<String>,
    },
    /// A stage was marked running.
    StageStarted { workflow_id: String, stage: String },
    /// A tool task resolved (successfully or not).
    ToolFinished {
        workflow_id: String,
        stage: String,
        task: String,
        is_error: bool,
        elapsed_ms: u64,
    },
    /// A stage reached a terminal status.
    StageFinished {
        workflow_id: String,
        stage: String,
        status: StageStatus,
        error: Option<String>,
    },
    /// A workflow reached a terminal status.
    WorkflowFinished {
        workflow_id: String,
        pipeline: String,
        status: WorkflowStatus,
        error: Option<String>,
    },
    /// The coordinator launched a pipeline.
    PipelineLaunched { pipeline: String, workflow_id: String },
    /// The coordinator recorded a pipeline's outcome.
    PipelineDone { pipeline: String, succeeded: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_status_is_monotonic() {
        use WorkflowStatus::*;
        assert!(Initialized.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Initialized));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for s in ["initialized", "running", "completed", "failed"] {
            assert_eq!(s.parse::<WorkflowStatus>().unwrap().as_str(), s);
        }
        for s in ["pending", "running", "completed", "failed"] {
            assert_eq!(s.parse::<StageStatus>().unwrap().as_str(), s);
        }
        assert!("bogus".parse::<StageStatus>().is_err());
    }

    #[test]
    fn test_stage_timeout_saturates() {
        let stage = Stage::new("plan").with_timeout(Duration::MAX);
        assert_eq!(stage.timeout_ms, u64::MAX);
    }

    #[test]
    fn test_stage_builder() {
        let stage = Stage::new("plan")
            .with_agent_type("plan")
            .with_tool("outline")
            .with_task(TaskRef::named("second_outline", "outline"))
            .depends_on("analyze")
            .with_max_parallel(2)
            .with_timeout(Duration::from_millis(250));

        assert_eq!(stage.tasks.len(), 2);
        assert_eq!(stage.tasks[0].name, "outline");
        assert_eq!(stage.tasks[1].tool, "outline");
        assert!(stage.dependencies.contains("analyze"));
        assert_eq!(stage.timeout(), Duration::from_millis(250));

        let snap = stage.snapshot();
        assert_eq!(snap["maxParallel"], 2);
        assert_eq!(snap["agentType"], "plan");
    }

    #[test]
    fn test_tool_outcome_serialization() {
        let mut ok = Payload::new();
        ok.insert("rows".into(), serde_json::json!(3));
        let mut results = BTreeMap::new();
        results.insert("count".to_string(), ToolOutcome::Success(ok));
        results.insert("lint".to_string(), ToolOutcome::error("boom"));

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["count"]["success"]["rows"], 3);
        assert_eq!(json["lint"]["error"], "boom");

        let record = ResultRecord::new("wf-1", "analyze", results);
        assert_eq!(record.error_count(), 1);
    }
}
