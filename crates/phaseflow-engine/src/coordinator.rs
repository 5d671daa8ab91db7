use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use phaseflow_core::config::{EngineConfig, PipelineFile};
use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::types::{Payload, PipelineDefinition, PipelineEvent, WorkflowStatus};

use crate::graph::find_cycle;
use crate::scheduler::{StageScheduler, WorkflowOutcome};

/// Per-pipeline completion flag. A pipeline is launched only from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub pipeline: String,
    /// Absent when the pipeline was never launched.
    pub workflow_id: Option<String>,
    pub status: PipelineStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// Full workflow result when the run produced one.
    pub workflow: Option<WorkflowOutcome>,
}

/// Outcomes of one `run_all` call, in completion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorReport {
    pub outcomes: Vec<PipelineOutcome>,
}

impl CoordinatorReport {
    pub fn get(&self, pipeline: &str) -> Option<&PipelineOutcome> {
        self.outcomes.iter().find(|o| o.pipeline == pipeline)
    }

    pub fn all_completed(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == PipelineStatus::Completed)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.status != PipelineStatus::Completed)
            .map(|o| o.pipeline.as_str())
            .collect()
    }
}

type RunResult = (String, String, DateTime<Utc>, Result<WorkflowOutcome>);

/// Runs independent pipelines concurrently under a global cap.
///
/// A pipeline becomes ready once every prerequisite is done, whether the
/// prerequisite succeeded or not. Ready pipelines launch by priority (highest
/// first), then by name.
pub struct PipelineCoordinator {
    scheduler: Arc<StageScheduler>,
    pipelines: BTreeMap<String, PipelineDefinition>,
    max_parallel: usize,
    states: Mutex<HashMap<String, CompletionState>>,
}

impl PipelineCoordinator {
    /// Register every definition with the scheduler and validate the
    /// pipeline-level dependency graph.
    pub fn new(
        scheduler: Arc<StageScheduler>,
        definitions: Vec<PipelineDefinition>,
        max_parallel: usize,
    ) -> Result<Self> {
        let mut pipelines = BTreeMap::new();
        for definition in definitions {
            if pipelines.contains_key(&definition.name) {
                return Err(PhaseflowError::config(format!(
                    "duplicate pipeline '{}'",
                    definition.name
                )));
            }
            pipelines.insert(definition.name.clone(), definition);
        }

        for definition in pipelines.values() {
            if let Some(missing) = definition
                .depends_on
                .iter()
                .find(|p| !pipelines.contains_key(*p))
            {
                return Err(PhaseflowError::config(format!(
                    "pipeline '{}' depends on unknown pipeline '{}'",
                    definition.name, missing
                )));
            }
        }

        let graph: BTreeMap<&str, Vec<&str>> = pipelines
            .values()
            .map(|d| {
                (
                    d.name.as_str(),
                    d.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        if let Some(cycle) = find_cycle(&graph) {
            return Err(PhaseflowError::config(format!(
                "pipeline dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        for definition in pipelines.values() {
            scheduler.register(definition.clone())?;
        }

        let states = pipelines
            .keys()
            .map(|name| (name.clone(), CompletionState::Pending))
            .collect();

        Ok(Self {
            scheduler,
            pipelines,
            max_parallel: max_parallel.max(1),
            states: Mutex::new(states),
        })
    }

    /// Build from a parsed pipeline file.
    pub fn from_config(
        scheduler: Arc<StageScheduler>,
        file: &PipelineFile,
        engine: &EngineConfig,
    ) -> Result<Self> {
        Self::new(
            scheduler,
            file.definitions(engine)?,
            file.execution_config.max_parallel_pipelines,
        )
    }

    pub fn scheduler(&self) -> &Arc<StageScheduler> {
        &self.scheduler
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.keys().map(String::as_str).collect()
    }

    pub fn definition(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.get(name)
    }

    pub fn state(&self, pipeline: &str) -> Option<CompletionState> {
        self.states.lock().ok()?.get(pipeline).copied()
    }

    /// Put every pipeline back to `Pending` so `run_all` runs them again.
    pub fn reset(&self) {
        if let Ok(mut states) = self.states.lock() {
            for state in states.values_mut() {
                *state = CompletionState::Pending;
            }
        }
    }

    fn set_state(&self, pipeline: &str, state: CompletionState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(pipeline.to_string(), state);
        }
    }

    /// Pending pipelines whose prerequisites are all done, in launch order.
    pub fn ready(&self) -> Vec<String> {
        let Ok(states) = self.states.lock() else {
            return vec![];
        };

        let mut ready: Vec<&PipelineDefinition> = self
            .pipelines
            .values()
            .filter(|d| states.get(&d.name) == Some(&CompletionState::Pending))
            .filter(|d| {
                d.depends_on
                    .iter()
                    .all(|p| states.get(p) == Some(&CompletionState::Done))
            })
            .collect();
        // BTreeMap order is by name; stable sort keeps it within a priority.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready.into_iter().map(|d| d.name.clone()).collect()
    }

    /// Run every pending pipeline once, honoring dependencies and the
    /// concurrency cap. One pipeline's failure never stops the others.
    pub async fn run_all(&self, input: Payload, cancel: CancellationToken) -> CoordinatorReport {
        let event_bus = self.scheduler.event_bus();
        let mut report = CoordinatorReport::default();
        let mut running: JoinSet<RunResult> = JoinSet::new();
        let mut launched: HashMap<tokio::task::Id, (String, String, DateTime<Utc>)> =
            HashMap::new();

        info!(
            pipelines = self.pipelines.len(),
            max_parallel = self.max_parallel,
            "Coordinator started"
        );

        loop {
            if !cancel.is_cancelled() {
                let slots = self.max_parallel.saturating_sub(running.len());
                for name in self.ready().into_iter().take(slots) {
                    let workflow_id = format!("{}-{}", name, uuid::Uuid::new_v4());
                    let started_at = Utc::now();
                    self.set_state(&name, CompletionState::Running);

                    info!(pipeline = %name, %workflow_id, "Launching pipeline");
                    event_bus.publish(PipelineEvent::PipelineLaunched {
                        pipeline: name.clone(),
                        workflow_id: workflow_id.clone(),
                    });

                    let scheduler = self.scheduler.clone();
                    let input = input.clone();
                    let child = cancel.child_token();
                    let (task_name, task_wf) = (name.clone(), workflow_id.clone());
                    let handle = running.spawn(async move {
                        let result = scheduler
                            .execute_workflow(&task_name, &task_wf, input, child)
                            .await;
                        (task_name, task_wf, started_at, result)
                    });
                    launched.insert(handle.id(), (name, workflow_id, started_at));
                }
            }

            // Woken exactly when a running pipeline finishes.
            let Some(joined) = running.join_next_with_id().await else {
                break;
            };

            let outcome = match joined {
                Ok((id, (name, workflow_id, started_at, result))) => {
                    launched.remove(&id);
                    self.outcome_from_result(name, workflow_id, started_at, result, &cancel)
                }
                Err(join_err) => {
                    let (name, workflow_id, started_at) = match launched.remove(&join_err.id()) {
                        Some(entry) => entry,
                        None => {
                            error!(error = %join_err, "Unknown pipeline task ended");
                            continue;
                        }
                    };
                    error!(pipeline = %name, error = %join_err, "Pipeline task aborted");
                    let error = PhaseflowError::PipelineExecution {
                        pipeline: name.clone(),
                        message: join_err.to_string(),
                    };
                    PipelineOutcome {
                        pipeline: name,
                        workflow_id: Some(workflow_id),
                        status: PipelineStatus::Failed,
                        error: Some(error.to_string()),
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        workflow: None,
                    }
                }
            };

            self.set_state(&outcome.pipeline, CompletionState::Done);
            event_bus.publish(PipelineEvent::PipelineDone {
                pipeline: outcome.pipeline.clone(),
                succeeded: outcome.status == PipelineStatus::Completed,
            });
            report.outcomes.push(outcome);
        }

        // Anything still pending was never launched.
        let leftover: Vec<String> = self
            .states
            .lock()
            .map(|states| {
                let mut names: Vec<String> = states
                    .iter()
                    .filter(|(_, s)| **s == CompletionState::Pending)
                    .map(|(n, _)| n.clone())
                    .collect();
                names.sort();
                names
            })
            .unwrap_or_default();

        for name in leftover {
            let (status, message) = if cancel.is_cancelled() {
                (PipelineStatus::Cancelled, "cancelled before launch")
            } else {
                (PipelineStatus::Failed, "prerequisites never completed")
            };
            warn!(pipeline = %name, "Pipeline not launched: {}", message);
            self.set_state(&name, CompletionState::Done);
            report.outcomes.push(PipelineOutcome {
                pipeline: name,
                workflow_id: None,
                status,
                error: Some(message.to_string()),
                started_at: None,
                finished_at: Utc::now(),
                workflow: None,
            });
        }

        info!(
            completed = report.outcomes.len() - report.failed().len(),
            failed = report.failed().len(),
            "Coordinator finished"
        );
        report
    }

    fn outcome_from_result(
        &self,
        name: String,
        workflow_id: String,
        started_at: DateTime<Utc>,
        result: Result<WorkflowOutcome>,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        match result {
            Ok(workflow) => {
                let status = match workflow.status {
                    WorkflowStatus::Completed => PipelineStatus::Completed,
                    _ if cancel.is_cancelled() => PipelineStatus::Cancelled,
                    _ => PipelineStatus::Failed,
                };
                if status != PipelineStatus::Completed {
                    warn!(pipeline = %name, error = ?workflow.error, "Pipeline did not complete");
                }
                PipelineOutcome {
                    pipeline: name,
                    workflow_id: Some(workflow_id),
                    status,
                    error: workflow.error.clone(),
                    started_at: Some(started_at),
                    finished_at: workflow.finished_at,
                    workflow: Some(workflow),
                }
            }
            Err(e) => {
                error!(pipeline = %name, error = %e, "Pipeline execution failed");
                let error = PhaseflowError::PipelineExecution {
                    pipeline: name.clone(),
                    message: e.to_string(),
                };
                PipelineOutcome {
                    pipeline: name,
                    workflow_id: Some(workflow_id),
                    status: PipelineStatus::Failed,
                    error: Some(error.to_string()),
                    started_at: Some(started_at),
                    finished_at: Utc::now(),
                    workflow: None,
                }
            }
        }
    }
}
