use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::event::EventBus;
use phaseflow_core::traits::StateStore;
use phaseflow_core::types::*;
use phaseflow_tools::ToolRegistry;

use crate::graph::{group_stages, validate_stage_graph};
use crate::pool::WorkerPool;

/// Result of running one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub status: StageStatus,
    /// Task name → outcome. Empty when the stage failed before any tool ran.
    pub results: BTreeMap<String, ToolOutcome>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Aggregated result of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub pipeline: String,
    pub status: WorkflowStatus,
    /// Stage names per wave, in execution order.
    pub waves: Vec<Vec<String>>,
    /// Outcomes of the stages that ran. Stages in skipped waves are absent.
    pub stages: BTreeMap<String, StageOutcome>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Runs pipeline stage graphs wave by wave.
///
/// Every tool task is admitted first by its stage's own cap, then by the
/// shared [`WorkerPool`]. Tool failures stay inside the stage; stage failures
/// abort the workflow after the current wave resolves.
pub struct StageScheduler {
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn StateStore>,
    pool: WorkerPool,
    event_bus: Arc<EventBus>,
}

impl StageScheduler {
    pub fn new(tools: Arc<ToolRegistry>, store: Arc<dyn StateStore>, pool: WorkerPool) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            tools,
            store,
            pool,
            event_bus: Arc::new(EventBus::default()),
        }
    }

    /// Publish lifecycle events on a shared bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Register a pipeline from its stage list.
    pub fn register_pipeline(&self, name: impl Into<String>, stages: Vec<Stage>) -> Result<()> {
        self.register(PipelineDefinition::new(name, stages))
    }

    /// Validate and store a pipeline definition, replacing any previous one
    /// with the same name.
    pub fn register(&self, definition: PipelineDefinition) -> Result<()> {
        self.validate(&definition)?;

        debug!(
            pipeline = %definition.name,
            stages = definition.stages.len(),
            "Pipeline registered"
        );

        let mut pipelines = self
            .pipelines
            .write()
            .map_err(|e| PhaseflowError::config(e.to_string()))?;
        pipelines.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    fn validate(&self, definition: &PipelineDefinition) -> Result<()> {
        let context = |msg: String| {
            PhaseflowError::config(format!("pipeline '{}': {}", definition.name, msg))
        };

        validate_stage_graph(&definition.stages).map_err(|e| match e {
            PhaseflowError::Configuration(msg) => context(msg),
            other => other,
        })?;

        for stage in &definition.stages {
            if stage.max_parallel == 0 {
                return Err(context(format!(
                    "stage '{}' has maxParallel 0",
                    stage.name
                )));
            }

            let mut task_names = HashSet::new();
            for task in &stage.tasks {
                if !task_names.insert(task.name.as_str()) {
                    return Err(context(format!(
                        "stage '{}' lists task '{}' more than once",
                        stage.name, task.name
                    )));
                }
                if !self.tools.contains(&task.tool) {
                    return Err(context(format!(
                        "stage '{}' references unknown tool '{}'",
                        stage.name, task.tool
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.read().ok()?.get(name).cloned()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pipelines
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Execution waves of a registered pipeline, by stage name.
    pub fn plan(&self, pipeline: &str) -> Result<Vec<Vec<String>>> {
        let definition = self
            .pipeline(pipeline)
            .ok_or_else(|| PhaseflowError::PipelineNotFound(pipeline.to_string()))?;
        let waves = group_stages(&definition.stages)?;
        Ok(wave_names(&waves))
    }

    /// Run every tool of `stage` and record the outcomes.
    ///
    /// The stage's execution record must already exist in `pending`. Tool
    /// errors and timeouts become error entries; the stage only fails when
    /// its own bookkeeping fails or `cancel` fires.
    pub async fn execute_stage(
        &self,
        stage: &Stage,
        input: &Payload,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let started = Instant::now();

        if cancel.is_cancelled() {
            return self
                .fail_stage(stage, workflow_id, "cancelled".into(), BTreeMap::new(), started)
                .await;
        }

        if let Err(e) = self
            .store
            .update_stage_status(workflow_id, &stage.name, StageStatus::Running, None)
            .await
        {
            return self
                .fail_stage(stage, workflow_id, e.to_string(), BTreeMap::new(), started)
                .await;
        }

        self.event_bus.publish(PipelineEvent::StageStarted {
            workflow_id: workflow_id.to_string(),
            stage: stage.name.clone(),
        });
        debug!(
            workflow_id,
            stage = %stage.name,
            tasks = stage.tasks.len(),
            max_parallel = stage.max_parallel,
            "Stage started"
        );

        let admission = Semaphore::new(stage.max_parallel.max(1));
        let tasks = stage
            .tasks
            .iter()
            .map(|task| self.run_task(stage, task, input, workflow_id, &admission, cancel));
        let results: BTreeMap<String, ToolOutcome> = join_all(tasks).await.into_iter().collect();

        let record = ResultRecord::new(workflow_id, &stage.name, results.clone());
        if let Err(e) = self.store.store_result(&record).await {
            return self
                .fail_stage(stage, workflow_id, e.to_string(), results, started)
                .await;
        }

        if cancel.is_cancelled() {
            return self
                .fail_stage(stage, workflow_id, "cancelled".into(), results, started)
                .await;
        }

        if let Err(e) = self
            .store
            .update_stage_status(workflow_id, &stage.name, StageStatus::Completed, None)
            .await
        {
            return self
                .fail_stage(stage, workflow_id, e.to_string(), results, started)
                .await;
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            workflow_id,
            stage = %stage.name,
            tool_errors = record.error_count(),
            elapsed_ms,
            "Stage completed"
        );
        self.event_bus.publish(PipelineEvent::StageFinished {
            workflow_id: workflow_id.to_string(),
            stage: stage.name.clone(),
            status: StageStatus::Completed,
            error: None,
        });

        StageOutcome {
            stage: stage.name.clone(),
            status: StageStatus::Completed,
            results,
            error: None,
            elapsed_ms,
        }
    }

    async fn fail_stage(
        &self,
        stage: &Stage,
        workflow_id: &str,
        message: String,
        results: BTreeMap<String, ToolOutcome>,
        started: Instant,
    ) -> StageOutcome {
        error!(workflow_id, stage = %stage.name, error = %message, "Stage failed");

        if let Err(e) = self
            .store
            .update_stage_status(workflow_id, &stage.name, StageStatus::Failed, Some(&message))
            .await
        {
            warn!(workflow_id, stage = %stage.name, error = %e, "Failed to persist stage failure");
        }

        self.event_bus.publish(PipelineEvent::StageFinished {
            workflow_id: workflow_id.to_string(),
            stage: stage.name.clone(),
            status: StageStatus::Failed,
            error: Some(message.clone()),
        });

        StageOutcome {
            stage: stage.name.clone(),
            status: StageStatus::Failed,
            results,
            error: Some(message),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn run_task(
        &self,
        stage: &Stage,
        task: &TaskRef,
        input: &Payload,
        workflow_id: &str,
        admission: &Semaphore,
        cancel: &CancellationToken,
    ) -> (String, ToolOutcome) {
        let outcome = match self
            .invoke(stage, task, input, workflow_id, admission, cancel)
            .await
        {
            Ok(output) => ToolOutcome::Success(output),
            Err(e) => {
                warn!(
                    workflow_id,
                    stage = %stage.name,
                    task = %task.name,
                    error = %e,
                    "Tool task failed"
                );
                ToolOutcome::error(e.to_string())
            }
        };
        (task.name.clone(), outcome)
    }

    async fn invoke(
        &self,
        stage: &Stage,
        task: &TaskRef,
        input: &Payload,
        workflow_id: &str,
        admission: &Semaphore,
        cancel: &CancellationToken,
    ) -> Result<Payload> {
        // Stage cap first, then the shared pool.
        let _stage_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PhaseflowError::Cancelled),
            permit = admission.acquire() => permit.map_err(|_| PhaseflowError::Cancelled)?,
        };
        let _pool_permit = self.pool.acquire(cancel).await?;

        let mut tool_input = input.clone();
        for (key, value) in &task.args {
            tool_input.insert(key.clone(), value.clone());
        }

        let ctx = ToolContext {
            workflow_id: workflow_id.to_string(),
            stage_name: stage.name.clone(),
            task_name: task.name.clone(),
            cancel: cancel.child_token(),
        };

        let started = Instant::now();
        let result = self
            .tools
            .execute(&task.tool, tool_input, ctx, stage.timeout())
            .await;

        self.event_bus.publish(PipelineEvent::ToolFinished {
            workflow_id: workflow_id.to_string(),
            stage: stage.name.clone(),
            task: task.name.clone(),
            is_error: result.is_err(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        result
    }

    /// Run one workflow of `pipeline` to completion or failure.
    ///
    /// Errors are returned only when the workflow record itself cannot be
    /// created or closed; stage failures are reported in the outcome.
    pub async fn execute_workflow(
        &self,
        pipeline: &str,
        workflow_id: &str,
        input: Payload,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome> {
        let definition = self
            .pipeline(pipeline)
            .ok_or_else(|| PhaseflowError::PipelineNotFound(pipeline.to_string()))?;
        let waves = group_stages(&definition.stages)?;
        let started_at = Utc::now();

        self.store
            .create_workflow(&Workflow::new(workflow_id, &definition.name, input.clone()))
            .await?;
        if let Err(e) = self
            .store
            .update_workflow_status(workflow_id, WorkflowStatus::Running, None)
            .await
        {
            // Close the record so it does not linger as active.
            let message = format!("workflow could not start: {}", e);
            if let Err(close) = self
                .store
                .update_workflow_status(workflow_id, WorkflowStatus::Failed, Some(&message))
                .await
            {
                warn!(workflow_id, error = %close, "Failed to persist workflow failure");
            }
            return Err(e);
        }

        info!(
            workflow_id,
            pipeline = %definition.name,
            waves = waves.len(),
            "Workflow started"
        );
        self.event_bus.publish(PipelineEvent::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            pipeline: definition.name.clone(),
        });

        let mut outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
        let mut failure: Option<String> = None;

        for (index, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some(format!("cancelled before wave {}", index));
                break;
            }

            self.event_bus.publish(PipelineEvent::WaveStarted {
                workflow_id: workflow_id.to_string(),
                index,
                stages: wave.iter().map(|s| s.name.clone()).collect(),
            });

            let mut recorded: Vec<&Stage> = Vec::with_capacity(wave.len());
            for stage in wave {
                match self
                    .store
                    .create_stage_record(&StageExecutionRecord::pending(workflow_id, stage))
                    .await
                {
                    Ok(()) => recorded.push(*stage),
                    Err(e) => {
                        failure =
                            Some(format!("stage '{}' could not be recorded: {}", stage.name, e));
                        break;
                    }
                }
            }
            if let Some(message) = &failure {
                // Records created earlier in this wave never run.
                for stage in recorded {
                    if let Err(e) = self
                        .store
                        .update_stage_status(
                            workflow_id,
                            &stage.name,
                            StageStatus::Failed,
                            Some(message),
                        )
                        .await
                    {
                        warn!(
                            workflow_id,
                            stage = %stage.name,
                            error = %e,
                            "Failed to persist stage failure"
                        );
                    }
                }
                break;
            }

            let inputs: Vec<Payload> = wave
                .iter()
                .map(|stage| stage_input(&input, stage, &outcomes))
                .collect();

            let results = if definition.sequential {
                let mut results = Vec::with_capacity(wave.len());
                for (stage, stage_input) in wave.iter().zip(&inputs) {
                    results.push(
                        self.execute_stage(stage, stage_input, workflow_id, &cancel)
                            .await,
                    );
                }
                results
            } else {
                join_all(
                    wave.iter()
                        .zip(&inputs)
                        .map(|(stage, stage_input)| {
                            self.execute_stage(stage, stage_input, workflow_id, &cancel)
                        }),
                )
                .await
            };

            for outcome in results {
                if outcome.status == StageStatus::Failed && failure.is_none() {
                    failure = Some(format!(
                        "stage '{}' failed: {}",
                        outcome.stage,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                outcomes.insert(outcome.stage.clone(), outcome);
            }

            if failure.is_some() {
                let skipped = waves.len() - index - 1;
                if skipped > 0 {
                    warn!(workflow_id, skipped_waves = skipped, "Skipping remaining waves");
                }
                break;
            }
        }

        let status = if failure.is_some() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        self.store
            .update_workflow_status(workflow_id, status, failure.as_deref())
            .await?;

        info!(workflow_id, pipeline = %definition.name, %status, "Workflow finished");
        self.event_bus.publish(PipelineEvent::WorkflowFinished {
            workflow_id: workflow_id.to_string(),
            pipeline: definition.name.clone(),
            status,
            error: failure.clone(),
        });

        Ok(WorkflowOutcome {
            workflow_id: workflow_id.to_string(),
            pipeline: definition.name.clone(),
            status,
            waves: wave_names(&waves),
            stages: outcomes,
            error: failure,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

fn wave_names(waves: &[Vec<&Stage>]) -> Vec<Vec<String>> {
    waves
        .iter()
        .map(|wave| wave.iter().map(|s| s.name.clone()).collect())
        .collect()
}

/// Workflow input plus an `upstream` object holding the successful tool
/// outputs of the stage's dependencies.
fn stage_input(input: &Payload, stage: &Stage, done: &BTreeMap<String, StageOutcome>) -> Payload {
    let mut merged = input.clone();
    if stage.dependencies.is_empty() {
        return merged;
    }

    let mut upstream = Payload::new();
    for dep in &stage.dependencies {
        if let Some(outcome) = done.get(dep) {
            let outputs: Payload = outcome
                .results
                .iter()
                .filter_map(|(task, result)| {
                    result
                        .as_success()
                        .map(|p| (task.clone(), Value::Object(p.clone())))
                })
                .collect();
            upstream.insert(dep.clone(), Value::Object(outputs));
        }
    }
    merged.insert("upstream".into(), Value::Object(upstream));
    merged
}
