use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use phaseflow_core::event::EventBus;
use phaseflow_core::types::PipelineEvent;

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line. The file
/// is append-only and flushed after every entry, so a crash mid-run leaves
/// every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = pipelines and workflows,
    /// 2 = + waves and stages, 3 = + individual tool tasks.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the log file for `run_id`.
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Run the logger until cancelled or the bus closes.
    ///
    /// Events already queued when `cancel` fires are still written.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: String, cancel: CancellationToken) {
        let rx = event_bus.subscribe();
        self.write_events(rx, run_id, cancel).await;
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<PipelineEvent>,
        run_id: String,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;

                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&run_id, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, run_id: &str, event: &PipelineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str,
                     pipeline: Option<&String>,
                     workflow_id: Option<&String>,
                     detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            pipeline: pipeline.cloned(),
            workflow_id: workflow_id.cloned(),
            detail,
        };

        match event {
            // L1: pipelines and workflows
            PipelineEvent::PipelineLaunched {
                pipeline,
                workflow_id,
            } => Some(entry("pipeline_launched", Some(pipeline), Some(workflow_id), None)),
            PipelineEvent::PipelineDone {
                pipeline,
                succeeded,
            } => Some(entry(
                "pipeline_done",
                Some(pipeline),
                None,
                Some(serde_json::json!({ "succeeded": succeeded })),
            )),
            PipelineEvent::WorkflowStarted {
                workflow_id,
                pipeline,
            } => Some(entry("workflow_started", Some(pipeline), Some(workflow_id), None)),
            PipelineEvent::WorkflowFinished {
                workflow_id,
                pipeline,
                status,
                error,
            } => Some(entry(
                "workflow_finished",
                Some(pipeline),
                Some(workflow_id),
                Some(serde_json::json!({ "status": status, "error": error })),
            )),

            // L2: waves and stages
            PipelineEvent::WaveStarted {
                workflow_id,
                index,
                stages,
            } if self.level >= 2 => Some(entry(
                "wave_started",
                None,
                Some(workflow_id),
                Some(serde_json::json!({ "index": index, "stages": stages })),
            )),
            PipelineEvent::StageStarted { workflow_id, stage } if self.level >= 2 => Some(entry(
                "stage_started",
                None,
                Some(workflow_id),
                Some(serde_json::json!({ "stage": stage })),
            )),
            PipelineEvent::StageFinished {
                workflow_id,
                stage,
                status,
                error,
            } if self.level >= 2 => Some(entry(
                "stage_finished",
                None,
                Some(workflow_id),
                Some(serde_json::json!({ "stage": stage, "status": status, "error": error })),
            )),

            // L3: tool tasks
            PipelineEvent::ToolFinished {
                workflow_id,
                stage,
                task,
                is_error,
                elapsed_ms,
            } if self.level >= 3 => Some(entry(
                "tool_finished",
                None,
                Some(workflow_id),
                Some(serde_json::json!({
                    "stage": stage,
                    "task": task,
                    "is_error": is_error,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            _ => None,
        }
    }
}

/// Spawn a logger for `run_id` when `log_dir` is set. Returns the token that
/// stops it and its join handle.
pub fn spawn_run_logger(
    log_dir: Option<&Path>,
    level: u8,
    event_bus: Arc<EventBus>,
    run_id: String,
) -> Option<(CancellationToken, tokio::task::JoinHandle<()>)> {
    let dir = log_dir?;
    let cancel = CancellationToken::new();
    let logger = RunLogger::new(dir.to_path_buf(), level);
    // Subscribe now so events published before the task is polled are kept.
    let rx = event_bus.subscribe();
    let handle = tokio::spawn(logger.write_events(rx, run_id, cancel.clone()));
    Some((cancel, handle))
}
