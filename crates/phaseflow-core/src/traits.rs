use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// An opaque callable invoked by a stage.
///
/// The scheduler knows nothing about what a tool does; it only times it out,
/// records its result map or error, and hands it a cancellation token.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (referenced from stage task lists).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute the tool with the merged stage input.
    fn execute(&self, input: Payload, ctx: ToolContext) -> BoxFuture<'_, Result<Payload>>;
}

/// Persistence for workflow, stage and result records.
///
/// Every write is a single-entity operation. Concurrent writers to the same
/// key are last-write-wins.
pub trait StateStore: Send + Sync + 'static {
    /// Ensure tables, uniqueness constraints, and lookup indexes exist.
    /// Calling it again is a no-op.
    fn init_schema(&self) -> BoxFuture<'_, Result<()>>;

    fn create_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    /// Move a workflow to `status`. Terminal workflows are never reopened.
    fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>>;

    fn create_stage_record(&self, record: &StageExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Move a stage record to `status`, stamping `started_at` on `running`
    /// and `finished_at` on a terminal status.
    fn update_stage_status(
        &self,
        workflow_id: &str,
        stage_name: &str,
        status: StageStatus,
        error: Option<&str>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Append a result record. Records are never updated.
    fn store_result(&self, record: &ResultRecord) -> BoxFuture<'_, Result<()>>;

    /// Workflow + stage records + results (newest first).
    fn get_workflow_state(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowState>>>;

    /// Workflows that are `initialized` or `running`.
    fn list_active_workflows(&self) -> BoxFuture<'_, Result<Vec<Workflow>>>;
}
