pub mod coordinator;
pub mod graph;
pub mod pool;
pub mod run_log;
pub mod scheduler;

pub use coordinator::{
    CompletionState, CoordinatorReport, PipelineCoordinator, PipelineOutcome, PipelineStatus,
};
pub use pool::WorkerPool;
pub use run_log::{spawn_run_logger, RunLogger};
pub use scheduler::{StageOutcome, StageScheduler, WorkflowOutcome};
