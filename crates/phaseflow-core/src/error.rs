use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhaseflowError {
    // Config errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Execution errors
    #[error("Stage execution failed: {stage}: {message}")]
    StageExecution { stage: String, message: String },

    #[error("Pipeline execution failed: {pipeline}: {message}")]
    PipelineExecution { pipeline: String, message: String },

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid status transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Execution cancelled")]
    Cancelled,

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhaseflowError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PhaseflowError>;
