use futures::future::BoxFuture;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::Tool;
use phaseflow_core::types::{Payload, ToolContext};

/// Always fails with `message` (or a default). Handy for dry runs of
/// error isolation.
pub struct FailTool;

impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail with the given `message`."
    }

    fn execute(&self, input: Payload, _ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let message = input
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("requested failure")
                .to_string();
            Err(PhaseflowError::ToolExecution {
                tool: "fail".into(),
                message,
            })
        })
    }
}
