use futures::future::BoxFuture;

use phaseflow_core::error::Result;
use phaseflow_core::traits::Tool;
use phaseflow_core::types::{Payload, ToolContext};

/// Returns its input unchanged, tagged with the stage and task it ran under.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the stage input unchanged."
    }

    fn execute(&self, input: Payload, ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let mut output = input;
            output.insert("stage".into(), ctx.stage_name.into());
            output.insert("task".into(), ctx.task_name.into());
            Ok(output)
        })
    }
}
