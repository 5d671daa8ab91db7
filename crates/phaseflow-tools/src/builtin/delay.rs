use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::Tool;
use phaseflow_core::types::{Payload, ToolContext};

/// Sleeps for `ms` milliseconds. Useful for exercising timeouts and caps.
pub struct DelayTool;

#[derive(Deserialize)]
struct DelayInput {
    #[serde(default = "default_ms")]
    ms: u64,
}

fn default_ms() -> u64 { 100 }

impl Tool for DelayTool {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Sleep for `ms` milliseconds, then return."
    }

    fn execute(&self, input: Payload, ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let params: DelayInput = serde_json::from_value(input.into())
                .map_err(|e| PhaseflowError::ToolValidation(e.to_string()))?;

            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(PhaseflowError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(params.ms)) => {
                    let mut out = Payload::new();
                    out.insert("sleptMs".into(), json!(params.ms));
                    Ok(out)
                }
            }
        })
    }
}
