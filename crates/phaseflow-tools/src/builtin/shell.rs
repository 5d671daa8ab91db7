use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::Tool;
use phaseflow_core::types::{Payload, ToolContext};

const MAX_OUTPUT: usize = 30_000;

/// Runs `command` through `sh -c`. A non-zero exit is a tool error.
pub struct ShellTool;

#[derive(Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... (output truncated)");
    }
    s
}

impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command. Returns stdout, stderr, and the exit code."
    }

    fn execute(&self, input: Payload, ctx: ToolContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let params: ShellInput = serde_json::from_value(input.into())
                .map_err(|e| PhaseflowError::ToolValidation(e.to_string()))?;

            debug!(command = %params.command, stage = %ctx.stage_name, "Executing shell command");

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&params.command).kill_on_drop(true);
            if let Some(cwd) = &params.cwd {
                cmd.current_dir(cwd);
            }

            let output = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PhaseflowError::Cancelled),
                output = cmd.output() => output.map_err(|e| PhaseflowError::ToolExecution {
                    tool: "shell".into(),
                    message: e.to_string(),
                })?,
            };

            let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
            let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
            let code = output.status.code().unwrap_or(-1);

            if !output.status.success() {
                return Err(PhaseflowError::ToolExecution {
                    tool: "shell".into(),
                    message: format!("Exit code {}\n{}", code, stderr.trim_end()),
                });
            }

            let mut out = Payload::new();
            out.insert("stdout".into(), json!(stdout));
            out.insert("stderr".into(), json!(stderr));
            out.insert("exitCode".into(), json!(code));
            Ok(out)
        })
    }
}
