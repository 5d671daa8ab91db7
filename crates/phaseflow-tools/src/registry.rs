use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::traits::Tool;
use phaseflow_core::types::{Payload, ToolContext};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool instance.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a tool by name, bounded by `timeout` and the context's
    /// cancellation token. Only the tool's own run is timed.
    pub async fn execute(
        &self,
        name: &str,
        input: Payload,
        ctx: ToolContext,
        timeout: Duration,
    ) -> Result<Payload> {
        let tool = self
            .get(name)
            .ok_or_else(|| PhaseflowError::ToolNotFound(name.to_string()))?;

        let cancel = ctx.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(PhaseflowError::Cancelled),
            result = tokio::time::timeout(timeout, tool.execute(input, ctx)) => match result {
                Ok(result) => result,
                Err(_) => Err(PhaseflowError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::echo::EchoTool);
        registry.register(crate::builtin::delay::DelayTool);
        registry.register(crate::builtin::fail::FailTool);
        registry.register(crate::builtin::shell::ShellTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_test_utils::{FailingTool, SlowTool, StaticTool};
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::detached("analyze", "task")
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["delay", "echo", "fail", "shell"]);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("scan"));
    }

    #[tokio::test]
    async fn test_unregister_removes_tool() {
        let mut registry = ToolRegistry::with_builtins();
        assert!(registry.unregister("shell"));
        assert!(!registry.unregister("shell"));
        assert_eq!(registry.list(), vec!["delay", "echo", "fail"]);

        let err = registry
            .execute("shell", Payload::new(), ctx(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("ghost", Payload::new(), ctx(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_returns_tool_output() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("count", json!({ "rows": 12 })));
        let out = registry
            .execute("count", Payload::new(), ctx(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["rows"], 12);
    }

    #[tokio::test]
    async fn test_execute_propagates_tool_error() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool::new("lint", "syntax error"));
        let err = registry
            .execute("lint", Payload::new(), ctx(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool::new("sleepy", Duration::from_secs(10)));
        let err = registry
            .execute("sleepy", Payload::new(), ctx(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PhaseflowError::ToolTimeout { timeout_ms: 100, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_honors_cancellation() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool::new("sleepy", Duration::from_secs(10)));
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = registry
            .execute("sleepy", Payload::new(), ctx, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::Cancelled));
    }
}
