use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PhaseflowError, Result};
use crate::types::{Payload, PipelineDefinition, Stage, TaskRef};

/// Top-level Phaseflow configuration (`phaseflow.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// JSONL run logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Path to the JSON pipeline file.
    #[serde(default)]
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global worker pool size (total in-flight tool tasks).
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// Per-tool timeout for stages that do not set one.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_tool_timeout_secs: u64,
    /// Per-stage admission cap for stages that do not set one.
    #[serde(default = "default_max_parallel")]
    pub default_max_parallel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: default_max_concurrent_tools(),
            default_tool_timeout_secs: default_tool_timeout_secs(),
            default_max_parallel: default_max_parallel(),
        }
    }
}

fn default_max_concurrent_tools() -> usize { 16 }
fn default_tool_timeout_secs() -> u64 { 30 }
fn default_max_parallel() -> usize { 4 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: ~/.phaseflow/state.db
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.phaseflow/state.db".to_string() }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.phaseflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = workflows, 2 = + stages, 3 = + tools.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 1 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PhaseflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PhaseflowError::Configuration(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the log directory when logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(expand_home(
            log.log_dir.as_deref().unwrap_or("~/.phaseflow/logs"),
        ))
    }

    pub fn pipelines_path(&self) -> Option<PathBuf> {
        self.pipelines.as_deref().map(expand_home)
    }
}

// ── Pipeline file (JSON) ────────────────────────────────────────

/// Declarative pipeline configuration.
///
/// ```json
/// { "pipelines": { "inventory": { "stages": [ { "name": "analyze", "tasks": ["scan"] } ] } },
///   "dependencies": { "reporting": ["inventory"] },
///   "executionConfig": { "maxParallelPipelines": 2 } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineFile {
    pub pipelines: BTreeMap<String, PipelineSpec>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel_pipelines")]
    pub max_parallel_pipelines: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_pipelines: default_max_parallel_pipelines(),
        }
    }
}

fn default_max_parallel_pipelines() -> usize { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A task is either a bare tool name or `{ "name", "tool", "args" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskSpec {
    Tool(String),
    Detailed {
        #[serde(default)]
        name: Option<String>,
        tool: String,
        #[serde(default)]
        args: Payload,
    },
}

impl TaskSpec {
    fn to_task_ref(&self) -> TaskRef {
        match self {
            TaskSpec::Tool(tool) => TaskRef::new(tool.clone()),
            TaskSpec::Detailed { name, tool, args } => {
                TaskRef::named(name.clone().unwrap_or_else(|| tool.clone()), tool.clone())
                    .with_args(args.clone())
            }
        }
    }
}

impl PipelineFile {
    /// Load a pipeline file from JSON, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PhaseflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_json(&expand_env_vars(&content))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PhaseflowError::Configuration(e.to_string()))
    }

    /// Build pipeline definitions, filling stage defaults from `engine` and
    /// folding the top-level dependency map into each definition.
    pub fn definitions(&self, engine: &EngineConfig) -> Result<Vec<PipelineDefinition>> {
        for (name, prereqs) in &self.dependencies {
            if !self.pipelines.contains_key(name) {
                return Err(PhaseflowError::config(format!(
                    "dependency map references unknown pipeline '{}'",
                    name
                )));
            }
            if let Some(missing) = prereqs.iter().find(|p| !self.pipelines.contains_key(*p)) {
                return Err(PhaseflowError::config(format!(
                    "pipeline '{}' depends on unknown pipeline '{}'",
                    name, missing
                )));
            }
        }

        let definitions = self
            .pipelines
            .iter()
            .map(|(name, spec)| {
                let stages = spec
                    .stages
                    .iter()
                    .map(|s| stage_from_spec(s, engine))
                    .collect();

                let mut def = PipelineDefinition::new(name.clone(), stages)
                    .sequential(spec.sequential)
                    .with_priority(spec.priority);
                def.description = spec.description.clone();
                if let Some(prereqs) = self.dependencies.get(name) {
                    def.depends_on.extend(prereqs.iter().cloned());
                }
                def
            })
            .collect();

        Ok(definitions)
    }
}

fn stage_from_spec(spec: &StageSpec, engine: &EngineConfig) -> Stage {
    let mut stage = Stage::new(spec.name.clone())
        .with_max_parallel(spec.max_parallel.unwrap_or(engine.default_max_parallel));
    stage.timeout_ms = spec
        .timeout_secs
        .unwrap_or(engine.default_tool_timeout_secs)
        .saturating_mul(1000);
    stage.agent_type = spec.agent_type.clone();
    stage.tasks = spec.tasks.iter().map(TaskSpec::to_task_ref).collect();
    stage.dependencies = spec.dependencies.iter().cloned().collect();
    stage
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINES: &str = r#"{
        "pipelines": {
            "inventory": {
                "priority": 2,
                "stages": [
                    { "name": "analyze", "agentType": "van", "tasks": ["scan", "count"] },
                    { "name": "plan", "tasks": [{ "name": "outline", "tool": "echo", "args": { "depth": 2 } }],
                      "dependencies": ["analyze"], "maxParallel": 1, "timeoutSecs": 5 }
                ]
            },
            "reporting": { "sequential": true, "stages": [ { "name": "render", "tasks": ["echo"] } ] }
        },
        "dependencies": { "reporting": ["inventory"] },
        "executionConfig": { "maxParallelPipelines": 3 }
    }"#;

    #[test]
    fn test_parse_pipeline_file() {
        let file = PipelineFile::from_json(PIPELINES).unwrap();
        assert_eq!(file.pipelines.len(), 2);
        assert_eq!(file.execution_config.max_parallel_pipelines, 3);

        let defs = file.definitions(&EngineConfig::default()).unwrap();
        let inventory = defs.iter().find(|d| d.name == "inventory").unwrap();
        assert_eq!(inventory.priority, 2);

        let analyze = inventory.stage("analyze").unwrap();
        assert_eq!(analyze.tasks.len(), 2);
        assert_eq!(analyze.agent_type.as_deref(), Some("van"));
        assert_eq!(analyze.max_parallel, 4);
        assert_eq!(analyze.timeout_ms, 30_000);

        let plan = inventory.stage("plan").unwrap();
        assert_eq!(plan.tasks[0].name, "outline");
        assert_eq!(plan.tasks[0].tool, "echo");
        assert_eq!(plan.tasks[0].args["depth"], 2);
        assert_eq!(plan.max_parallel, 1);
        assert_eq!(plan.timeout_ms, 5_000);
        assert!(plan.dependencies.contains("analyze"));

        let reporting = defs.iter().find(|d| d.name == "reporting").unwrap();
        assert!(reporting.sequential);
        assert!(reporting.depends_on.contains("inventory"));
    }

    #[test]
    fn test_default_execution_config() {
        let file = PipelineFile::from_json(r#"{ "pipelines": {} }"#).unwrap();
        assert_eq!(file.execution_config.max_parallel_pipelines, 2);
        assert!(file.dependencies.is_empty());
    }

    #[test]
    fn test_huge_stage_timeout_saturates() {
        let json = r#"{
            "pipelines": { "slow": { "stages": [
                { "name": "load", "tasks": ["echo"], "timeoutSecs": 18446744073709552 }
            ] } }
        }"#;
        let file = PipelineFile::from_json(json).unwrap();
        let defs = file.definitions(&EngineConfig::default()).unwrap();
        assert_eq!(defs[0].stages[0].timeout_ms, u64::MAX);
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let json = r#"{
            "pipelines": { "a": { "stages": [] } },
            "dependencies": { "a": ["ghost"] }
        }"#;
        let file = PipelineFile::from_json(json).unwrap();
        let err = file.definitions(&EngineConfig::default()).unwrap_err();
        assert!(matches!(err, PhaseflowError::Configuration(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_app_config_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrent_tools, 16);
        assert_eq!(config.engine.default_max_parallel, 4);
        assert!(config.log.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_app_config_sections() {
        let config: AppConfig = toml::from_str(
            r#"
pipelines = "/etc/phaseflow/pipelines.json"

[engine]
max_concurrent_tools = 8

[store]
path = "/var/lib/phaseflow/state.db"

[log]
log_dir = "/tmp/phaseflow-logs"
level = 3
"#,
        )
        .unwrap();
        assert_eq!(config.engine.max_concurrent_tools, 8);
        assert_eq!(config.engine.default_tool_timeout_secs, 30);
        assert_eq!(
            config.store_path(),
            PathBuf::from("/var/lib/phaseflow/state.db")
        );
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/phaseflow-logs")));
        assert_eq!(config.log.unwrap().level, 3);
        assert_eq!(
            config.pipelines.as_deref(),
            Some("/etc/phaseflow/pipelines.json")
        );
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown() {
        std::env::set_var("PHASEFLOW_TEST_DB", "/data/pf.db");
        let out = expand_env_vars("path = \"${PHASEFLOW_TEST_DB}\" other = \"${PHASEFLOW_UNSET_VAR}\"");
        assert!(out.contains("/data/pf.db"));
        assert!(out.contains("${PHASEFLOW_UNSET_VAR}"));
    }
}
