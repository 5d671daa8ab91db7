//! Cross-phase handover contract.
//!
//! Five fixed phases form a cycle (van → plan → create → implement → review →
//! van). A [`HandoverDocument`] carries context from one phase to the next;
//! [`PhaseEndpoint`] gates phase advancement and [`AgentResponsibility`]
//! describes what each phase's agent may and may not do.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{PhaseflowError, Result};
use crate::types::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Van,
    Plan,
    Create,
    Implement,
    Review,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Van,
        Phase::Plan,
        Phase::Create,
        Phase::Implement,
        Phase::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Van => "van",
            Self::Plan => "plan",
            Self::Create => "create",
            Self::Implement => "implement",
            Self::Review => "review",
        }
    }

    /// Next phase in the cycle; review wraps back to van.
    pub fn next(&self) -> Phase {
        match self {
            Self::Van => Self::Plan,
            Self::Plan => Self::Create,
            Self::Create => Self::Implement,
            Self::Implement => Self::Review,
            Self::Review => Self::Van,
        }
    }

    pub fn agent_id(&self) -> String {
        format!("{}-agent", self.as_str())
    }

    pub fn endpoint(&self) -> PhaseEndpoint {
        PhaseEndpoint::for_phase(*self)
    }

    pub fn responsibility(&self) -> AgentResponsibility {
        AgentResponsibility::for_phase(*self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "van" => Ok(Self::Van),
            "plan" => Ok(Self::Plan),
            "create" => Ok(Self::Create),
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            other => Err(PhaseflowError::config(format!("unknown phase '{}'", other))),
        }
    }
}

/// Free text or a list of bullet lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Summary {
    Text(String),
    Lines(Vec<String>),
}

impl From<&str> for Summary {
    fn from(s: &str) -> Self {
        Summary::Text(s.to_string())
    }
}

impl From<String> for Summary {
    fn from(s: String) -> Self {
        Summary::Text(s)
    }
}

impl From<Vec<String>> for Summary {
    fn from(lines: Vec<String>) -> Self {
        Summary::Lines(lines)
    }
}

/// Context handed from one phase to the next. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoverDocument {
    pub phase: Phase,
    pub task_name: String,
    pub summary: Summary,
    #[serde(default)]
    pub context: Payload,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub source_agent_id: String,
    pub target_agent_id: String,
}

impl HandoverDocument {
    /// Start a document for `phase`, addressed from its agent to the next
    /// phase's agent.
    pub fn new(phase: Phase, task_name: impl Into<String>, summary: impl Into<Summary>) -> Self {
        Self {
            phase,
            task_name: task_name.into(),
            summary: summary.into(),
            context: Payload::new(),
            recommendations: vec![],
            metrics: BTreeMap::new(),
            source_agent_id: phase.agent_id(),
            target_agent_id: phase.next().agent_id(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Produce the document for the following phase.
    ///
    /// The prior context is nested under `previousContext` with the prior
    /// phase recorded at `previousContext.phase`.
    pub fn next_phase(&self) -> HandoverDocument {
        let next = self.phase.next();

        let mut previous = self.context.clone();
        previous.insert("phase".into(), Value::String(self.phase.as_str().into()));

        let mut context = Payload::new();
        context.insert("previousPhase".into(), Value::String(self.phase.as_str().into()));
        context.insert("previousContext".into(), Value::Object(previous));

        HandoverDocument {
            phase: next,
            task_name: format!("Next step for {}", self.task_name),
            summary: Summary::Text(format!("Processed {} phase", self.phase)),
            context,
            recommendations: vec![format!("Continue with {} phase", next)],
            metrics: BTreeMap::new(),
            source_agent_id: self.phase.agent_id(),
            target_agent_id: next.agent_id(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ── Completion gates ────────────────────────────────────────────

/// When a phase is considered complete.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseEndpoint {
    pub phase: Phase,
    pub required_outputs: &'static [&'static str],
    /// Keys that must be present with exactly this value.
    pub success_criteria: &'static [(&'static str, bool)],
    /// Metrics that must be present and at least this value.
    pub quality_thresholds: &'static [(&'static str, f64)],
}

/// One unmet completion condition.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionGap {
    MissingOutput(String),
    CriterionNotMet { key: String, expected: bool },
    BelowThreshold { metric: String, minimum: f64, actual: Option<f64> },
}

impl fmt::Display for CompletionGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutput(key) => write!(f, "missing required output: {}", key),
            Self::CriterionNotMet { key, expected } => {
                write!(f, "success criterion not met: {} (expected {})", key, expected)
            }
            Self::BelowThreshold { metric, minimum, actual: Some(v) } => {
                write!(f, "quality threshold not met: {} = {} < {}", metric, v, minimum)
            }
            Self::BelowThreshold { metric, minimum, actual: None } => {
                write!(f, "quality threshold not met: {} missing (min {})", metric, minimum)
            }
        }
    }
}

impl PhaseEndpoint {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Van => Self {
                phase,
                required_outputs: &[
                    "system_analysis",
                    "data_insights",
                    "requirement_validation",
                    "metrics_collection",
                ],
                success_criteria: &[
                    ("analysis_complete", true),
                    ("insights_identified", true),
                    ("requirements_validated", true),
                    ("metrics_collected", true),
                ],
                quality_thresholds: &[
                    ("analysis_coverage", 0.8),
                    ("validation_accuracy", 0.9),
                    ("insight_relevance", 0.7),
                ],
            },
            Phase::Plan => Self {
                phase,
                required_outputs: &[
                    "strategic_plan",
                    "task_prioritization",
                    "resource_allocation",
                    "technical_requirements",
                ],
                success_criteria: &[
                    ("plan_complete", true),
                    ("tasks_prioritized", true),
                    ("resources_allocated", true),
                    ("requirements_defined", true),
                ],
                quality_thresholds: &[
                    ("plan_coherence", 0.8),
                    ("requirement_clarity", 0.9),
                    ("resource_efficiency", 0.7),
                ],
            },
            Phase::Create => Self {
                phase,
                required_outputs: &[
                    "implementation_code",
                    "technical_specifications",
                    "ui_ux_designs",
                    "database_schemas",
                ],
                success_criteria: &[
                    ("code_created", true),
                    ("specifications_complete", true),
                    ("designs_finalized", true),
                    ("schemas_defined", true),
                ],
                quality_thresholds: &[
                    ("code_quality", 0.8),
                    ("specification_clarity", 0.9),
                    ("design_usability", 0.8),
                ],
            },
            Phase::Implement => Self {
                phase,
                required_outputs: &[
                    "deployed_solution",
                    "integration_tests",
                    "configuration_documentation",
                    "implementation_notes",
                ],
                success_criteria: &[
                    ("solution_deployed", true),
                    ("integration_tested", true),
                    ("documentation_complete", true),
                    ("implementation_verified", true),
                ],
                quality_thresholds: &[
                    ("deployment_success", 0.9),
                    ("test_coverage", 0.8),
                    ("documentation_quality", 0.7),
                ],
            },
            Phase::Review => Self {
                phase,
                required_outputs: &[
                    "evaluation_report",
                    "test_results",
                    "issue_tracking",
                    "improvement_recommendations",
                ],
                success_criteria: &[
                    ("evaluation_complete", true),
                    ("testing_complete", true),
                    ("issues_identified", true),
                    ("recommendations_provided", true),
                ],
                quality_thresholds: &[
                    ("evaluation_thoroughness", 0.8),
                    ("test_coverage", 0.9),
                    ("recommendation_quality", 0.8),
                ],
            },
        }
    }

    /// Every unmet condition, in check order.
    pub fn completion_gaps(&self, outputs: &Payload) -> Vec<CompletionGap> {
        let mut gaps = Vec::new();

        for key in self.required_outputs {
            if !outputs.contains_key(*key) {
                gaps.push(CompletionGap::MissingOutput((*key).to_string()));
            }
        }

        for (key, expected) in self.success_criteria {
            if outputs.get(*key) != Some(&Value::Bool(*expected)) {
                gaps.push(CompletionGap::CriterionNotMet {
                    key: (*key).to_string(),
                    expected: *expected,
                });
            }
        }

        for (metric, minimum) in self.quality_thresholds {
            let actual = outputs.get(*metric).and_then(Value::as_f64);
            if !actual.is_some_and(|v| v >= *minimum) {
                gaps.push(CompletionGap::BelowThreshold {
                    metric: (*metric).to_string(),
                    minimum: *minimum,
                    actual,
                });
            }
        }

        gaps
    }

    /// Phase-advancement gate. Logs each unmet condition.
    pub fn validate(&self, outputs: &Payload) -> bool {
        let gaps = self.completion_gaps(outputs);
        for gap in &gaps {
            warn!(phase = %self.phase, "{}", gap);
        }
        gaps.is_empty()
    }
}

/// Shorthand for `PhaseEndpoint::for_phase(phase).validate(outputs)`.
pub fn validate_phase_completion(phase: Phase, outputs: &Payload) -> bool {
    PhaseEndpoint::for_phase(phase).validate(outputs)
}

// ── Responsibilities ────────────────────────────────────────────

/// Static capability contract for a phase's agent. Not enforced by the
/// scheduler.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentResponsibility {
    pub phase: Phase,
    pub primary_tasks: &'static [&'static str],
    pub allowed_actions: &'static [&'static str],
    pub forbidden_actions: &'static [&'static str],
    pub output_formats: &'static [&'static str],
}

impl AgentResponsibility {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Van => Self {
                phase,
                primary_tasks: &[
                    "Analyze system state and data",
                    "Identify patterns and anomalies",
                    "Validate requirements against implementation",
                    "Collect metrics and detect issues",
                ],
                allowed_actions: &[
                    "Read system data and logs",
                    "Analyze performance metrics",
                    "Compare requirements to implementation",
                    "Generate analytical reports",
                ],
                forbidden_actions: &[
                    "Write or modify code",
                    "Create design documents",
                    "Make implementation decisions",
                    "Deploy or execute code",
                ],
                output_formats: &[
                    "Analysis reports",
                    "Data visualizations",
                    "Validation results",
                    "Metric dashboards",
                ],
            },
            Phase::Plan => Self {
                phase,
                primary_tasks: &[
                    "Create strategic plans",
                    "Prioritize tasks and allocate resources",
                    "Establish milestones and timelines",
                    "Define technical requirements",
                ],
                allowed_actions: &[
                    "Create project plans",
                    "Define resource requirements",
                    "Establish success criteria",
                    "Create technical specifications",
                ],
                forbidden_actions: &[
                    "Write or modify code",
                    "Execute plans or deploy solutions",
                    "Modify existing systems",
                    "Make implementation decisions",
                ],
                output_formats: &[
                    "Project plans",
                    "Resource allocation documents",
                    "Technical requirement specifications",
                    "Timeline charts",
                ],
            },
            Phase::Create => Self {
                phase,
                primary_tasks: &[
                    "Generate code and implementation designs",
                    "Create technical specifications",
                    "Design UI/UX components",
                    "Develop database schemas",
                ],
                allowed_actions: &[
                    "Write code",
                    "Create design documents",
                    "Develop technical specifications",
                    "Create database models",
                ],
                forbidden_actions: &[
                    "Deploy or execute code",
                    "Modify production systems",
                    "Make architectural decisions not in plan",
                    "Change project scope",
                ],
                output_formats: &[
                    "Source code",
                    "Technical specifications",
                    "UI/UX designs",
                    "Database schemas",
                ],
            },
            Phase::Implement => Self {
                phase,
                primary_tasks: &[
                    "Execute plans and implement code",
                    "Integrate components and systems",
                    "Deploy solutions and configure environments",
                    "Test functionality and fix issues",
                ],
                allowed_actions: &[
                    "Deploy code and systems",
                    "Configure environments",
                    "Integrate components",
                    "Test implementations",
                ],
                forbidden_actions: &[
                    "Create new designs or architectures",
                    "Change project requirements",
                    "Modify code beyond implementation scope",
                    "Skip testing procedures",
                ],
                output_formats: &[
                    "Deployed systems",
                    "Integration test reports",
                    "Configuration documentation",
                    "Implementation notes",
                ],
            },
            Phase::Review => Self {
                phase,
                primary_tasks: &[
                    "Evaluate implementations against requirements",
                    "Test functionality and performance",
                    "Identify bugs and issues",
                    "Provide feedback for improvement",
                ],
                allowed_actions: &[
                    "Test implementations",
                    "Evaluate performance",
                    "Identify issues",
                    "Recommend improvements",
                ],
                forbidden_actions: &[
                    "Implement fixes or changes",
                    "Modify existing code",
                    "Deploy or execute code",
                    "Make implementation decisions",
                ],
                output_formats: &[
                    "Evaluation reports",
                    "Test results",
                    "Issue tracking",
                    "Improvement recommendations",
                ],
            },
        }
    }

    /// Whether `action` is on the allow list and not on the deny list.
    /// Comparison ignores ASCII case.
    pub fn permits(&self, action: &str) -> bool {
        let matches = |list: &[&str]| list.iter().any(|a| a.eq_ignore_ascii_case(action.trim()));
        matches(self.allowed_actions) && !matches(self.forbidden_actions)
    }
}
