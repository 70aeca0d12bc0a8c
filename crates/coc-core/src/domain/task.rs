//! Task, model hints, follow-on declarations and evaluation results.

use serde::{Deserialize, Serialize};

/// Acceptance criteria a response is checked against.
///
/// Every list entry and every set bound counts as one criterion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceCriteria {
    /// Substrings that must appear (case-insensitive).
    pub required: Vec<String>,
    /// Substrings that must not appear (case-insensitive).
    pub forbidden: Vec<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    /// Top-level keys the response must carry when parsed as a JSON object.
    pub json_fields: Vec<String>,
}

impl AcceptanceCriteria {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.forbidden.is_empty()
            && self.min_length.is_none()
            && self.max_length.is_none()
            && self.json_fields.is_empty()
    }
}

/// Arm preference hints carried by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelHints {
    /// Preferred model name, used when the selected arm names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Preferred context size (`short` / `large`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Hand-offs the planner expects. Advisory only: follow-on tasks are
    /// created from the model response's `next_roles`.
    #[serde(alias = "nextRoles", skip_serializing_if = "Vec::is_empty")]
    pub next_roles: Vec<NextRole>,
}

/// A follow-on task declared by a response (or by a task's hints).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRole {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<AcceptanceCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hints: Option<ModelHints>,
}

impl NextRole {
    pub fn new(role: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// Provenance of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    /// Directive text the task serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive_id: Option<String>,
    /// Id of the task that spawned this one (follow-on or escalation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// `escalation` for escalation tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of escalations between this task and its root.
    #[serde(default)]
    pub escalation_depth: u32,
}

/// A discrete unit of work.
///
/// `retries` is the only field the driver mutates after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub role: String,
    #[serde(default)]
    pub payload_id: Option<String>,
    #[serde(default)]
    pub prompt_template_id: Option<String>,
    #[serde(default, rename = "acceptanceSchema")]
    pub acceptance: Option<AcceptanceCriteria>,
    #[serde(default)]
    pub model_hints: ModelHints,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub meta: TaskMeta,
}

impl Task {
    /// Task with the default template (`<role>.tpl`) and empty hints.
    pub fn new(id: impl Into<String>, title: impl Into<String>, role: impl Into<String>) -> Self {
        let role = role.into();
        Self {
            id: id.into(),
            title: title.into(),
            prompt_template_id: Some(default_template_for(&role)),
            role,
            payload_id: None,
            acceptance: None,
            model_hints: ModelHints::default(),
            retries: 0,
            meta: TaskMeta::default(),
        }
    }

    pub fn is_escalation(&self) -> bool {
        self.meta.reason.as_deref() == Some(ESCALATION_REASON)
    }
}

/// `meta.reason` value carried by escalation tasks.
pub const ESCALATION_REASON: &str = "escalation";

/// Template used for escalation tasks unless the debug plan names another.
pub const DEBUG_TEMPLATE: &str = "debug.tpl";

/// Template id used when a task does not name one.
pub fn default_template_for(role: &str) -> String {
    format!("{role}.tpl")
}

/// Output of one model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub next_roles: Vec<NextRole>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// What a model's debug plan contributes to an escalation task.
///
/// The escalation role always comes from the directive policy; the stub only
/// refines title, template and payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStub {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prompt_template_id: Option<String>,
    #[serde(default)]
    pub payload_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Score of one response. Ephemeral; only ever persisted via the trace log.
///
/// `score` and `passed` are derived independently, so the driver applies its
/// own approval threshold to `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f64,
    pub passed: bool,
    /// Failed criteria, empty on a clean pass.
    pub details: Vec<String>,
}

impl EvaluationResult {
    pub fn pass(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            passed: true,
            details: Vec::new(),
        }
    }

    pub fn fail(score: f64, details: Vec<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            passed: false,
            details,
        }
    }

    /// Zero-scored result for a failed collaborator call.
    pub fn infrastructure(stage: &str, detail: &str) -> Self {
        Self::fail(0.0, vec![format!("infrastructure: {stage}: {detail}")])
    }

    pub fn is_infrastructure(&self) -> bool {
        self.details
            .iter()
            .any(|d| d.starts_with("infrastructure:"))
    }
}
