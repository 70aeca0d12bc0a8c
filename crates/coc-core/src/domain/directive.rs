//! DirectiveSpec: the planner's output, consumed once to seed the queue.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::task::{default_template_for, AcceptanceCriteria, ModelHints, Task, TaskMeta};
use crate::error::{CocError, Result};

/// `metadata` block of a DirectiveSpec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One entry of the `spec` sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDecl {
    pub id: String,
    pub title: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<AcceptanceCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hints: Option<ModelHints>,
}

impl TaskDecl {
    pub fn new(id: impl Into<String>, title: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            role: role.into(),
            payload_id: None,
            prompt_template_id: None,
            acceptance: None,
            model_hints: None,
        }
    }

    /// Materialize the declaration as a fresh task of directive `directive_id`.
    pub fn to_task(&self, directive: &str, directive_id: &str) -> Task {
        Task {
            id: self.id.clone(),
            title: self.title.clone(),
            role: self.role.clone(),
            payload_id: self.payload_id.clone(),
            prompt_template_id: Some(
                self.prompt_template_id
                    .clone()
                    .unwrap_or_else(|| default_template_for(&self.role)),
            ),
            acceptance: self.acceptance.clone(),
            model_hints: self.model_hints.clone().unwrap_or_default(),
            retries: 0,
            meta: TaskMeta {
                directive: Some(directive.to_string()),
                directive_id: Some(directive_id.to_string()),
                ..TaskMeta::default()
            },
        }
    }
}

/// Directive-wide policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    /// Minimum score for a task to count as done.
    pub approval_threshold: f64,
    /// Requeues allowed before a failing task escalates.
    pub retry_on_failure: u32,
    /// Role that receives escalation tasks.
    pub lead_role: String,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Fractional jitter applied to each retry delay, in [0, 1].
    pub retry_jitter: f64,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            approval_threshold: 0.8,
            retry_on_failure: 2,
            lead_role: "department-lead".to_string(),
            retry_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 60_000,
            retry_jitter: 0.1,
        }
    }
}

/// Parsed plan for one directive. Immutable once validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveSpec {
    #[serde(default)]
    pub metadata: DirectiveMetadata,
    #[serde(default)]
    pub spec: Vec<TaskDecl>,
    #[serde(default)]
    pub policies: Policies,
}

impl DirectiveSpec {
    /// Parse and validate a YAML document. A blank document is an empty plan.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let spec: DirectiveSpec = serde_yaml::from_str(text)
            .map_err(|e| CocError::InvalidSpec(format!("yaml: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| CocError::Serialization(e.to_string()))
    }

    /// Check policy ranges and task declarations.
    pub fn validate(&self) -> Result<()> {
        let p = &self.policies;
        if !(0.0..=1.0).contains(&p.approval_threshold) {
            return Err(CocError::InvalidSpec(format!(
                "approval_threshold must be in [0, 1], got {}",
                p.approval_threshold
            )));
        }
        if p.lead_role.trim().is_empty() {
            return Err(CocError::InvalidSpec("lead_role must not be empty".into()));
        }
        if !p.backoff_multiplier.is_finite() || p.backoff_multiplier < 1.0 {
            return Err(CocError::InvalidSpec(format!(
                "backoff_multiplier must be >= 1, got {}",
                p.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&p.retry_jitter) {
            return Err(CocError::InvalidSpec(format!(
                "retry_jitter must be in [0, 1], got {}",
                p.retry_jitter
            )));
        }

        let mut seen = HashSet::new();
        for decl in &self.spec {
            if decl.id.trim().is_empty() {
                return Err(CocError::InvalidSpec("task id must not be empty".into()));
            }
            if decl.role.trim().is_empty() {
                return Err(CocError::InvalidSpec(format!("task {} has no role", decl.id)));
            }
            if !seen.insert(decl.id.as_str()) {
                return Err(CocError::InvalidSpec(format!("duplicate task id {}", decl.id)));
            }
        }
        Ok(())
    }

    /// Declared directive id, or a generated `dir-<uuid>` one.
    pub fn directive_id(&self) -> String {
        self.metadata
            .directive_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("dir-{}", uuid::Uuid::new_v4().simple()))
    }
}
