//! Collaborator seams: model registry, model handles and the retriever.
//!
//! The engine depends only on these traits, never on a concrete execution or
//! retrieval backend. Implementations return `anyhow::Result`; the driver
//! turns every error into a scored infrastructure failure.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EscalationStub, EvaluationResult, ModelResponse, Task};

/// Arguments to [`ModelRegistry::pick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PickRequest {
    pub role: String,
    /// Model name preferred by the selected arm.
    pub name_hint: Option<String>,
    /// Context size preferred by the selected arm (`short` / `large`).
    pub context_hint: Option<String>,
}

impl PickRequest {
    pub fn for_role(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_hint = Some(context.into());
        self
    }
}

/// An executable model.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Name recorded on `model.call.*` trace lines.
    fn name(&self) -> &str;

    /// Expand a directive into DirectiveSpec YAML (planner role only).
    async fn generate_spec(&self, directive: &str, meta: &serde_json::Value)
        -> anyhow::Result<String>;

    /// Execute a rendered prompt.
    async fn run(&self, prompt: &str) -> anyhow::Result<ModelResponse>;

    /// Propose an escalation for a task whose retries are exhausted.
    async fn debug_plan(
        &self,
        task: &Task,
        _response: Option<&ModelResponse>,
        eval: &EvaluationResult,
    ) -> anyhow::Result<EscalationStub> {
        Ok(EscalationStub {
            title: Some(format!("Debug {}", task.title)),
            notes: (!eval.details.is_empty()).then(|| eval.details.join("; ")),
            ..EscalationStub::default()
        })
    }
}

/// Resolves `(role, arm hints)` into a model handle.
pub trait ModelRegistry: Send + Sync {
    fn pick(&self, request: &PickRequest) -> anyhow::Result<Arc<dyn ModelHandle>>;
}

/// Retrieval request for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalQuery {
    pub query: String,
    pub payload_id: Option<String>,
    pub top_k: usize,
}

/// A context document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Document retrieval and artifact indexing.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<Document>>;

    async fn index(&self, id: &str, content: &str, metadata: serde_json::Value)
        -> anyhow::Result<()>;
}
