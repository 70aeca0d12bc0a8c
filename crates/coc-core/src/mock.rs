//! In-process collaborators.
//!
//! `MockModelRegistry` and `MemoryRetriever` back `COC_MODE=mock` runs and
//! are deterministic for a given seed. `ScriptedModelRegistry` and
//! `ScriptedEvaluator` drive tests step by step.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use coc_state::ContentDigest;

use crate::config::OrchestratorConfig;
use crate::domain::{
    DirectiveMetadata, DirectiveSpec, EvaluationResult, ModelHints, ModelResponse, NextRole,
    Policies, Task, TaskDecl,
};
use crate::evaluator::Evaluator;
use crate::registry::{Document, ModelHandle, ModelRegistry, PickRequest, RetrievalQuery, Retriever};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Mock registry
// ---------------------------------------------------------------------------

/// Seeded fake model provider.
///
/// Every handle shares one RNG, so a run with a fixed seed and
/// `max_concurrent = 1` produces the same responses every time.
#[derive(Clone)]
pub struct MockModelRegistry {
    rng: Arc<Mutex<StdRng>>,
    failure_rate: f64,
    latency: Duration,
}

impl MockModelRegistry {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            failure_rate: 0.0,
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.mock_seed)
            .with_failure_rate(config.mock_failure_rate)
            .with_latency(config.mock_latency)
    }

    /// Probability that `run` returns placeholder output.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl ModelRegistry for MockModelRegistry {
    fn pick(&self, request: &PickRequest) -> anyhow::Result<Arc<dyn ModelHandle>> {
        let name = request.name_hint.clone().unwrap_or_else(|| {
            format!(
                "mock-{}-{}",
                request.role,
                request.context_hint.as_deref().unwrap_or("short")
            )
        });
        Ok(Arc::new(MockModelHandle {
            name,
            role: request.role.clone(),
            rng: Arc::clone(&self.rng),
            failure_rate: self.failure_rate,
            latency: self.latency,
        }))
    }
}

pub struct MockModelHandle {
    name: String,
    role: String,
    rng: Arc<Mutex<StdRng>>,
    failure_rate: f64,
    latency: Duration,
}

impl MockModelHandle {
    fn inject_failure(&self) -> bool {
        self.failure_rate > 0.0 && lock(&self.rng).gen::<f64>() < self.failure_rate
    }
}

#[async_trait]
impl ModelHandle for MockModelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    /// Two-step plan: an architect task, whose response hands off to a
    /// worker, then a reviewer.
    async fn generate_spec(
        &self,
        directive: &str,
        meta: &serde_json::Value,
    ) -> anyhow::Result<String> {
        let digest = ContentDigest::from_bytes(directive.as_bytes());
        let directive_id = meta
            .get("directive_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("dir-{}", digest.short()));

        let mut design = TaskDecl::new("t1-design", format!("Design: {directive}"), "architect");
        design.model_hints = Some(ModelHints {
            context: Some("large".to_string()),
            ..ModelHints::default()
        });
        let review = TaskDecl::new("t2-review", format!("Review: {directive}"), "reviewer");

        let spec = DirectiveSpec {
            metadata: DirectiveMetadata {
                directive_id: Some(directive_id),
                title: Some(directive.to_string()),
            },
            spec: vec![design, review],
            policies: Policies::default(),
        };
        spec.to_yaml().context("render mock plan")
    }

    async fn run(&self, prompt: &str) -> anyhow::Result<ModelResponse> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let digest = ContentDigest::from_bytes(prompt.as_bytes());
        if self.inject_failure() {
            return Ok(ModelResponse::text(format!(
                "PLACEHOLDER: {} produced no output for {}",
                self.name,
                digest.short()
            )));
        }
        let mut response = ModelResponse::text(format!(
            "[{}] completed request {} ({} prompt chars)",
            self.name,
            digest.short(),
            prompt.chars().count()
        ));
        response.artifact_uri = Some(format!("mock://{}/{}", self.name, digest.short()));
        if self.role == "architect" {
            response.next_roles = vec![NextRole::new(
                "worker",
                "Implement the architect's design",
            )];
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Memory retriever
// ---------------------------------------------------------------------------

/// Keyword retriever over an in-memory document list.
///
/// Score is the share of query terms (three or more characters) found in the
/// document, plus one when the document id equals the query's payload id.
#[derive(Default)]
pub struct MemoryRetriever {
    docs: Mutex<Vec<Document>>,
    index_calls: AtomicUsize,
}

impl MemoryRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: Vec<Document>) -> Self {
        Self {
            docs: Mutex::new(docs),
            index_calls: AtomicUsize::new(0),
        }
    }

    pub fn index_count(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn documents(&self) -> Vec<Document> {
        lock(&self.docs).clone()
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for MemoryRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<Document>> {
        let wanted = terms(&query.query);
        let docs = lock(&self.docs);
        let mut hits: Vec<Document> = docs
            .iter()
            .filter_map(|doc| {
                let content = doc.content.to_lowercase();
                let mut score = if wanted.is_empty() {
                    0.0
                } else {
                    wanted.iter().filter(|t| content.contains(t.as_str())).count() as f64
                        / wanted.len() as f64
                };
                if query.payload_id.as_deref() == Some(doc.id.as_str()) {
                    score += 1.0;
                }
                (score > 0.0).then(|| Document {
                    score,
                    ..doc.clone()
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn index(
        &self,
        id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        let doc = Document {
            id: id.to_string(),
            content: content.to_string(),
            score: 0.0,
            metadata,
        };
        let mut docs = lock(&self.docs);
        match docs.iter_mut().find(|d| d.id == id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// One scripted reaction of a model handle.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ModelResponse),
    Fail(String),
    /// Never completes; exercises timeouts and cancellation.
    Hang,
}

#[derive(Default)]
struct ScriptState {
    steps: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    fallback: Mutex<Option<ModelResponse>>,
    plan: Mutex<Option<String>>,
    picks: Mutex<Vec<PickRequest>>,
    runs: AtomicUsize,
    plans: AtomicUsize,
}

/// Registry whose handles replay per-role scripts. Once a role's script is
/// exhausted its handle answers with the fallback response (`"ok"` unless
/// set).
#[derive(Clone, Default)]
pub struct ScriptedModelRegistry {
    state: Arc<ScriptState>,
}

impl ScriptedModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// YAML returned by the planner role.
    pub fn with_plan(self, yaml: impl Into<String>) -> Self {
        *lock(&self.state.plan) = Some(yaml.into());
        self
    }

    pub fn with_fallback(self, response: ModelResponse) -> Self {
        *lock(&self.state.fallback) = Some(response);
        self
    }

    pub fn script(self, role: &str, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        lock(&self.state.steps)
            .entry(role.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Number of `run` calls across all handles.
    pub fn run_count(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn plan_count(&self) -> usize {
        self.state.plans.load(Ordering::SeqCst)
    }

    pub fn picks(&self) -> Vec<PickRequest> {
        lock(&self.state.picks).clone()
    }
}

impl ModelRegistry for ScriptedModelRegistry {
    fn pick(&self, request: &PickRequest) -> anyhow::Result<Arc<dyn ModelHandle>> {
        lock(&self.state.picks).push(request.clone());
        Ok(Arc::new(ScriptedHandle {
            role: request.role.clone(),
            name: request
                .name_hint
                .clone()
                .unwrap_or_else(|| format!("scripted-{}", request.role)),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedHandle {
    role: String,
    name: String,
    state: Arc<ScriptState>,
}

#[async_trait]
impl ModelHandle for ScriptedHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_spec(
        &self,
        _directive: &str,
        _meta: &serde_json::Value,
    ) -> anyhow::Result<String> {
        self.state.plans.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.plan)
            .clone()
            .ok_or_else(|| anyhow!("no plan scripted"))
    }

    async fn run(&self, _prompt: &str) -> anyhow::Result<ModelResponse> {
        self.state.runs.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.state.steps)
            .get_mut(&self.role)
            .and_then(VecDeque::pop_front);
        match step {
            Some(ScriptStep::Respond(response)) => Ok(response),
            Some(ScriptStep::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Ok(lock(&self.state.fallback)
                .clone()
                .unwrap_or_else(|| ModelResponse::text("ok"))),
        }
    }
}

/// Evaluator returning queued scores, then a default.
pub struct ScriptedEvaluator {
    scores: Mutex<VecDeque<f64>>,
    default: f64,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn constant(score: f64) -> Self {
        Self::sequence([], score)
    }

    pub fn sequence(scores: impl IntoIterator<Item = f64>, then: f64) -> Self {
        Self {
            scores: Mutex::new(scores.into_iter().collect()),
            default: then,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, _task: &Task, _response: &ModelResponse) -> EvaluationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let score = lock(&self.scores).pop_front().unwrap_or(self.default);
        if score >= 0.8 {
            EvaluationResult::pass(score)
        } else {
            EvaluationResult::fail(score, vec!["scripted score".to_string()])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::PlaceholderEvaluator;

    #[tokio::test]
    async fn mock_plan_parses_and_hands_off() {
        let registry = MockModelRegistry::new(7);
        let planner = registry.pick(&PickRequest::for_role("planner")).unwrap();
        let yaml = planner
            .generate_spec("Add a health endpoint", &serde_json::Value::Null)
            .await
            .unwrap();
        let spec = DirectiveSpec::from_yaml(&yaml).unwrap();

        assert_eq!(spec.spec.len(), 2);
        assert_eq!(spec.spec[0].role, "architect");
        assert_eq!(spec.spec[1].role, "reviewer");
        assert!(spec.metadata.directive_id.unwrap().starts_with("dir-"));

        let architect = registry.pick(&PickRequest::for_role("architect")).unwrap();
        let design = architect.run("design it").await.unwrap();
        assert_eq!(design.next_roles.len(), 1);
        assert_eq!(design.next_roles[0].role, "worker");

        let worker = registry.pick(&PickRequest::for_role("worker")).unwrap();
        assert!(worker.run("build it").await.unwrap().next_roles.is_empty());
    }

    #[tokio::test]
    async fn plan_honours_meta_directive_id() {
        let registry = MockModelRegistry::new(7);
        let planner = registry.pick(&PickRequest::for_role("planner")).unwrap();
        let yaml = planner
            .generate_spec("x", &serde_json::json!({"directive_id": "d-1"}))
            .await
            .unwrap();
        assert_eq!(
            DirectiveSpec::from_yaml(&yaml).unwrap().directive_id(),
            "d-1"
        );
    }

    #[tokio::test]
    async fn same_seed_same_output() {
        async fn outputs(seed: u64) -> Vec<String> {
            let registry = MockModelRegistry::new(seed).with_failure_rate(0.5);
            let handle = registry.pick(&PickRequest::for_role("worker")).unwrap();
            let mut out = Vec::new();
            for i in 0..8 {
                out.push(handle.run(&format!("prompt {i}")).await.unwrap().text);
            }
            out
        }
        assert_eq!(outputs(3).await, outputs(3).await);
    }

    #[tokio::test]
    async fn failure_rate_bounds() {
        let healthy = MockModelRegistry::new(1)
            .pick(&PickRequest::for_role("worker"))
            .unwrap();
        let broken = MockModelRegistry::new(1)
            .with_failure_rate(1.0)
            .pick(&PickRequest::for_role("worker"))
            .unwrap();
        let ok = healthy.run("p").await.unwrap();
        assert_eq!(PlaceholderEvaluator::score(&ok.text).score, 1.0);
        assert!(ok.artifact_uri.is_some());
        let bad = broken.run("p").await.unwrap();
        assert_eq!(PlaceholderEvaluator::score(&bad.text).score, 0.0);
    }

    #[test]
    fn handle_name_follows_hints() {
        let registry = MockModelRegistry::new(1);
        let req = PickRequest::for_role("worker").with_context("large");
        assert_eq!(registry.pick(&req).unwrap().name(), "mock-worker-large");
        let named = PickRequest {
            name_hint: Some("granite4:micro".into()),
            ..req
        };
        assert_eq!(registry.pick(&named).unwrap().name(), "granite4:micro");
    }

    #[tokio::test]
    async fn retriever_ranks_and_upserts() {
        let retriever = MemoryRetriever::new();
        retriever
            .index("a", "health endpoint returns status", serde_json::Value::Null)
            .await
            .unwrap();
        retriever
            .index("b", "unrelated billing notes", serde_json::Value::Null)
            .await
            .unwrap();
        retriever
            .index("a", "health endpoint returns status and version", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(retriever.index_count(), 3);
        assert_eq!(retriever.documents().len(), 2);

        let hits = retriever
            .retrieve(&RetrievalQuery {
                query: "health endpoint".into(),
                payload_id: Some("b".into()),
                top_k: 5,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].id, "b");

        let top1 = retriever
            .retrieve(&RetrievalQuery {
                query: "health".into(),
                payload_id: None,
                top_k: 1,
            })
            .await
            .unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn scripted_steps_then_fallback() {
        let registry = ScriptedModelRegistry::new().script(
            "worker",
            [
                ScriptStep::Fail("boom".into()),
                ScriptStep::Respond(ModelResponse::text("first")),
            ],
        );
        let handle = registry.pick(&PickRequest::for_role("worker")).unwrap();
        assert!(handle.run("p").await.is_err());
        assert_eq!(handle.run("p").await.unwrap().text, "first");
        assert_eq!(handle.run("p").await.unwrap().text, "ok");
        assert_eq!(registry.run_count(), 3);
        assert_eq!(registry.picks().len(), 1);
    }

    #[tokio::test]
    async fn scripted_evaluator_sequence() {
        let eval = ScriptedEvaluator::sequence([0.1, 0.9], 0.5);
        let task = Task::new("t", "x", "worker");
        let resp = ModelResponse::text("x");
        assert!(!eval.evaluate(&task, &resp).await.passed);
        assert!(eval.evaluate(&task, &resp).await.passed);
        assert_eq!(eval.evaluate(&task, &resp).await.score, 0.5);
        assert_eq!(eval.calls(), 3);
    }
}
