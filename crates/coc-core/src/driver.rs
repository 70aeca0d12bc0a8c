//! The directive driver: per-task state machine over a bounded worker pool.
//!
//! ```text
//! Enqueued → Picked → ArmSelected → ModelInvoked → Evaluated → Done | Requeued | Escalated
//! ```
//!
//! The driver loop owns the queue. It picks ready tasks, spawns one worker
//! per task (at most `max_concurrent` at once) and applies each worker's
//! [`Transition`] when it finishes. Workers only read shared state, apart from
//! the arm selector and the trace recorder, which serialize themselves.
//!
//! Collaborator failures never leave a worker: a registry, retrieval or model
//! error (or timeout) is recorded and scored 0.0, then follows the normal
//! retry/escalation path.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use coc_state::{ContentDigest, TraceSink};

use crate::backoff::RetryBackoff;
use crate::bandit::{Arm, ArmSelector};
use crate::config::OrchestratorConfig;
use crate::domain::{
    default_template_for, DirectiveOutcome, DirectiveSpec, DirectiveStatus, EscalationStub,
    EvaluationResult, ModelHints, ModelResponse, NextRole, Policies, Task, TaskMeta,
    DEBUG_TEMPLATE, ESCALATION_REASON,
};
use crate::error::{FailureClass, Result};
use crate::evaluator::Evaluator;
use crate::metrics::METRICS;
use crate::obs;
use crate::planner::DirectivePlanner;
use crate::queue::TaskQueue;
use crate::registry::{ModelRegistry, PickRequest, RetrievalQuery, Retriever};
use crate::render::{PromptContext, PromptRenderer};
use crate::trace::TraceRecorder;

/// Retrieval size when neither the arm nor the task names one.
pub const DEFAULT_TOP_K: usize = 5;

/// `task.aborted` reason for an escalation chain past its bound.
pub const ESCALATION_DEPTH_EXCEEDED: &str = "escalation_depth_exceeded";

/// `task.aborted` reason for tasks stopped by cancellation.
pub const CANCELLED: &str = "cancelled";

/// Scheduling knobs for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub max_concurrent: usize,
    pub call_timeout: Duration,
    /// 0 disables the bound.
    pub max_escalation_depth: u32,
    /// Seed for retry jitter.
    pub seed: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for DriverSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            call_timeout: config.call_timeout,
            max_escalation_depth: config.max_escalation_depth,
            seed: config.mock_seed,
        }
    }
}

/// Services injected into an orchestrator.
pub struct Collaborators {
    pub registry: Arc<dyn ModelRegistry>,
    pub retriever: Arc<dyn Retriever>,
    pub evaluator: Arc<dyn Evaluator>,
    pub bandit: Arc<ArmSelector>,
    pub renderer: PromptRenderer,
    pub trace_sink: Arc<dyn TraceSink>,
}

/// Runs directives. Holds no per-run state, so one instance can drive
/// several directives concurrently.
pub struct Orchestrator {
    settings: DriverSettings,
    registry: Arc<dyn ModelRegistry>,
    retriever: Arc<dyn Retriever>,
    evaluator: Arc<dyn Evaluator>,
    bandit: Arc<ArmSelector>,
    renderer: Arc<PromptRenderer>,
    trace_sink: Arc<dyn TraceSink>,
}

impl Orchestrator {
    pub fn new(settings: DriverSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            registry: collaborators.registry,
            retriever: collaborators.retriever,
            evaluator: collaborators.evaluator,
            bandit: collaborators.bandit,
            renderer: Arc::new(collaborators.renderer),
            trace_sink: collaborators.trace_sink,
        }
    }

    pub fn bandit(&self) -> &Arc<ArmSelector> {
        &self.bandit
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Plan `directive` with the planner model, then run the plan.
    pub async fn run_directive(
        &self,
        directive: &str,
        meta: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<DirectiveOutcome> {
        let planner = DirectivePlanner::new(Arc::clone(&self.registry), self.settings.call_timeout);
        let spec = planner.plan(directive, &meta, &cancel).await?;
        self.run_spec(directive, spec, cancel).await
    }

    /// Run an already-planned directive until its queue drains or `cancel`
    /// fires.
    pub async fn run_spec(
        &self,
        directive: &str,
        spec: DirectiveSpec,
        cancel: CancellationToken,
    ) -> Result<DirectiveOutcome> {
        spec.validate()?;
        let directive_id = spec.directive_id();
        let span = obs::directive_span(&directive_id);
        self.drive(directive, directive_id, spec, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        directive: &str,
        directive_id: String,
        spec: DirectiveSpec,
        cancel: CancellationToken,
    ) -> Result<DirectiveOutcome> {
        let started = Instant::now();
        let ctx = Arc::new(RunContext {
            directive: directive.to_string(),
            policies: spec.policies.clone(),
            trace: TraceRecorder::new(Arc::clone(&self.trace_sink), directive_id.as_str()),
            registry: Arc::clone(&self.registry),
            retriever: Arc::clone(&self.retriever),
            evaluator: Arc::clone(&self.evaluator),
            bandit: Arc::clone(&self.bandit),
            renderer: Arc::clone(&self.renderer),
            call_timeout: self.settings.call_timeout,
            max_escalation_depth: self.settings.max_escalation_depth,
        });
        let mut run = DirectiveRun {
            backoff: RetryBackoff::from_policies(&spec.policies),
            queue: TaskQueue::new(),
            rng: StdRng::seed_from_u64(self.settings.seed),
            seq: 0,
            outcome: DirectiveOutcome::new(directive_id.as_str()),
            ctx,
        };

        for decl in &spec.spec {
            let task = decl.to_task(directive, &directive_id);
            run.queue.enqueue(task.clone())?;
            run.ctx.trace.task_enqueued(&task).await;
        }
        obs::emit_directive_started(&directive_id, spec.spec.len());

        let max_concurrent = self.settings.max_concurrent.max(1);
        let mut workers: JoinSet<(Task, Transition)> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            while workers.len() < max_concurrent {
                let Some(task) = run.queue.dequeue_ready() else {
                    break;
                };
                run.ctx.trace.task_picked(&task).await;
                let ctx = Arc::clone(&run.ctx);
                let worker_cancel = cancel.child_token();
                let span = obs::task_span(&task.id, &task.role);
                workers.spawn(
                    async move {
                        let transition = AssertUnwindSafe(ctx.execute(&task, &worker_cancel))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| Transition::Abort {
                                reason: "worker panicked".to_string(),
                                class: FailureClass::Infrastructure,
                            });
                        (task, transition)
                    }
                    .instrument(span),
                );
            }

            if workers.is_empty() && run.queue.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Ok((task, transition)) => run.apply(task, transition).await?,
                    Err(err) => {
                        warn!(error = %err, "worker did not complete");
                        run.outcome.aborted += 1;
                    }
                },
                _ = run.queue.wait_ready(), if workers.len() < max_concurrent => {}
            }
        }

        if cancel.is_cancelled() {
            run.outcome.status = DirectiveStatus::Cancelled;
            while let Some(joined) = workers.join_next().await {
                if let Ok((task, transition)) = joined {
                    run.settle_cancelled(task, transition).await?;
                }
            }
            for task in run.queue.drain_waiting() {
                run.ctx
                    .trace
                    .task_aborted(&task, CANCELLED, FailureClass::Terminal)
                    .await;
                obs::emit_task_transition(&task.id, "aborted", None);
                run.outcome.aborted += 1;
            }
        } else if run.outcome.aborted > 0 {
            run.outcome.status = DirectiveStatus::Failed;
        }

        let unwritten = run.ctx.trace.flush().await;
        if unwritten > 0 {
            warn!(records = unwritten, "trace records could not be written");
        }
        if let Err(err) = self.bandit.flush().await {
            warn!(error = %err, "bandit state not fully persisted; kept in memory");
        }

        METRICS.flush();
        obs::emit_directive_finished(&run.outcome, started.elapsed().as_millis() as u64);
        Ok(run.outcome)
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// What a worker decided for its task.
#[derive(Debug)]
enum Transition {
    Done {
        score: f64,
        followups: Vec<NextRole>,
        artifact_uri: Option<String>,
        digest: Option<ContentDigest>,
    },
    Requeue {
        score: f64,
    },
    Escalate {
        score: f64,
        stub: EscalationStub,
    },
    Abort {
        reason: String,
        class: FailureClass,
    },
}

enum CallError {
    Cancelled,
    Failed { stage: &'static str, detail: String },
}

/// Read-only services and policies shared by the workers of one run.
struct RunContext {
    directive: String,
    policies: Policies,
    trace: TraceRecorder,
    registry: Arc<dyn ModelRegistry>,
    retriever: Arc<dyn Retriever>,
    evaluator: Arc<dyn Evaluator>,
    bandit: Arc<ArmSelector>,
    renderer: Arc<PromptRenderer>,
    call_timeout: Duration,
    max_escalation_depth: u32,
}

impl RunContext {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Transition {
        METRICS.inc_tasks_executed();

        let arm = match self.bandit.select_arm(&task.role).await {
            Ok(arm) => arm,
            Err(err) => {
                return Transition::Abort {
                    reason: format!("arm selection failed: {err}"),
                    class: FailureClass::Infrastructure,
                }
            }
        };
        self.trace.strategy_selected(task, &arm).await;

        let (response, eval) = match self.invoke(task, &arm, cancel).await {
            Ok(response) => {
                let eval = self.evaluator.evaluate(task, &response).await;
                (Some(response), eval)
            }
            Err(CallError::Cancelled) => {
                return Transition::Abort {
                    reason: CANCELLED.to_string(),
                    class: FailureClass::Terminal,
                }
            }
            Err(CallError::Failed { stage, detail }) => {
                METRICS.inc_infrastructure_failures();
                (None, EvaluationResult::infrastructure(stage, &detail))
            }
        };
        self.trace.evaluation(task, &eval).await;

        match self.bandit.update_arm(&arm.id, eval.score).await {
            Ok(update) if !update.persisted => {
                self.trace.bandit_persist_deferred(task, &arm.id).await
            }
            Ok(_) => {}
            Err(err) => warn!(arm = %arm.id, error = %err, "bandit update failed"),
        }

        if eval.score >= self.policies.approval_threshold {
            let digest = match &response {
                Some(response) => self.index_artifact(task, response, cancel).await,
                None => None,
            };
            let followups = response
                .as_ref()
                .map(|r| r.next_roles.clone())
                .unwrap_or_default();
            return Transition::Done {
                score: eval.score,
                followups,
                artifact_uri: response.and_then(|r| r.artifact_uri),
                digest,
            };
        }

        if task.retries < self.policies.retry_on_failure {
            return Transition::Requeue { score: eval.score };
        }

        let depth = task.meta.escalation_depth + 1;
        if self.max_escalation_depth > 0 && depth > self.max_escalation_depth {
            return Transition::Abort {
                reason: ESCALATION_DEPTH_EXCEEDED.to_string(),
                class: FailureClass::Terminal,
            };
        }
        let stub = self
            .debug_plan(task, &arm, response.as_ref(), &eval, cancel)
            .await;
        Transition::Escalate {
            score: eval.score,
            stub,
        }
    }

    fn pick_request(&self, task: &Task, arm: &Arm) -> PickRequest {
        PickRequest {
            role: task.role.clone(),
            name_hint: arm.model_name.clone().or_else(|| task.model_hints.model.clone()),
            context_hint: arm
                .context
                .clone()
                .or_else(|| task.model_hints.context.clone())
                .or_else(|| Some("short".to_string())),
        }
    }

    /// Resolve, retrieve, render and run. Every failure is traced here.
    async fn invoke(
        &self,
        task: &Task,
        arm: &Arm,
        cancel: &CancellationToken,
    ) -> std::result::Result<ModelResponse, CallError> {
        let handle = match self.registry.pick(&self.pick_request(task, arm)) {
            Ok(handle) => handle,
            Err(err) => {
                let detail = format!("{err:#}");
                self.trace.model_call_failed(task, None, &detail).await;
                return Err(CallError::Failed {
                    stage: "registry",
                    detail,
                });
            }
        };

        let query = RetrievalQuery {
            query: task.title.clone(),
            payload_id: task.payload_id.clone(),
            top_k: arm.top_k.map(|k| k as usize).unwrap_or(DEFAULT_TOP_K),
        };
        let docs = match self
            .guarded(cancel, "retrieval", self.retriever.retrieve(&query))
            .await
        {
            Ok(docs) => docs,
            Err(CallError::Failed { stage, detail }) => {
                self.trace.retrieval_failed(task, &detail).await;
                return Err(CallError::Failed { stage, detail });
            }
            Err(cancelled) => return Err(cancelled),
        };

        let directive = task.meta.directive.as_deref().unwrap_or(&self.directive);
        let prompt = self.renderer.render(
            task.prompt_template_id.as_deref(),
            &PromptContext {
                directive,
                task,
                arm,
                docs: &docs,
            },
        );

        self.trace.model_call_start(task, handle.name()).await;
        let started = Instant::now();
        match self.guarded(cancel, "model", handle.run(&prompt)).await {
            Ok(response) => {
                self.trace
                    .model_call_end(task, handle.name(), started.elapsed().as_millis() as u64)
                    .await;
                Ok(response)
            }
            Err(CallError::Failed { stage, detail }) => {
                self.trace
                    .model_call_failed(task, Some(handle.name()), &detail)
                    .await;
                Err(CallError::Failed { stage, detail })
            }
            Err(cancelled) => Err(cancelled),
        }
    }

    /// Race a collaborator call against the deadline and cancellation.
    async fn guarded<T, F>(
        &self,
        cancel: &CancellationToken,
        stage: &'static str,
        call: F,
    ) -> std::result::Result<T, CallError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            res = tokio::time::timeout(self.call_timeout, call) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CallError::Failed { stage, detail: format!("{err:#}") }),
                Err(_) => Err(CallError::Failed {
                    stage,
                    detail: format!("timed out after {} ms", self.call_timeout.as_millis()),
                }),
            },
        }
    }

    /// Index a passing artifact. Returns its digest when indexing succeeded.
    async fn index_artifact(
        &self,
        task: &Task,
        response: &ModelResponse,
        cancel: &CancellationToken,
    ) -> Option<ContentDigest> {
        let digest = ContentDigest::from_bytes(response.text.as_bytes());
        let metadata = json!({
            "taskId": task.id,
            "directiveId": self.trace.directive_id(),
            "digest": digest.as_str(),
            "artifactUri": response.artifact_uri,
            "artifacts": response.artifacts,
        });
        match self
            .guarded(cancel, "index", self.retriever.index(&task.id, &response.text, metadata))
            .await
        {
            Ok(()) => Some(digest),
            Err(CallError::Failed { detail, .. }) => {
                METRICS.inc_infrastructure_failures();
                self.trace.artifact_index_failed(task, &detail).await;
                None
            }
            Err(CallError::Cancelled) => None,
        }
    }

    async fn debug_plan(
        &self,
        task: &Task,
        arm: &Arm,
        response: Option<&ModelResponse>,
        eval: &EvaluationResult,
        cancel: &CancellationToken,
    ) -> EscalationStub {
        let fallback = || EscalationStub {
            title: Some(format!("Debug {}", task.title)),
            ..EscalationStub::default()
        };
        let handle = match self.registry.pick(&self.pick_request(task, arm)) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(task = %task.id, error = %err, "no handle for debug plan");
                return fallback();
            }
        };
        match self
            .guarded(cancel, "debug_plan", handle.debug_plan(task, response, eval))
            .await
        {
            Ok(stub) => stub,
            Err(CallError::Failed { detail, .. }) => {
                warn!(task = %task.id, error = %detail, "debug plan failed, using default escalation");
                fallback()
            }
            Err(CallError::Cancelled) => fallback(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop side
// ---------------------------------------------------------------------------

/// Mutable state of one directive run, owned by the driver loop.
struct DirectiveRun {
    ctx: Arc<RunContext>,
    queue: TaskQueue,
    backoff: RetryBackoff,
    rng: StdRng,
    seq: u64,
    outcome: DirectiveOutcome,
}

impl DirectiveRun {
    async fn apply(&mut self, task: Task, transition: Transition) -> Result<()> {
        match transition {
            Transition::Done {
                score,
                followups,
                artifact_uri,
                digest,
            } => {
                self.queue.complete(&task.id)?;
                self.ctx.trace.task_done(&task, score, digest.as_ref()).await;
                obs::emit_task_transition(&task.id, "done", Some(score));
                self.outcome.done += 1;
                for next in &followups {
                    self.enqueue_followup(&task, next, artifact_uri.as_deref())
                        .await;
                }
            }
            Transition::Requeue { score } => {
                let mut task = task;
                task.retries += 1;
                let delay = self.backoff.delay_for(task.retries, self.rng.gen::<f64>());
                self.ctx
                    .trace
                    .task_requeued(&task, delay.as_millis() as u64, score)
                    .await;
                obs::emit_task_transition(&task.id, "requeued", Some(score));
                self.queue.requeue(task, delay)?;
                METRICS.inc_retries();
                self.outcome.requeues += 1;
            }
            Transition::Escalate { score, stub } => {
                self.queue.complete(&task.id)?;
                let escalation = self.escalation_task(&task, stub);
                self.ctx.trace.task_escalated(&task, &escalation).await;
                obs::emit_task_transition(&task.id, "escalated", Some(score));
                METRICS.inc_escalations();
                self.outcome.escalated += 1;
                info!(task = %task.id, escalation = %escalation.id, role = %escalation.role, "task escalated");

                self.queue.enqueue(escalation.clone())?;
                self.ctx.trace.task_enqueued(&escalation).await;
            }
            Transition::Abort { reason, class } => {
                self.queue.complete(&task.id)?;
                self.ctx.trace.task_aborted(&task, &reason, class).await;
                obs::emit_task_transition(&task.id, "aborted", None);
                self.outcome.aborted += 1;
            }
        }
        Ok(())
    }

    /// Close out a worker that finished after cancellation: a pass still
    /// counts, everything else is aborted. No follow-ons, requeues or
    /// escalations.
    async fn settle_cancelled(&mut self, task: Task, transition: Transition) -> Result<()> {
        self.queue.complete(&task.id)?;
        match transition {
            Transition::Done { score, digest, .. } => {
                self.ctx.trace.task_done(&task, score, digest.as_ref()).await;
                obs::emit_task_transition(&task.id, "done", Some(score));
                self.outcome.done += 1;
            }
            _ => {
                self.ctx
                    .trace
                    .task_aborted(&task, CANCELLED, FailureClass::Terminal)
                    .await;
                obs::emit_task_transition(&task.id, "aborted", None);
                self.outcome.aborted += 1;
            }
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// `base`, or `base-<n>` when `base` was already used in this run.
    fn unique_id(&mut self, base: String) -> String {
        if !self.queue.contains_id(&base) {
            return base;
        }
        loop {
            let candidate = format!("{base}-{}", self.next_seq());
            if !self.queue.contains_id(&candidate) {
                return candidate;
            }
        }
    }

    async fn enqueue_followup(&mut self, parent: &Task, next: &NextRole, artifact_uri: Option<&str>) {
        let base = match next.task_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let seq = self.next_seq();
                format!("{}-child-{seq}", parent.id)
            }
        };
        let child = Task {
            id: self.unique_id(base),
            title: next
                .title
                .clone()
                .unwrap_or_else(|| format!("Followup for {}", parent.id)),
            role: next.role.clone(),
            payload_id: next
                .payload_id
                .clone()
                .or_else(|| artifact_uri.map(str::to_string)),
            prompt_template_id: Some(
                next.prompt_template_id
                    .clone()
                    .unwrap_or_else(|| default_template_for(&next.role)),
            ),
            acceptance: next.acceptance.clone(),
            model_hints: next.model_hints.clone().unwrap_or_default(),
            retries: 0,
            meta: TaskMeta {
                directive: parent.meta.directive.clone(),
                directive_id: parent.meta.directive_id.clone(),
                parent: Some(parent.id.clone()),
                reason: None,
                escalation_depth: parent.meta.escalation_depth,
            },
        };
        match self.queue.enqueue(child.clone()) {
            Ok(()) => self.ctx.trace.followup_enqueued(parent, &child).await,
            Err(err) => warn!(parent = %parent.id, error = %err, "follow-on task rejected"),
        }
    }

    fn escalation_task(&mut self, task: &Task, stub: EscalationStub) -> Task {
        let seq = self.next_seq();
        let id = self.unique_id(format!("{}-debug-{seq}", task.id));
        Task {
            id,
            title: stub.title.unwrap_or_else(|| format!("Debug {}", task.title)),
            role: self.ctx.policies.lead_role.clone(),
            payload_id: stub.payload_id.or_else(|| task.payload_id.clone()),
            prompt_template_id: Some(
                stub.prompt_template_id
                    .unwrap_or_else(|| DEBUG_TEMPLATE.to_string()),
            ),
            acceptance: None,
            model_hints: ModelHints::default(),
            retries: 0,
            meta: TaskMeta {
                directive: task.meta.directive.clone(),
                directive_id: task.meta.directive_id.clone(),
                parent: Some(task.id.clone()),
                reason: Some(ESCALATION_REASON.to_string()),
                escalation_depth: task.meta.escalation_depth + 1,
            },
        }
    }
}
