//! Trace recorder: one append-only record per lifecycle transition.
//!
//! Event names:
//!
//! | event | emitted when |
//! |---|---|
//! | `task.enqueued` | a planned or escalation task enters the queue |
//! | `task.enqueued.followup` | a follow-on task enters the queue |
//! | `task.picked` | the driver takes a task off the queue |
//! | `strategy.selected` | the bandit chose an arm |
//! | `retrieval.failed` | the retriever errored or timed out |
//! | `model.call.start` / `model.call.end` | around a model invocation |
//! | `model.call.failed` | resolution or invocation failed |
//! | `evaluation` | the response was scored |
//! | `task.done` | terminal: score reached the approval threshold |
//! | `task.requeued` | the task will be retried after a delay |
//! | `task.escalated` | terminal: retries exhausted, escalation task created |
//! | `task.aborted` | terminal: cancelled or escalation chain too deep |
//!
//! A failed append is buffered and written ahead of the next record, so the
//! log keeps transition order even across transient write failures.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use coc_state::{ContentDigest, TraceRecord, TraceSink};

use crate::bandit::Arm;
use crate::domain::{EvaluationResult, Task};
use crate::error::FailureClass;
use crate::metrics::METRICS;
use crate::obs;

pub const TASK_ENQUEUED: &str = "task.enqueued";
pub const TASK_ENQUEUED_FOLLOWUP: &str = "task.enqueued.followup";
pub const TASK_PICKED: &str = "task.picked";
pub const STRATEGY_SELECTED: &str = "strategy.selected";
pub const RETRIEVAL_FAILED: &str = "retrieval.failed";
pub const MODEL_CALL_START: &str = "model.call.start";
pub const MODEL_CALL_END: &str = "model.call.end";
pub const MODEL_CALL_FAILED: &str = "model.call.failed";
pub const EVALUATION: &str = "evaluation";
pub const TASK_DONE: &str = "task.done";
pub const TASK_REQUEUED: &str = "task.requeued";
pub const TASK_ESCALATED: &str = "task.escalated";
pub const TASK_ABORTED: &str = "task.aborted";
pub const ARTIFACT_INDEX_FAILED: &str = "artifact.index.failed";
pub const BANDIT_PERSIST_DEFERRED: &str = "bandit.persist.deferred";

/// Events that end a task's lifecycle.
pub const TERMINAL_EVENTS: &[&str] = &[TASK_DONE, TASK_ESCALATED, TASK_ABORTED];

/// Writes trace records for one directive run.
pub struct TraceRecorder {
    sink: Arc<dyn TraceSink>,
    directive_id: String,
    backlog: Mutex<Vec<TraceRecord>>,
}

impl TraceRecorder {
    pub fn new(sink: Arc<dyn TraceSink>, directive_id: impl Into<String>) -> Self {
        Self {
            sink,
            directive_id: directive_id.into(),
            backlog: Mutex::new(Vec::new()),
        }
    }

    pub fn directive_id(&self) -> &str {
        &self.directive_id
    }

    /// Append `record`, tagged with the directive id.
    ///
    /// Never fails: an unwritable record stays in the backlog and is retried
    /// before the next one.
    pub async fn record(&self, record: TraceRecord) {
        let record = record.with("directiveId", self.directive_id.as_str());
        let mut backlog = self.backlog.lock().await;
        backlog.push(record);
        let mut written = 0;
        for rec in backlog.iter() {
            match self.sink.append(rec).await {
                Ok(()) => written += 1,
                Err(err) => {
                    METRICS.inc_persistence_retries();
                    obs::emit_trace_write_failed(&rec.event, &err);
                    break;
                }
            }
        }
        backlog.drain(..written);
    }

    /// Retry any buffered records. Returns how many are still unwritten.
    pub async fn flush(&self) -> usize {
        let mut backlog = self.backlog.lock().await;
        let mut written = 0;
        for rec in backlog.iter() {
            if self.sink.append(rec).await.is_err() {
                break;
            }
            written += 1;
        }
        backlog.drain(..written);
        backlog.len()
    }

    pub async fn task_enqueued(&self, task: &Task) {
        let mut rec = TraceRecord::now(TASK_ENQUEUED)
            .with("taskId", task.id.as_str())
            .with("role", task.role.as_str());
        if let Some(parent) = &task.meta.parent {
            rec = rec.with("parent", parent.as_str());
        }
        if let Some(reason) = &task.meta.reason {
            rec = rec.with("reason", reason.as_str());
        }
        self.record(rec).await;
    }

    pub async fn followup_enqueued(&self, parent: &Task, child: &Task) {
        self.record(
            TraceRecord::now(TASK_ENQUEUED_FOLLOWUP)
                .with("taskId", child.id.as_str())
                .with("role", child.role.as_str())
                .with("parent", parent.id.as_str())
                .with("child", child.id.as_str()),
        )
        .await;
    }

    pub async fn task_picked(&self, task: &Task) {
        self.record(
            TraceRecord::now(TASK_PICKED)
                .with("taskId", task.id.as_str())
                .with("role", task.role.as_str())
                .with("retries", task.retries),
        )
        .await;
    }

    pub async fn strategy_selected(&self, task: &Task, arm: &Arm) {
        self.record(
            TraceRecord::now(STRATEGY_SELECTED)
                .with("taskId", task.id.as_str())
                .with("arm", to_value(arm)),
        )
        .await;
    }

    pub async fn retrieval_failed(&self, task: &Task, detail: &str) {
        self.record(
            TraceRecord::now(RETRIEVAL_FAILED)
                .with("taskId", task.id.as_str())
                .with("error", detail)
                .with("failureClass", FailureClass::Infrastructure.as_str()),
        )
        .await;
    }

    pub async fn model_call_start(&self, task: &Task, model: &str) {
        self.record(
            TraceRecord::now(MODEL_CALL_START)
                .with("taskId", task.id.as_str())
                .with("model", model),
        )
        .await;
    }

    pub async fn model_call_end(&self, task: &Task, model: &str, elapsed_ms: u64) {
        self.record(
            TraceRecord::now(MODEL_CALL_END)
                .with("taskId", task.id.as_str())
                .with("model", model)
                .with("elapsedMs", elapsed_ms),
        )
        .await;
    }

    pub async fn model_call_failed(&self, task: &Task, model: Option<&str>, detail: &str) {
        let mut rec = TraceRecord::now(MODEL_CALL_FAILED)
            .with("taskId", task.id.as_str())
            .with("error", detail)
            .with("failureClass", FailureClass::Infrastructure.as_str());
        if let Some(model) = model {
            rec = rec.with("model", model);
        }
        self.record(rec).await;
    }

    pub async fn evaluation(&self, task: &Task, eval: &EvaluationResult) {
        self.record(
            TraceRecord::now(EVALUATION)
                .with("taskId", task.id.as_str())
                .with("score", eval.score)
                .with("eval", to_value(eval)),
        )
        .await;
    }

    pub async fn task_done(&self, task: &Task, score: f64, digest: Option<&ContentDigest>) {
        let mut rec = TraceRecord::now(TASK_DONE)
            .with("taskId", task.id.as_str())
            .with("score", score);
        if let Some(digest) = digest {
            rec = rec.with("artifactDigest", digest.as_str());
        }
        self.record(rec).await;
    }

    pub async fn artifact_index_failed(&self, task: &Task, detail: &str) {
        self.record(
            TraceRecord::now(ARTIFACT_INDEX_FAILED)
                .with("taskId", task.id.as_str())
                .with("error", detail)
                .with("failureClass", FailureClass::Infrastructure.as_str()),
        )
        .await;
    }

    pub async fn task_requeued(&self, task: &Task, delay_ms: u64, score: f64) {
        self.record(
            TraceRecord::now(TASK_REQUEUED)
                .with("taskId", task.id.as_str())
                .with("retries", task.retries)
                .with("delayMs", delay_ms)
                .with("score", score)
                .with("failureClass", FailureClass::Transient.as_str()),
        )
        .await;
    }

    pub async fn task_escalated(&self, task: &Task, escalation: &Task) {
        self.record(
            TraceRecord::now(TASK_ESCALATED)
                .with("taskId", task.id.as_str())
                .with("escTo", escalation.role.as_str())
                .with("escalationTaskId", escalation.id.as_str())
                .with("retries", task.retries)
                .with("failureClass", FailureClass::Terminal.as_str()),
        )
        .await;
    }

    pub async fn task_aborted(&self, task: &Task, reason: &str, class: FailureClass) {
        self.record(
            TraceRecord::now(TASK_ABORTED)
                .with("taskId", task.id.as_str())
                .with("role", task.role.as_str())
                .with("reason", reason)
                .with("failureClass", class.as_str()),
        )
        .await;
    }

    pub async fn bandit_persist_deferred(&self, task: &Task, arm_id: &str) {
        self.record(
            TraceRecord::now(BANDIT_PERSIST_DEFERRED)
                .with("taskId", task.id.as_str())
                .with("arm", arm_id)
                .with("failureClass", FailureClass::Persistence.as_str()),
        )
        .await;
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "unserializable": e.to_string() }))
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Lifecycle of one task folded from the trace log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub role: Option<String>,
    pub parent: Option<String>,
    pub enqueued: usize,
    pub picks: usize,
    pub requeues: usize,
    /// Arm ids in selection order.
    pub arms: Vec<String>,
    pub last_score: Option<f64>,
    /// Terminal event name, if the task finished.
    pub terminal: Option<String>,
    /// Number of terminal records; more than one indicates a broken log.
    pub terminal_count: usize,
}

/// Fold trace records into per-task summaries, in first-appearance order.
///
/// Records without a `taskId` and unknown events are ignored.
pub fn summarize(records: &[TraceRecord]) -> Vec<TaskSummary> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, TaskSummary> = HashMap::new();

    for rec in records {
        let Some(task_id) = rec.str_field("taskId") else {
            continue;
        };
        let summary = by_id.entry(task_id.to_string()).or_insert_with(|| {
            order.push(task_id.to_string());
            TaskSummary {
                task_id: task_id.to_string(),
                ..TaskSummary::default()
            }
        });
        if summary.role.is_none() {
            summary.role = rec.str_field("role").map(str::to_string);
        }
        match rec.event.as_str() {
            TASK_ENQUEUED | TASK_ENQUEUED_FOLLOWUP => {
                summary.enqueued += 1;
                if summary.parent.is_none() {
                    summary.parent = rec.str_field("parent").map(str::to_string);
                }
            }
            TASK_PICKED => summary.picks += 1,
            TASK_REQUEUED => summary.requeues += 1,
            STRATEGY_SELECTED => {
                let arm = rec
                    .fields
                    .get("arm")
                    .and_then(|a| a.get("id").or(Some(a)))
                    .and_then(|a| a.as_str());
                if let Some(arm) = arm {
                    summary.arms.push(arm.to_string());
                }
            }
            EVALUATION => summary.last_score = rec.fields.get("score").and_then(|s| s.as_f64()),
            event if TERMINAL_EVENTS.contains(&event) => {
                summary.terminal = Some(event.to_string());
                summary.terminal_count += 1;
            }
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coc_state::fakes::MemoryTraceSink;

    #[tokio::test]
    async fn records_are_tagged_with_directive() {
        let sink = Arc::new(MemoryTraceSink::new());
        let rec = TraceRecorder::new(sink.clone(), "d-7");
        rec.task_picked(&Task::new("t1", "x", "worker")).await;
        let records = sink.records();
        assert_eq!(records[0].event, TASK_PICKED);
        assert_eq!(records[0].str_field("directiveId"), Some("d-7"));
        assert_eq!(records[0].str_field("taskId"), Some("t1"));
    }

    #[tokio::test]
    async fn failed_appends_are_replayed_in_order() {
        let sink = Arc::new(MemoryTraceSink::new());
        let rec = TraceRecorder::new(sink.clone(), "d");
        let task = Task::new("t1", "x", "worker");

        sink.fail_next_appends(1);
        rec.task_enqueued(&task).await;
        assert!(sink.records().is_empty());

        rec.task_picked(&task).await;
        assert_eq!(sink.events(), vec![TASK_ENQUEUED, TASK_PICKED]);
        assert_eq!(rec.flush().await, 0);
    }

    #[test]
    fn summarize_folds_lifecycle() {
        let records = vec![
            TraceRecord::now(TASK_ENQUEUED).with("taskId", "a").with("role", "worker"),
            TraceRecord::now(TASK_PICKED).with("taskId", "a"),
            TraceRecord::now(STRATEGY_SELECTED)
                .with("taskId", "a")
                .with("arm", json!({"id": "arm-x", "wins": 0, "plays": 0})),
            TraceRecord::now(EVALUATION).with("taskId", "a").with("score", 0.0),
            TraceRecord::now(TASK_REQUEUED).with("taskId", "a"),
            TraceRecord::now(TASK_PICKED).with("taskId", "a"),
            TraceRecord::now(EVALUATION).with("taskId", "a").with("score", 1.0),
            TraceRecord::now(TASK_DONE).with("taskId", "a"),
            TraceRecord::now(TASK_ENQUEUED_FOLLOWUP)
                .with("taskId", "b")
                .with("parent", "a"),
            TraceRecord::now("custom.event").with("taskId", "b").with("x", 1),
            TraceRecord::now("directive.note"),
        ];
        let summaries = summarize(&records);
        assert_eq!(summaries.len(), 2);

        let a = &summaries[0];
        assert_eq!(a.task_id, "a");
        assert_eq!(a.role.as_deref(), Some("worker"));
        assert_eq!((a.enqueued, a.picks, a.requeues), (1, 2, 1));
        assert_eq!(a.arms, vec!["arm-x"]);
        assert_eq!(a.last_score, Some(1.0));
        assert_eq!(a.terminal.as_deref(), Some(TASK_DONE));
        assert_eq!(a.terminal_count, 1);

        let b = &summaries[1];
        assert_eq!(b.parent.as_deref(), Some("a"));
        assert!(b.terminal.is_none());
    }
}
