//! Structured diagnostics for directive runs.
//!
//! These are `tracing` events for operators, separate from the JSONL trace
//! log the driver writes as a product artifact.
//!
//! - [`directive_span`] scopes every event of one run (attach it with
//!   `tracing::Instrument` so it stays valid across `.await`)
//! - `emit_*` functions cover start, per-task transitions and finish

use tracing::{info, warn};

use crate::domain::DirectiveOutcome;

/// Span tagged with the directive id.
pub fn directive_span(directive_id: &str) -> tracing::Span {
    tracing::info_span!("coc.directive", directive_id = %directive_id)
}

/// Span tagged with a task id and role.
pub fn task_span(task_id: &str, role: &str) -> tracing::Span {
    tracing::info_span!("coc.task", task_id = %task_id, role = %role)
}

/// Emit event: directive run started with `tasks` seeded tasks.
pub fn emit_directive_started(directive_id: &str, tasks: usize) {
    info!(event = "directive.started", directive_id = %directive_id, tasks = tasks);
}

/// Emit event: one task transition (`done`, `requeued`, `escalated`, `aborted`).
pub fn emit_task_transition(task_id: &str, transition: &str, score: Option<f64>) {
    match score {
        Some(score) => info!(event = "task.transition", task_id = %task_id, transition = %transition, score = score),
        None => info!(event = "task.transition", task_id = %task_id, transition = %transition),
    }
}

/// Emit event: directive run finished.
pub fn emit_directive_finished(outcome: &DirectiveOutcome, duration_ms: u64) {
    info!(
        event = "directive.finished",
        directive_id = %outcome.directive_id,
        status = ?outcome.status,
        done = outcome.done,
        requeues = outcome.requeues,
        escalated = outcome.escalated,
        aborted = outcome.aborted,
        duration_ms = duration_ms,
    );
}

/// Emit event: a trace record could not be written (warning level).
pub fn emit_trace_write_failed(event: &str, error: &dyn std::fmt::Display) {
    warn!(event = "trace.write_failed", trace_event = %event, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        let span = directive_span("d-1");
        let _guard = span.enter();
        emit_directive_started("d-1", 3);
        emit_task_transition("t1", "done", Some(1.0));
        emit_task_transition("t2", "aborted", None);
        emit_directive_finished(&DirectiveOutcome::new("d-1"), 12);
        emit_trace_write_failed("task.done", &"disk full");
    }
}
