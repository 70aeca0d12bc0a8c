use serde::{Deserialize, Serialize};

/// Final status of a directive run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    /// The queue drained.
    Completed,
    /// The queue drained but at least one task was aborted.
    Failed,
    /// The run was cancelled before the queue drained.
    Cancelled,
}

/// Single outcome reported for a whole directive run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveOutcome {
    pub directive_id: String,
    pub status: DirectiveStatus,
    /// Tasks that reached the approval threshold.
    pub done: usize,
    /// Requeue transitions across all tasks.
    pub requeues: usize,
    /// Tasks converted into escalation tasks.
    pub escalated: usize,
    /// Tasks ended by a `task.aborted` record.
    pub aborted: usize,
}

impl DirectiveOutcome {
    pub fn new(directive_id: impl Into<String>) -> Self {
        Self {
            directive_id: directive_id.into(),
            status: DirectiveStatus::Completed,
            done: 0,
            requeues: 0,
            escalated: 0,
            aborted: 0,
        }
    }

    /// True only when the queue drained with no task aborted.
    pub fn is_success(&self) -> bool {
        self.status == DirectiveStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_is_success() {
        let mut outcome = DirectiveOutcome::new("d1");
        assert!(outcome.is_success());
        outcome.status = DirectiveStatus::Failed;
        assert!(!outcome.is_success());
        outcome.status = DirectiveStatus::Cancelled;
        assert!(!outcome.is_success());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DirectiveStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }
}
