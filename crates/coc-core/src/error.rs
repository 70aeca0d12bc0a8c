//! Error taxonomy for the orchestration engine.
//!
//! Task-level failures (a low score, exhausted retries) are never errors:
//! they travel as `EvaluationResult` data through the driver transitions.
//! `CocError` is reserved for failures of a whole directive run or of an
//! administrative operation.

use coc_state::StorageError;
use serde::{Deserialize, Serialize};

/// Queue contract violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task id must not be empty")]
    EmptyId,

    #[error("task {id} has no role")]
    EmptyRole { id: String },

    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("task is not in flight: {0}")]
    NotInFlight(String),
}

/// COC domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CocError {
    #[error("invalid directive spec: {0}")]
    InvalidSpec(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("no arms available for role {role}")]
    NoArms { role: String },

    #[error("unknown arm: {0}")]
    UnknownArm(String),

    #[error("infrastructure failure in {stage}: {detail}")]
    Infrastructure { stage: String, detail: String },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("directive cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for CocError {
    fn from(err: serde_json::Error) -> Self {
        CocError::Serialization(err.to_string())
    }
}

/// Result type for COC operations.
pub type Result<T> = std::result::Result<T, CocError>;

/// Failure classes recorded on trace lines so the audit log shows which
/// recovery path a failure took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Score below threshold, retry still permitted.
    Transient,
    /// Retries exhausted.
    Terminal,
    /// The execution, retrieval or registry call itself failed.
    Infrastructure,
    /// A durable write of bandit or trace state failed.
    Persistence,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Terminal => "terminal",
            FailureClass::Infrastructure => "infrastructure",
            FailureClass::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_error_names_stage() {
        let err = CocError::Infrastructure {
            stage: "planner".to_string(),
            detail: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "infrastructure failure in planner: connection refused"
        );
    }

    #[test]
    fn queue_error_converts() {
        let err: CocError = QueueError::DuplicateId("t1".to_string()).into();
        assert!(matches!(err, CocError::Queue(QueueError::DuplicateId(_))));
        assert!(err.to_string().contains("duplicate task id: t1"));
    }

    #[test]
    fn failure_class_serializes_snake_case() {
        let v = serde_json::to_value(FailureClass::Infrastructure).unwrap();
        assert_eq!(v, "infrastructure");
        assert_eq!(FailureClass::Terminal.to_string(), "terminal");
    }
}
