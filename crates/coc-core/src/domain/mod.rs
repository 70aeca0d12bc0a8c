//! Domain models for COC.
//!
//! - `Task`: one unit of work plus its provenance
//! - `DirectiveSpec`: planner output (task declarations + policies)
//! - `EvaluationResult`: score of one response
//! - `DirectiveOutcome`: the single result of a directive run

pub mod directive;
pub mod outcome;
pub mod task;

pub use directive::{DirectiveMetadata, DirectiveSpec, Policies, TaskDecl};
pub use outcome::{DirectiveOutcome, DirectiveStatus};
pub use task::{
    default_template_for, AcceptanceCriteria, EscalationStub, EvaluationResult, ModelHints,
    ModelResponse, NextRole, Task, TaskMeta, DEBUG_TEMPLATE, ESCALATION_REASON,
};
