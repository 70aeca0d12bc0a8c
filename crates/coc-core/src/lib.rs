//! COC Core Library
//!
//! Turns a natural-language directive into a queue of role-typed tasks and
//! drives each one through model invocation, evaluation, retry and
//! escalation. Model strategies are chosen by an epsilon-greedy bandit that
//! learns from evaluation scores.

pub mod backoff;
pub mod bandit;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod mock;
pub mod obs;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod render;
pub mod telemetry;
pub mod trace;

pub use backoff::RetryBackoff;
pub use bandit::{default_arms, win_rate, Arm, ArmScope, ArmSelector, ArmStats, ArmUpdate};
pub use config::{OrchestratorConfig, RunMode};
pub use domain::{
    AcceptanceCriteria, DirectiveMetadata, DirectiveOutcome, DirectiveSpec, DirectiveStatus,
    EscalationStub, EvaluationResult, ModelHints, ModelResponse, NextRole, Policies, Task,
    TaskDecl, TaskMeta,
};
pub use driver::{Collaborators, DriverSettings, Orchestrator};
pub use error::{CocError, FailureClass, QueueError, Result};
pub use evaluator::{AcceptanceEvaluator, Evaluator, PlaceholderEvaluator};
pub use metrics::METRICS;
pub use planner::DirectivePlanner;
pub use queue::TaskQueue;
pub use registry::{Document, ModelHandle, ModelRegistry, PickRequest, RetrievalQuery, Retriever};
pub use render::{PromptContext, PromptRenderer};
pub use telemetry::init_tracing;
pub use trace::{summarize, TaskSummary, TraceRecorder};

pub use coc_state::{
    ArmRecord, BanditStore, ContentDigest, FsBanditStore, JsonlTraceLog, TraceRecord, TraceSink,
};
