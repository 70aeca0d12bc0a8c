//! COC-State: durable stores for the COC orchestrator
//!
//! This crate owns every byte the orchestrator writes to disk. It has no
//! knowledge of tasks or directives; it only stores arm records and trace
//! records.
//!
//! ## Key Components
//!
//! - `BanditStore` / `FsBanditStore`: per-arm upsert store for learning state
//! - `TraceSink` / `JsonlTraceLog`: append-only newline-delimited audit log
//! - `ContentDigest`: SHA-256 addressing for indexed artifacts
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::{read_trace_log, FsBanditStore, JsonlTraceLog};
pub use storage_traits::{
    ArmRecord, BanditStore, ContentDigest, StorageResult, TraceRecord, TraceSink,
};
