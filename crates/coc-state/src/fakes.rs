//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBanditStore` and `MemoryTraceSink` that satisfy the trait
//! contracts without touching the filesystem. Both can be told to reject
//! writes so failure paths in callers are testable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryBanditStore
// ---------------------------------------------------------------------------

/// In-memory arm store backed by an insertion-ordered `Vec`.
#[derive(Debug, Default)]
pub struct MemoryBanditStore {
    arms: Mutex<Vec<ArmRecord>>,
    fail_next: AtomicU32,
    writes: AtomicU32,
}

impl MemoryBanditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the store, as if a previous process had persisted `arms`.
    pub fn with_arms(arms: Vec<ArmRecord>) -> Self {
        Self {
            arms: Mutex::new(arms),
            ..Self::default()
        }
    }

    /// Reject the next `n` upserts with `StorageError::WriteRejected`.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful upserts.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored arms.
    pub fn snapshot(&self) -> Vec<ArmRecord> {
        self.arms.lock().unwrap().clone()
    }
}

#[async_trait]
impl BanditStore for MemoryBanditStore {
    async fn load_arms(&self) -> StorageResult<Vec<ArmRecord>> {
        Ok(self.arms.lock().unwrap().clone())
    }

    async fn upsert_arm(&self, arm: &ArmRecord) -> StorageResult<()> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::WriteRejected(format!(
                "injected failure for arm {}",
                arm.id
            )));
        }
        let mut arms = self.arms.lock().unwrap();
        match arms.iter_mut().find(|a| a.id == arm.id) {
            Some(slot) => *slot = arm.clone(),
            None => arms.push(arm.clone()),
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTraceSink
// ---------------------------------------------------------------------------

/// In-memory trace sink that keeps every appended record in order.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
    fail_next: AtomicU32,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` appends.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// All records appended so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Event names in append order.
    pub fn events(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.event.clone())
            .collect()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn append(&self, record: &TraceRecord) -> StorageResult<()> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::WriteRejected(format!(
                "injected failure for event {}",
                record.event
            )));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
