//! Trait contract tests for BanditStore and TraceSink.
//!
//! Each contract runs against both the in-memory fake and the filesystem
//! backend. Any conforming implementation must pass these.

use coc_state::fakes::{MemoryBanditStore, MemoryTraceSink};
use coc_state::storage_traits::*;
use coc_state::{read_trace_log, FsBanditStore, JsonlTraceLog, StorageError};

fn arm(id: &str, wins: u64, plays: u64) -> ArmRecord {
    let mut a = ArmRecord::new(id);
    a.wins = wins;
    a.plays = plays;
    a
}

async fn upsert_replaces_by_id(store: &dyn BanditStore) {
    store.upsert_arm(&arm("a", 0, 1)).await.unwrap();
    store.upsert_arm(&arm("b", 1, 1)).await.unwrap();
    store.upsert_arm(&arm("a", 1, 2)).await.unwrap();

    let arms = store.load_arms().await.unwrap();
    assert_eq!(arms.len(), 2);
    assert_eq!(arms[0].id, "a");
    assert_eq!((arms[0].wins, arms[0].plays), (1, 2));
    assert_eq!(arms[1].id, "b");
}

// ===========================================================================
// BanditStore contract tests
// ===========================================================================

#[tokio::test]
async fn memory_store_upsert_replaces_by_id() {
    upsert_replaces_by_id(&MemoryBanditStore::new()).await;
}

#[tokio::test]
async fn fs_store_upsert_replaces_by_id() {
    let dir = tempfile::tempdir().unwrap();
    upsert_replaces_by_id(&FsBanditStore::new(dir.path().join("bandit.json"))).await;
}

#[tokio::test]
async fn fs_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bandit_state.json");

    let mut rich = arm("deep", 3, 7);
    rich.model_name = Some("llama3.1:8b".to_string());
    rich.context = Some("large".to_string());
    rich.top_k = Some(8);
    rich.role = Some("worker".to_string());
    rich.meta = serde_json::json!({"tier": "premium"});

    {
        let store = FsBanditStore::new(&path);
        store.upsert_arm(&arm("fast", 1, 4)).await.unwrap();
        store.upsert_arm(&rich).await.unwrap();
    }

    let reopened = FsBanditStore::new(&path);
    let arms = reopened.load_arms().await.unwrap();
    assert_eq!(arms, vec![arm("fast", 1, 4), rich]);
}

#[tokio::test]
async fn memory_store_injected_failure_leaves_state_untouched() {
    let store = MemoryBanditStore::with_arms(vec![arm("a", 0, 0)]);
    store.fail_next_writes(1);

    let err = store.upsert_arm(&arm("a", 1, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::WriteRejected(_)));
    assert_eq!(store.snapshot()[0].plays, 0);

    store.upsert_arm(&arm("a", 1, 1)).await.unwrap();
    assert_eq!(store.snapshot()[0].plays, 1);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn fs_store_recovers_from_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bandit_state.json");
    std::fs::write(&path, "{not json").unwrap();

    let store = FsBanditStore::new(&path);
    assert!(matches!(
        store.load_arms().await,
        Err(StorageError::Corrupt { .. })
    ));
    store.upsert_arm(&arm("a", 1, 2)).await.unwrap();

    // A fresh instance sees the rewritten file.
    let reopened = FsBanditStore::new(&path);
    let arms = reopened.load_arms().await.unwrap();
    assert_eq!(arms.len(), 1);
    assert_eq!((arms[0].wins, arms[0].plays), (1, 2));
    assert_eq!(
        std::fs::read_to_string(store.quarantine_path()).unwrap(),
        "{not json"
    );
}

// ===========================================================================
// TraceSink contract tests
// ===========================================================================

#[tokio::test]
async fn memory_sink_preserves_order() {
    let sink = MemoryTraceSink::new();
    for name in ["task.enqueued", "task.picked", "task.done"] {
        sink.append(&TraceRecord::now(name)).await.unwrap();
    }
    assert_eq!(sink.events(), vec!["task.enqueued", "task.picked", "task.done"]);
}

#[tokio::test]
async fn jsonl_log_round_trips_fields() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlTraceLog::in_dir(dir.path()).unwrap();
    let rec = TraceRecord::now("evaluation")
        .with("taskId", "t-1")
        .with("score", 0.25)
        .with("passed", false);
    log.append(&rec).await.unwrap();

    let read = read_trace_log(log.path()).unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].str_field("taskId"), Some("t-1"));
    assert_eq!(read[0].fields["score"], 0.25);
    assert_eq!(read[0].ts, rec.ts);
}
