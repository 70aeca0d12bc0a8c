//! Storage trait definitions for COC
//!
//! These traits define the two durable stores the orchestrator writes to:
//! - `BanditStore`: per-arm learning state (wins/plays), upserted after every update
//! - `TraceSink`: append-only lifecycle records, one line per transition
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest: artifact addressing
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// BanditStore: arm learning state
// ---------------------------------------------------------------------------

/// Persisted form of one bandit arm.
///
/// `role` is `None` for arms in the shared pool and set for arms scoped to a
/// single role. Field names follow the on-disk format (`modelName`, `topK`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub plays: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

impl ArmRecord {
    /// New arm with zeroed counters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            model_name: None,
            prompt_template: None,
            context: None,
            top_k: None,
            wins: 0,
            plays: 0,
            meta: serde_json::Value::Null,
        }
    }
}

/// Durable arm store.
///
/// Guarantees:
/// - `upsert_arm` replaces the record with the same `id`, or appends it.
/// - `load_arms` returns records in first-insertion order; empty when nothing
///   has been persisted yet.
/// - A record written by `upsert_arm` is visible to every later `load_arms`,
///   including from a fresh store instance over the same backend.
#[async_trait]
pub trait BanditStore: Send + Sync {
    /// Load every persisted arm.
    async fn load_arms(&self) -> StorageResult<Vec<ArmRecord>>;

    /// Insert or replace a single arm.
    async fn upsert_arm(&self, arm: &ArmRecord) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// TraceSink: append-only audit log
// ---------------------------------------------------------------------------

/// A single trace line: `ts`, `event`, plus event-specific fields.
///
/// Readers must tolerate unknown fields, so everything beyond `ts` and
/// `event` lives in a flattened map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl TraceRecord {
    /// Record stamped with the current time.
    pub fn now(event: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event: event.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a field (builder style).
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Look up a string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// Append-only event sink. Records are never mutated or deleted.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Append one record.
    async fn append(&self, record: &TraceRecord) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_try_from_rejects_short_hex() {
        let err = ContentDigest::try_from("abcd".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn digest_try_from_lowercases() {
        let d = ContentDigest::from_bytes(b"artifact");
        let upper = d.as_str().to_ascii_uppercase();
        let parsed = ContentDigest::try_from(upper).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(d.short().len(), 12);
    }

    #[test]
    fn arm_record_uses_camel_case_on_disk() {
        let mut arm = ArmRecord::new("arm-a");
        arm.model_name = Some("granite4:micro".to_string());
        arm.top_k = Some(5);
        let json = serde_json::to_value(&arm).unwrap();
        assert_eq!(json["modelName"], "granite4:micro");
        assert_eq!(json["topK"], 5);
        assert!(json.get("role").is_none());
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn arm_record_missing_counters_default_to_zero() {
        let arm: ArmRecord = serde_json::from_str(r#"{"id":"legacy"}"#).unwrap();
        assert_eq!(arm.wins, 0);
        assert_eq!(arm.plays, 0);
    }

    #[test]
    fn trace_record_flattens_fields() {
        let rec = TraceRecord::now("task.picked")
            .with("taskId", "t1")
            .with("role", "worker");
        let line = serde_json::to_string(&rec).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"], "task.picked");
        assert_eq!(v["taskId"], "t1");
        assert!(v.get("ts").is_some());
        assert!(v.get("fields").is_none());
    }

    #[test]
    fn trace_record_tolerates_unknown_fields() {
        let line = r#"{"ts":"2024-01-01T00:00:00Z","event":"custom","whatever":{"nested":true}}"#;
        let rec: TraceRecord = serde_json::from_str(line).unwrap();
        assert_eq!(rec.event, "custom");
        assert_eq!(rec.fields["whatever"]["nested"], true);
    }
}
