//! Filesystem backends: a JSON arm store and a JSONL trace log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{ArmRecord, BanditStore, StorageResult, TraceRecord, TraceSink};

// ---------------------------------------------------------------------------
// FsBanditStore
// ---------------------------------------------------------------------------

/// JSON-file arm store (`[ArmRecord, ...]`).
///
/// Upserts are serialized by an async mutex and written atomically
/// (temp file in the same directory, then rename), so a crash mid-write never
/// leaves a truncated file behind. A single store instance is the single
/// writer for its path.
///
/// A file that does not parse is renamed to `<name>.corrupt` and the store
/// continues empty, so the next upsert writes a fresh file. `load_arms` still
/// reports the `Corrupt` error once so the caller can log it.
pub struct FsBanditStore {
    path: PathBuf,
    cache: Mutex<Option<Vec<ArmRecord>>>,
}

impl FsBanditStore {
    /// Create a store at `path`. The file is created lazily on first upsert.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> StorageResult<Vec<ArmRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Path the unreadable file is moved to.
    pub fn quarantine_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    fn quarantine(&self, detail: &str) -> StorageResult<()> {
        let target = self.quarantine_path();
        fs::rename(&self.path, &target).map_err(|e| StorageError::io(&self.path, e))?;
        warn!(
            path = %self.path.display(),
            moved_to = %target.display(),
            detail,
            "corrupt bandit state moved aside"
        );
        Ok(())
    }

    /// Read the file, quarantining it when it does not parse.
    ///
    /// Returns the arms plus the parse error, if one was swallowed.
    fn read_or_quarantine(&self) -> StorageResult<(Vec<ArmRecord>, Option<StorageError>)> {
        match self.read_file() {
            Ok(arms) => Ok((arms, None)),
            Err(err @ StorageError::Corrupt { .. }) => {
                self.quarantine(&err.to_string())?;
                Ok((Vec::new(), Some(err)))
            }
            Err(err) => Err(err),
        }
    }

    fn write_file(&self, arms: &[ArmRecord]) -> StorageResult<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| StorageError::io(&parent, e))?;

        let mut buf = serde_json::to_string_pretty(arms)?;
        buf.push('\n');

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| StorageError::io(&parent, e))?;
        tmp.write_all(buf.as_bytes())
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StorageError::io(&self.path, e.error))?;
        debug!(path = %self.path.display(), arms = arms.len(), "bandit state written");
        Ok(())
    }
}

#[async_trait]
impl BanditStore for FsBanditStore {
    async fn load_arms(&self) -> StorageResult<Vec<ArmRecord>> {
        let mut cache = self.cache.lock().await;
        let (arms, corrupt) = self.read_or_quarantine()?;
        *cache = Some(arms.clone());
        match corrupt {
            Some(err) => Err(err),
            None => Ok(arms),
        }
    }

    async fn upsert_arm(&self, arm: &ArmRecord) -> StorageResult<()> {
        let mut cache = self.cache.lock().await;
        let mut arms = match cache.take() {
            Some(arms) => arms,
            None => self.read_or_quarantine()?.0,
        };
        match arms.iter_mut().find(|a| a.id == arm.id) {
            Some(slot) => *slot = arm.clone(),
            None => arms.push(arm.clone()),
        }
        // Keep the cache consistent with disk: only adopt the new vector once
        // the write succeeded.
        match self.write_file(&arms) {
            Ok(()) => {
                *cache = Some(arms);
                Ok(())
            }
            Err(err) => {
                *cache = None;
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JsonlTraceLog
// ---------------------------------------------------------------------------

/// Newline-delimited JSON trace log opened in append mode.
pub struct JsonlTraceLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTraceLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open `<dir>/events.jsonl`.
    pub fn in_dir(dir: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open(dir.as_ref().join("events.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlTraceLog {
    async fn append(&self, record: &TraceRecord) -> StorageResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.flush().map_err(|e| StorageError::io(&self.path, e))
    }
}

/// Read every record from a JSONL trace log.
///
/// Blank lines are ignored; lines that are not valid records are skipped with
/// a warning so one damaged line does not hide the rest of the audit trail.
pub fn read_trace_log(path: &Path) -> StorageResult<Vec<TraceRecord>> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StorageError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceRecord>(&line) {
            Ok(rec) => records.push(rec),
            Err(e) => warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed trace line"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBanditStore::new(dir.path().join("nested/bandit_state.json"));
        assert!(store.load_arms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/state/bandit_state.json");
        let store = FsBanditStore::new(&path);
        store.upsert_arm(&ArmRecord::new("a")).await.unwrap();
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit_state.json");
        fs::write(&path, "{not json").unwrap();
        let store = FsBanditStore::new(&path);
        let err = store.load_arms().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));

        // Reported once; the bad file is out of the way afterwards.
        assert!(!path.exists());
        assert!(store.quarantine_path().is_file());
        assert!(store.load_arms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_without_load_replaces_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit_state.json");
        fs::write(&path, "[1, 2").unwrap();
        let store = FsBanditStore::new(&path);
        store.upsert_arm(&ArmRecord::new("a")).await.unwrap();

        let reread: Vec<ArmRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread.len(), 1);
        assert_eq!(
            fs::read_to_string(store.quarantine_path()).unwrap(),
            "[1, 2"
        );
    }

    #[tokio::test]
    async fn trace_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlTraceLog::in_dir(dir.path().join("traces")).unwrap();
        log.append(&TraceRecord::now("a")).await.unwrap();
        log.append(&TraceRecord::now("b").with("taskId", "t1"))
            .await
            .unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);

        // Reopening appends rather than truncating.
        let again = JsonlTraceLog::open(log.path()).unwrap();
        again.append(&TraceRecord::now("c")).await.unwrap();
        let records = read_trace_log(log.path()).unwrap();
        let events: Vec<_> = records.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, vec!["a", "b", "c"]);
    }

    #[test]
    fn read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(
            &path,
            "{\"ts\":\"2024-01-01T00:00:00Z\",\"event\":\"ok\"}\nnot-json\n\n",
        )
        .unwrap();
        let records = read_trace_log(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "ok");
    }
}
