//! Error types for coc-state

use thiserror::Error;

/// Errors raised by the bandit store and the trace log.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying filesystem failure
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Persisted state exists but cannot be decoded
    #[error("corrupt state in {path}: {detail}")]
    Corrupt { path: String, detail: String },

    /// Digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Injected or backend-specific write rejection
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_path() {
        let err = StorageError::io(
            std::path::Path::new("/tmp/out/bandit_state.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("bandit_state.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn corrupt_error_display() {
        let err = StorageError::Corrupt {
            path: "state.json".to_string(),
            detail: "expected value at line 1".to_string(),
        };
        assert!(err.to_string().contains("corrupt state in state.json"));
    }
}
