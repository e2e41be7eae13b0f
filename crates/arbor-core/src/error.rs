//! Error taxonomy for arbor-core.

use std::fmt;

use arbor_state::StoreError;

/// The lock operation a [`LockError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Acquire,
    VerifyOwnership,
    Release,
    Status,
    ForceRelease,
    ReleaseExpired,
    InitStorage,
    CheckAccess,
}

impl LockOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockOperation::Acquire => "acquire",
            LockOperation::VerifyOwnership => "verify_ownership",
            LockOperation::Release => "release",
            LockOperation::Status => "status",
            LockOperation::ForceRelease => "force_release",
            LockOperation::ReleaseExpired => "release_expired",
            LockOperation::InitStorage => "init_storage",
            LockOperation::CheckAccess => "check_access",
        }
    }
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lock operation failed for an infrastructure reason.
///
/// Losing the lock to another executor is never an error; it is reported as
/// `false` / `None` by the operation itself.
#[derive(Debug, thiserror::Error)]
#[error("lock {operation} on `{path}` failed: {source}")]
pub struct LockError {
    pub operation: LockOperation,
    pub path: String,
    #[source]
    pub source: StoreError,
}

impl LockError {
    pub(crate) fn new(operation: LockOperation, path: impl Into<String>, source: StoreError) -> Self {
        Self {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True when the store could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        self.source.is_connectivity()
    }
}

/// Backup/restore failures.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no backup available: take a backup or pass a snapshot to restore")]
    NoBackupAvailable,

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// The node overlaps a path backups must never capture or overwrite.
    #[error("node `{path}` overlaps excluded node `{excluded}`")]
    ExcludedNode { path: String, excluded: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid path in {var}: {source}")]
    Path {
        var: &'static str,
        #[source]
        source: StoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_error_names_operation_and_path() {
        let err = LockError::new(
            LockOperation::Acquire,
            "migrations_lock",
            StoreError::Connection("refused".into()),
        );
        let msg = err.to_string();
        assert!(msg.contains("acquire"));
        assert!(msg.contains("migrations_lock"));
        assert!(err.is_connectivity());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn store_errors_convert_into_backup_errors() {
        let err: BackupError = StoreError::Query("boom".into()).into();
        assert!(matches!(err, BackupError::Store(_)));
    }
}
