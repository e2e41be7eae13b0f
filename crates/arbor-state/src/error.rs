//! Error types for arbor-state

use thiserror::Error;

/// Errors that can occur talking to the tree store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable or authentication rejected
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// Backend query error
    #[error("Store query failed: {0}")]
    Query(String),

    /// Write rejected for the given path
    #[error("Permission denied at `{path}`: {reason}")]
    PermissionDenied { path: String, reason: String },

    /// Malformed node path
    #[error("Invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Transaction on `{path}` gave up after {attempts} conflicting attempts")]
    Transaction { path: String, attempts: u32 },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl StoreError {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for failures caused by the store being unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
