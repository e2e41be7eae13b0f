//! Storage trait definitions for Arbor
//!
//! `TreeStore` is the single seam between Arbor and the backing store: a
//! path-addressed tree whose only atomic primitive is a compare-and-swap on
//! one node (`transaction`). Everything above it, including the distributed
//! lock, is built from these five operations.
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::path::NodePath;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Update function passed to [`TreeStore::transaction`].
///
/// Receives the current value at the path (`Value::Null` when absent).
/// Returning `None` aborts the transaction; returning `Some(Value::Null)`
/// deletes the node. The function may run several times when the store
/// detects a conflicting writer, so it must not have side effects.
pub type UpdateFn<'a> = dyn Fn(Value) -> Option<Value> + Send + Sync + 'a;

/// Result of a [`TreeStore::transaction`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    /// Whether the update function's result was written.
    pub committed: bool,
    /// Value at the path after the call: the written value when committed,
    /// the freshly read current value when aborted.
    pub snapshot: Value,
}

impl TransactionOutcome {
    pub fn committed(snapshot: Value) -> Self {
        Self {
            committed: true,
            snapshot,
        }
    }

    pub fn aborted(snapshot: Value) -> Self {
        Self {
            committed: false,
            snapshot,
        }
    }
}

/// Path-addressed hierarchical store.
///
/// Guarantees:
/// - `get` of an absent node returns `Value::Null`.
/// - `set(path, Null)` removes the node.
/// - `transaction` is a genuine single-node compare-and-transform: among
///   concurrent conflicting writers exactly one commits per round, the
///   others re-run their update function against the winner's value.
/// - No operation spans more than one top-level node atomically.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Read the full subtree at `path`.
    async fn get(&self, path: &NodePath) -> StoreResult<Value>;

    /// Overwrite the subtree at `path`.
    async fn set(&self, path: &NodePath, value: Value) -> StoreResult<()>;

    /// Shallow-merge `partial` into the object at `path`. A `null` entry
    /// removes that child. At the root each entry is written independently.
    async fn update(&self, path: &NodePath, partial: Map<String, Value>) -> StoreResult<()>;

    /// Atomically transform the value at `path`.
    async fn transaction(
        &self,
        path: &NodePath,
        update: &UpdateFn<'_>,
    ) -> StoreResult<TransactionOutcome>;

    /// Remove the subtree at `path`.
    async fn remove(&self, path: &NodePath) -> StoreResult<()> {
        self.set(path, Value::Null).await
    }

    /// Probe the reserved `.info/connected` path. Has no side effects.
    ///
    /// An unreachable store reports `Ok(false)`; other failures propagate.
    async fn check_connection(&self) -> StoreResult<bool> {
        match self.get(&NodePath::connection_probe()).await {
            Ok(value) => Ok(value == Value::Bool(true)),
            Err(err) if err.is_connectivity() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Reject writes the store can never accept, shared by all backends.
pub(crate) fn ensure_writable(path: &NodePath, whole_node: bool) -> StoreResult<()> {
    if path.is_reserved() {
        return Err(StoreError::PermissionDenied {
            path: path.to_string(),
            reason: "the .info namespace is read-only".to_string(),
        });
    }
    if whole_node && path.is_root() {
        return Err(StoreError::invalid_path(
            "/",
            "the root spans every top-level node and cannot be written atomically",
        ));
    }
    Ok(())
}
