//! In-memory fake for the tree store (testing only)
//!
//! Provides `MemoryTreeStore`, which satisfies the `TreeStore` contract
//! without any external dependencies. The whole tree lives under one mutex,
//! so every transaction trivially has exactly one winner.
//!
//! Fault injection: `set_offline(true)` makes every operation fail with
//! `StoreError::Connection`, and `deny_writes` rejects writes under a path
//! with `StoreError::PermissionDenied`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::path::{group_writes, value_at, write_at, NodePath};
use crate::storage_traits::*;

/// In-memory tree store backed by a single `serde_json::Value` document.
#[derive(Debug)]
pub struct MemoryTreeStore {
    tree: Mutex<Value>,
    offline: AtomicBool,
    denied: Mutex<Vec<NodePath>>,
    transactions: AtomicUsize,
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self {
            tree: Mutex::new(Value::Object(Map::new())),
            offline: AtomicBool::new(false),
            denied: Mutex::new(Vec::new()),
            transactions: AtomicUsize::new(0),
        }
    }
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing tree.
    pub fn with_tree(tree: Value) -> Self {
        let store = Self::default();
        if tree.is_object() {
            *store.tree.lock().unwrap() = tree;
        }
        store
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every write at or below `path`.
    pub fn deny_writes(&self, path: NodePath) {
        self.denied.lock().unwrap().push(path);
    }

    /// Number of `transaction` calls served so far.
    pub fn transaction_count(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Copy of the whole tree.
    pub fn dump(&self) -> Value {
        self.tree.lock().unwrap().clone()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_allowed(&self, path: &NodePath) -> StoreResult<()> {
        let denied = self.denied.lock().unwrap();
        if denied
            .iter()
            .any(|d| path.segments().starts_with(d.segments()))
        {
            return Err(StoreError::PermissionDenied {
                path: path.to_string(),
                reason: "write denied by test fixture".to_string(),
            });
        }
        Ok(())
    }

    fn tree(&self) -> MutexGuard<'_, Value> {
        self.tree.lock().unwrap()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn get(&self, path: &NodePath) -> StoreResult<Value> {
        self.ensure_online()?;
        if path.is_reserved() {
            return Ok(Value::Bool(*path == NodePath::connection_probe()));
        }

        let tree = self.tree();
        let value = value_at(&tree, path.segments())
            .cloned()
            .unwrap_or(Value::Null);
        match value {
            Value::Object(map) if path.is_root() && map.is_empty() => Ok(Value::Null),
            other => Ok(other),
        }
    }

    async fn set(&self, path: &NodePath, value: Value) -> StoreResult<()> {
        self.ensure_online()?;
        ensure_writable(path, true)?;
        self.ensure_allowed(path)?;

        write_at(&mut self.tree(), path.segments(), value);
        Ok(())
    }

    async fn update(&self, path: &NodePath, partial: Map<String, Value>) -> StoreResult<()> {
        self.ensure_online()?;
        ensure_writable(path, false)?;
        self.ensure_allowed(path)?;

        let grouped = group_writes(path, partial)?;
        let mut tree = self.tree();
        for (key, writes) in grouped {
            for (tail, value) in writes {
                let mut segments = vec![key.clone()];
                segments.extend(tail);
                write_at(&mut tree, &segments, value);
            }
        }
        Ok(())
    }

    async fn transaction(
        &self,
        path: &NodePath,
        update: &UpdateFn<'_>,
    ) -> StoreResult<TransactionOutcome> {
        self.ensure_online()?;
        ensure_writable(path, true)?;
        self.ensure_allowed(path)?;
        self.transactions.fetch_add(1, Ordering::SeqCst);

        let mut tree = self.tree();
        let current = value_at(&tree, path.segments())
            .cloned()
            .unwrap_or(Value::Null);
        match update(current.clone()) {
            None => Ok(TransactionOutcome::aborted(current)),
            Some(next) => {
                write_at(&mut tree, path.segments(), next.clone());
                Ok(TransactionOutcome::committed(next))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn empty_store_reads_null_at_root() {
        let store = MemoryTreeStore::new();
        assert_eq!(store.get(&NodePath::root()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn offline_store_fails_with_connection_error() {
        let store = MemoryTreeStore::new();
        store.set_offline(true);

        let err = store.get(&p("a")).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(!store.check_connection().await.unwrap());

        store.set_offline(false);
        assert!(store.check_connection().await.unwrap());
    }

    #[tokio::test]
    async fn denied_writes_are_rejected_but_reads_work() {
        let store = MemoryTreeStore::with_tree(json!({"locked": {"x": 1}}));
        store.deny_writes(p("locked"));

        let err = store.set(&p("locked/x"), json!(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }));
        assert_eq!(store.get(&p("locked/x")).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn transaction_counter_tracks_calls() {
        let store = MemoryTreeStore::new();
        store.transaction(&p("n"), &|_| None).await.unwrap();
        store
            .transaction(&p("n"), &|_| Some(json!(1)))
            .await
            .unwrap();
        assert_eq!(store.transaction_count(), 2);
        assert_eq!(store.dump(), json!({"n": 1}));
    }
}
