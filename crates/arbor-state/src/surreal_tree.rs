//! SurrealDB-backed TreeStore implementation
//!
//! Each top-level node of the tree is one row of `tree_nodes`. Every write,
//! including plain `set` and `update`, goes through the same compare-and-swap
//! loop: read the row and its `version`, apply the edit to the decoded
//! document, then write conditionally on the version being unchanged. A row
//! that appeared or changed in between makes the conditional write match
//! nothing, and the edit is re-run against the fresh row under the
//! [`CasRetryPolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::handle::StoreConfig;
use crate::migrations;
use crate::path::{group_writes, value_at, write_at, NodePath};
use crate::retry::CasRetryPolicy;
use crate::storage_traits::{
    ensure_writable, StoreResult, TransactionOutcome, TreeStore, UpdateFn,
};

/// Row of the `tree_nodes` table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRow {
    /// SurrealDB record ID
    id: Option<surrealdb::sql::Thing>,
    /// First path segment
    node_key: String,
    /// JSON text of the subtree
    doc: String,
    /// Bumped on every write
    version: i64,
}

impl NodeRow {
    fn decode(&self) -> StoreResult<Value> {
        Ok(serde_json::from_str(&self.doc)?)
    }
}

/// What an edit decided after seeing the current document.
enum Step {
    /// Leave the row untouched and report this value.
    Abort(Value),
    /// Replace the whole document and report `snapshot`.
    Write { doc: Value, snapshot: Value },
}

/// SurrealDB-backed implementation of [`TreeStore`].
pub struct SurrealTreeStore {
    db: Surreal<Any>,
    retry: CasRetryPolicy,
}

impl SurrealTreeStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `arbor/main`, and runs `init_schema`.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    /// Connect with an explicit configuration.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let db = config.connect().await?;
        Ok(Self {
            db,
            retry: CasRetryPolicy::default(),
        })
    }

    /// Create from environment variables.
    ///
    /// Uses the env-var chain of [`StoreConfig::from_env`].
    pub async fn from_env() -> StoreResult<Self> {
        let config = StoreConfig::from_env();
        info!(endpoint = %config.endpoint, "Connecting tree store from environment");
        Self::connect(&config).await
    }

    /// Replace the CAS retry policy.
    pub fn with_retry_policy(mut self, retry: CasRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &CasRetryPolicy {
        &self.retry
    }

    /// Re-run schema setup on the open connection.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        migrations::init_schema(&self.db).await
    }

    // -- private helpers -----------------------------------------------------

    async fn load(&self, key: &str) -> StoreResult<Option<NodeRow>> {
        let key_owned = key.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM tree_nodes WHERE node_key = $key")
            .bind(("key", key_owned))
            .await?;

        let rows: Vec<NodeRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn load_all(&self) -> StoreResult<Vec<NodeRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM tree_nodes ORDER BY node_key ASC")
            .await?;
        Ok(res.take(0)?)
    }

    async fn read_reserved(&self, path: &NodePath) -> StoreResult<Value> {
        if *path != NodePath::connection_probe() {
            return Ok(Value::Null);
        }

        let mut res = self
            .db
            .query("RETURN true")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let alive: Option<bool> = res
            .take(0)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Value::Bool(alive.unwrap_or(false)))
    }

    /// Conditionally replace the row for `key`. Returns `false` when another
    /// writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        doc: &Value,
    ) -> StoreResult<bool> {
        let key_owned = key.to_string();

        let result = match (expected, doc.is_null()) {
            // Absent stays absent: nothing to write.
            (None, true) => return Ok(true),
            (None, false) => {
                self.db
                    .query("CREATE tree_nodes CONTENT { node_key: $key, doc: $doc, version: 1 }")
                    .bind(("key", key_owned))
                    .bind(("doc", serde_json::to_string(doc)?))
                    .await
            }
            (Some(version), true) => {
                self.db
                    .query(
                        "DELETE tree_nodes WHERE node_key = $key AND version = $expected RETURN BEFORE",
                    )
                    .bind(("key", key_owned))
                    .bind(("expected", version))
                    .await
            }
            (Some(version), false) => {
                self.db
                    .query(
                        "UPDATE tree_nodes SET doc = $doc, version = $next \
                         WHERE node_key = $key AND version = $expected RETURN AFTER",
                    )
                    .bind(("key", key_owned))
                    .bind(("doc", serde_json::to_string(doc)?))
                    .bind(("next", version + 1))
                    .bind(("expected", version))
                    .await
            }
        };

        let rows: Result<Vec<NodeRow>, surrealdb::Error> = result.and_then(|mut res| res.take(0));
        match rows {
            Ok(rows) => Ok(!rows.is_empty()),
            Err(e) if is_conflict(&e) => {
                debug!(key, error = %e, "conditional write lost to a concurrent writer");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `step` against the current document of `key` until its write
    /// lands, it aborts, or the retry policy is exhausted.
    async fn mutate_node(
        &self,
        key: &str,
        label: &NodePath,
        step: &(dyn Fn(Value) -> Step + Send + Sync),
    ) -> StoreResult<TransactionOutcome> {
        for attempt in 1..=self.retry.max_attempts {
            let row = self.load(key).await?;
            let (expected, doc) = match &row {
                Some(row) => (Some(row.version), row.decode()?),
                None => (None, Value::Null),
            };

            match step(doc) {
                Step::Abort(snapshot) => return Ok(TransactionOutcome::aborted(snapshot)),
                Step::Write { doc, snapshot } => {
                    if self.compare_and_swap(key, expected, &doc).await? {
                        return Ok(TransactionOutcome::committed(snapshot));
                    }
                }
            }

            if attempt < self.retry.max_attempts {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    path = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "CAS conflict, re-running update"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(StoreError::Transaction {
            path: label.to_string(),
            attempts: self.retry.max_attempts,
        })
    }
}

/// Unique-index violations and engine-level transaction conflicts both mean
/// "someone else wrote this row first".
fn is_conflict(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("already contains") || msg.contains("already exists") || msg.contains("conflict")
}

#[async_trait]
impl TreeStore for SurrealTreeStore {
    #[instrument(skip(self), fields(path = %path), level = "debug")]
    async fn get(&self, path: &NodePath) -> StoreResult<Value> {
        if path.is_reserved() {
            return self.read_reserved(path).await;
        }

        let Some(key) = path.head() else {
            let rows = self.load_all().await?;
            if rows.is_empty() {
                return Ok(Value::Null);
            }
            let mut tree = Map::new();
            for row in rows {
                let doc = row.decode()?;
                tree.insert(row.node_key, doc);
            }
            return Ok(Value::Object(tree));
        };

        let Some(row) = self.load(key).await? else {
            debug!("node not found");
            return Ok(Value::Null);
        };
        let doc = row.decode()?;
        Ok(value_at(&doc, path.tail()).cloned().unwrap_or(Value::Null))
    }

    #[instrument(skip(self, value), fields(path = %path))]
    async fn set(&self, path: &NodePath, value: Value) -> StoreResult<()> {
        ensure_writable(path, true)?;
        let key = path.head().unwrap_or_default();
        let tail = path.tail();

        let step = |mut doc: Value| {
            if write_at(&mut doc, tail, value.clone()) {
                doc = Value::Null;
            }
            Step::Write {
                doc,
                snapshot: value.clone(),
            }
        };
        self.mutate_node(key, path, &step).await?;
        debug!("set committed");
        Ok(())
    }

    #[instrument(skip(self, partial), fields(path = %path, keys = partial.len()))]
    async fn update(&self, path: &NodePath, partial: Map<String, Value>) -> StoreResult<()> {
        ensure_writable(path, false)?;

        for (key, writes) in group_writes(path, partial)? {
            let label = NodePath::root().child(&key)?;
            let step = |mut doc: Value| {
                for (tail, value) in &writes {
                    if write_at(&mut doc, tail, value.clone()) {
                        doc = Value::Null;
                    }
                }
                Step::Write {
                    doc,
                    snapshot: Value::Null,
                }
            };
            self.mutate_node(&key, &label, &step).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, update), fields(path = %path), level = "debug")]
    async fn transaction(
        &self,
        path: &NodePath,
        update: &UpdateFn<'_>,
    ) -> StoreResult<TransactionOutcome> {
        ensure_writable(path, true)?;
        let key = path.head().unwrap_or_default();
        let tail = path.tail();

        let step = |mut doc: Value| {
            let current = value_at(&doc, tail).cloned().unwrap_or(Value::Null);
            match update(current.clone()) {
                None => Step::Abort(current),
                Some(next) => {
                    if write_at(&mut doc, tail, next.clone()) {
                        doc = Value::Null;
                    }
                    Step::Write {
                        doc,
                        snapshot: next,
                    }
                }
            }
        };
        self.mutate_node(key, path, &step).await
    }
}
