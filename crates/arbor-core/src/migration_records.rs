//! Log of executed migrations.
//!
//! Records live as entries of one collection node, under push keys, so
//! listing them yields execution order.

use std::sync::Arc;

use arbor_state::{DataStore, Keyed, NodePath, StoreResult, TreeStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::error::ConfigError;

pub const DEFAULT_MIGRATIONS_PATH: &str = "migrations";
pub const MIGRATIONS_PATH_ENV: &str = "ARBOR_MIGRATIONS_PATH";

/// One executed migration, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub name: String,
    /// Ordering timestamp of the migration file.
    pub timestamp: i64,
    /// Epoch milliseconds.
    pub started_at: i64,
    /// Epoch milliseconds.
    pub finished_at: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl MigrationRecord {
    /// SHA-256 of a migration's source, hex encoded.
    pub fn checksum_of(source: impl AsRef<[u8]>) -> String {
        hex::encode(Sha256::digest(source.as_ref()))
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// What the migration framework hands over after running a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
    pub name: String,
    pub timestamp: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: String,
}

impl From<MigrationInfo> for MigrationRecord {
    fn from(info: MigrationInfo) -> Self {
        Self {
            name: info.name,
            timestamp: info.timestamp,
            started_at: info.started_at,
            finished_at: info.finished_at,
            status: info.status,
            checksum: None,
        }
    }
}

/// Collection node holding the records: `ARBOR_MIGRATIONS_PATH` or `migrations`.
pub fn migrations_path_from_env() -> Result<NodePath, ConfigError> {
    let raw = std::env::var(MIGRATIONS_PATH_ENV).unwrap_or_else(|_| DEFAULT_MIGRATIONS_PATH.into());
    let path = NodePath::parse(&raw).map_err(|source| ConfigError::Path {
        var: MIGRATIONS_PATH_ENV,
        source,
    })?;
    if path.is_root() || path.is_reserved() {
        return Err(ConfigError::Invalid {
            var: MIGRATIONS_PATH_ENV,
            value: raw,
            reason: "migration history needs a writable, non-root node".to_string(),
        });
    }
    Ok(path)
}

pub struct MigrationRecordStore<S: ?Sized> {
    data: DataStore<S>,
    collection: NodePath,
}

impl<S> MigrationRecordStore<S>
where
    S: TreeStore + ?Sized,
{
    /// Store records under `migrations`.
    pub fn new(store: Arc<S>) -> Self {
        let collection = NodePath::root()
            .child(DEFAULT_MIGRATIONS_PATH)
            .unwrap_or_else(|_| NodePath::root());
        Self::with_collection(DataStore::new(store), collection)
    }

    pub fn with_collection(data: DataStore<S>, collection: NodePath) -> Self {
        Self { data, collection }
    }

    pub fn collection(&self) -> &NodePath {
        &self.collection
    }

    /// Every record, in execution order.
    pub async fn get_all_executed(&self) -> StoreResult<Vec<Keyed<MigrationRecord>>> {
        self.data.list(&self.collection).await
    }

    /// Insert a record without a key, overwrite one with a key. Returns the
    /// record tagged with the key it was stored under.
    #[instrument(skip(self, record), fields(name = %record.name, key = ?record.key()))]
    pub async fn save(&self, record: Keyed<MigrationRecord>) -> StoreResult<Keyed<MigrationRecord>> {
        let (key, payload) = record.into_parts();
        let key = match key {
            Some(key) => {
                self.data
                    .set(&self.collection.child(&key)?, &payload)
                    .await?;
                key
            }
            None => self.data.push(&self.collection, &payload).await?,
        };
        info!(key = %key, status = %payload.status, "migration record saved");
        Ok(Keyed::with_key(key, payload))
    }

    /// Record a freshly executed migration.
    pub async fn save_info(&self, info: MigrationInfo) -> StoreResult<Keyed<MigrationRecord>> {
        self.save(Keyed::new(info.into())).await
    }

    /// Delete every record with this timestamp. Returns whether any existed.
    ///
    /// The collection has no index on `timestamp`, so this scans it.
    #[instrument(skip(self))]
    pub async fn remove(&self, timestamp: i64) -> StoreResult<bool> {
        let matches: Vec<String> = self
            .get_all_executed()
            .await?
            .into_iter()
            .filter(|record| record.timestamp == timestamp)
            .filter_map(|record| record.key().map(str::to_string))
            .collect();

        for key in &matches {
            self.data.remove(&self.collection.child(key)?).await?;
        }
        debug!(removed = matches.len(), "migration records removed");
        Ok(!matches.is_empty())
    }

    pub async fn find_by_name(&self, name: &str) -> StoreResult<Vec<Keyed<MigrationRecord>>> {
        self.data
            .find_all_by_equality(&self.collection, "name", &json!(name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            MigrationRecord::checksum_of(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn info_converts_without_checksum() {
        let record: MigrationRecord = MigrationInfo {
            name: "001_init".into(),
            timestamp: 1,
            started_at: 10,
            finished_at: 20,
            status: "completed".into(),
        }
        .into();
        assert_eq!(record.checksum, None);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "name": "001_init",
                "timestamp": 1,
                "startedAt": 10,
                "finishedAt": 20,
                "status": "completed"
            })
        );
    }
}
