//! The contract the migration framework plugs into.

use std::sync::Arc;

use arbor_state::{DataStore, NodePath, TreeStore};

use crate::backup::{BackupConfig, BackupService};
use crate::error::ConfigError;
use crate::lock::{LockConfig, LockService};
use crate::migration_records::{migrations_path_from_env, MigrationRecordStore, DEFAULT_MIGRATIONS_PATH};

/// Set to `0`, `false` or `off` to run without the distributed lock.
pub const LOCKING_ENV: &str = "ARBOR_LOCKING";

/// Services a migration framework needs from a storage plugin.
pub trait MigrationHandler: Send + Sync {
    type Store: TreeStore + ?Sized;

    fn data_store(&self) -> &DataStore<Self::Store>;

    fn backup_service(&self) -> &BackupService<Self::Store>;

    fn migration_record_store(&self) -> &MigrationRecordStore<Self::Store>;

    /// `None` when locking is disabled.
    fn locking_service(&self) -> Option<&LockService<Self::Store>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// `None` disables locking.
    pub lock: Option<LockConfig>,
    pub backup: BackupConfig,
    pub migrations_path: NodePath,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            lock: Some(LockConfig::default()),
            backup: BackupConfig::default(),
            migrations_path: NodePath::root()
                .child(DEFAULT_MIGRATIONS_PATH)
                .unwrap_or_else(|_| NodePath::root()),
        }
    }
}

impl HandlerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let locking = std::env::var(LOCKING_ENV)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        Ok(Self {
            lock: if locking {
                Some(LockConfig::from_env()?)
            } else {
                None
            },
            backup: BackupConfig::from_env()?,
            migrations_path: migrations_path_from_env()?,
        })
    }

    pub fn without_locking(mut self) -> Self {
        self.lock = None;
        self
    }
}

/// [`MigrationHandler`] over any [`TreeStore`]; every service shares one store.
pub struct TreeHandler<S: ?Sized> {
    data: DataStore<S>,
    backup: BackupService<S>,
    records: MigrationRecordStore<S>,
    lock: Option<LockService<S>>,
}

impl<S> TreeHandler<S>
where
    S: TreeStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: HandlerConfig) -> Self {
        let data = DataStore::new(Arc::clone(&store));
        let backup = match &config.lock {
            Some(lock) => config.backup.excluding(lock.lock_path.clone()),
            None => config.backup,
        };
        Self {
            backup: BackupService::new(Arc::clone(&store), backup),
            records: MigrationRecordStore::with_collection(data.clone(), config.migrations_path),
            lock: config
                .lock
                .map(|lock| LockService::new(Arc::clone(&store), lock)),
            data,
        }
    }

    /// Replace the lock service, e.g. to inject a clock. Backups keep the
    /// exclusions chosen in [`TreeHandler::new`].
    pub fn with_lock_service(mut self, lock: LockService<S>) -> Self {
        self.lock = Some(lock);
        self
    }
}

impl<S> MigrationHandler for TreeHandler<S>
where
    S: TreeStore + ?Sized,
{
    type Store = S;

    fn data_store(&self) -> &DataStore<S> {
        &self.data
    }

    fn backup_service(&self) -> &BackupService<S> {
        &self.backup
    }

    fn migration_record_store(&self) -> &MigrationRecordStore<S> {
        &self.records
    }

    fn locking_service(&self) -> Option<&LockService<S>> {
        self.lock.as_ref()
    }
}
