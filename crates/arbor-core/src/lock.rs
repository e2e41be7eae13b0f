//! Lock coordination: a lease mutex over a single store node.
//!
//! The lock is one [`LockRecord`] stored at the lock path. Every mutating
//! decision runs inside the store's single-node transaction, so two
//! executors racing for a vacant or expired lock are serialized by the
//! store. There is no renewal: a lease is valid until `expires_at` and is
//! then reclaimable by anyone.
//!
//! ```text
//! Unlocked --acquire(e)--> Locked(e, t+lease)
//! Locked(e) --release(e) / force_release / expiry cleanup--> Unlocked
//! Locked(e, exp) --acquire(e2) once exp < now--> Locked(e2, now+lease)
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_state::{NodePath, StoreError, TreeStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::{to_datetime, Clock, SystemClock};
use crate::error::{ConfigError, LockError, LockOperation};
use crate::obs;

/// Default node holding the lock record.
pub const DEFAULT_LOCK_PATH: &str = "migrations_lock";

/// Default lease length: five minutes.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

pub const LOCK_PATH_ENV: &str = "ARBOR_LOCK_PATH";
pub const LOCK_TIMEOUT_ENV: &str = "ARBOR_LOCK_TIMEOUT_MS";

/// The stored lock, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub executor_id: String,
    /// Epoch milliseconds.
    pub locked_at: i64,
    /// Epoch milliseconds.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

impl LockRecord {
    /// Reclaimable by another executor.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at < now_ms
    }

    /// Still confers ownership.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// What currently occupies the lock node.
#[derive(Debug, Clone, PartialEq)]
enum LockSlot {
    Vacant,
    Held(LockRecord),
    /// Something that is not a lock record. Treated as held by an unknown
    /// owner until force-released.
    Corrupt,
}

impl LockSlot {
    fn read(value: Value) -> Self {
        if value.is_null() {
            return LockSlot::Vacant;
        }
        match serde_json::from_value::<LockRecord>(value) {
            Ok(record) => LockSlot::Held(record),
            Err(_) => LockSlot::Corrupt,
        }
    }

    fn holder(&self) -> Option<&str> {
        match self {
            LockSlot::Held(record) => Some(record.executor_id.as_str()),
            _ => None,
        }
    }
}

/// Current holder of a valid (unexpired) lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub executor_id: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hostname: Option<String>,
    pub process_id: Option<u32>,
}

impl From<LockRecord> for LockStatus {
    fn from(record: LockRecord) -> Self {
        Self {
            locked_at: to_datetime(record.locked_at),
            expires_at: to_datetime(record.expires_at),
            executor_id: record.executor_id,
            hostname: record.hostname,
            process_id: record.process_id,
        }
    }
}

/// Where the lock lives and how long a lease lasts.
#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub lock_path: NodePath,
    pub lease_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_path: NodePath::root()
                .child(DEFAULT_LOCK_PATH)
                .unwrap_or_else(|_| NodePath::root()),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

impl LockConfig {
    pub fn with_lock_path(mut self, lock_path: NodePath) -> Self {
        self.lock_path = lock_path;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Read `ARBOR_LOCK_PATH` and `ARBOR_LOCK_TIMEOUT_MS`, defaulting both.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(LOCK_PATH_ENV) {
            let path = NodePath::parse(&raw).map_err(|source| ConfigError::Path {
                var: LOCK_PATH_ENV,
                source,
            })?;
            if path.is_root() || path.is_reserved() {
                return Err(ConfigError::Invalid {
                    var: LOCK_PATH_ENV,
                    value: raw,
                    reason: "the lock needs a writable, non-root node".to_string(),
                });
            }
            config.lock_path = path;
        }

        if let Some(raw) = lookup(LOCK_TIMEOUT_ENV) {
            let millis: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                var: LOCK_TIMEOUT_ENV,
                value: raw.clone(),
                reason: format!("{e}"),
            })?;
            if millis == 0 {
                return Err(ConfigError::Invalid {
                    var: LOCK_TIMEOUT_ENV,
                    value: raw,
                    reason: "lease timeout must be positive".to_string(),
                });
            }
            config.lease_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }
}

/// Distributed lease lock over a [`TreeStore`].
pub struct LockService<S: ?Sized> {
    store: Arc<S>,
    path: NodePath,
    lease_ms: i64,
    clock: Arc<dyn Clock>,
    hostname: Option<String>,
    process_id: u32,
}

impl<S> LockService<S>
where
    S: TreeStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: LockConfig) -> Self {
        Self {
            store,
            path: config.lock_path,
            lease_ms: i64::try_from(config.lease_timeout.as_millis()).unwrap_or(i64::MAX),
            clock: Arc::new(SystemClock),
            hostname: local_hostname(),
            process_id: std::process::id(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lock_path(&self) -> &NodePath {
        &self.path
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_ms.max(0) as u64)
    }

    fn fail(&self, operation: LockOperation) -> impl Fn(StoreError) -> LockError + '_ {
        move |source| LockError::new(operation, self.path.to_string(), source)
    }

    /// Try to take the lock for `executor_id`.
    ///
    /// Succeeds when the node is vacant or holds an expired lease. Returns
    /// `false` when someone (including `executor_id` itself) holds a valid
    /// lease, or when the committed record names a different owner.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn acquire_lock(&self, executor_id: &str) -> Result<bool, LockError> {
        // Time is read per attempt: the store may re-run this after backoff.
        let outcome = self
            .store
            .transaction(&self.path, &|current| {
                let now = self.clock.now_ms();
                match LockSlot::read(current) {
                    LockSlot::Vacant => {}
                    LockSlot::Held(record) if record.is_expired_at(now) => {}
                    LockSlot::Held(_) | LockSlot::Corrupt => return None,
                }
                serde_json::to_value(self.candidate(executor_id, now)).ok()
            })
            .await
            .map_err(self.fail(LockOperation::Acquire))?;

        let slot = LockSlot::read(outcome.snapshot);
        match &slot {
            LockSlot::Held(record) if outcome.committed && record.executor_id == executor_id => {
                obs::emit_lock_acquired(&self.path.to_string(), executor_id, record.expires_at);
                Ok(true)
            }
            _ => {
                obs::emit_lock_contended(&self.path.to_string(), executor_id, slot.holder());
                Ok(false)
            }
        }
    }

    fn candidate(&self, executor_id: &str, now: i64) -> LockRecord {
        LockRecord {
            executor_id: executor_id.to_string(),
            locked_at: now,
            expires_at: now.saturating_add(self.lease_ms),
            hostname: self.hostname.clone(),
            process_id: Some(self.process_id),
        }
    }

    /// Whether `executor_id` holds a valid lease right now.
    #[instrument(skip(self), fields(path = %self.path), level = "debug")]
    pub async fn verify_lock_ownership(&self, executor_id: &str) -> Result<bool, LockError> {
        let outcome = self
            .store
            .transaction(&self.path, &|_| None)
            .await
            .map_err(self.fail(LockOperation::VerifyOwnership))?;

        let now = self.clock.now_ms();
        Ok(matches!(
            LockSlot::read(outcome.snapshot),
            LockSlot::Held(record) if record.executor_id == executor_id && record.is_valid_at(now)
        ))
    }

    /// Delete the lock if, and only if, `executor_id` holds it.
    ///
    /// Releasing someone else's lock (or a vacant one) is a silent no-op.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn release_lock(&self, executor_id: &str) -> Result<(), LockError> {
        let outcome = self
            .store
            .transaction(&self.path, &|current| match LockSlot::read(current) {
                LockSlot::Held(record) if record.executor_id == executor_id => Some(Value::Null),
                _ => None,
            })
            .await
            .map_err(self.fail(LockOperation::Release))?;

        if outcome.committed {
            obs::emit_lock_released(&self.path.to_string(), executor_id);
        } else {
            debug!(executor_id, "release skipped, lock not held by caller");
        }
        Ok(())
    }

    /// The valid lease, if any. A lapsed lease reads as `None` even before
    /// anyone clears it.
    #[instrument(skip(self), fields(path = %self.path), level = "debug")]
    pub async fn get_lock_status(&self) -> Result<Option<LockStatus>, LockError> {
        let value = self
            .store
            .get(&self.path)
            .await
            .map_err(self.fail(LockOperation::Status))?;

        let now = self.clock.now_ms();
        Ok(match LockSlot::read(value) {
            LockSlot::Held(record) if record.is_valid_at(now) => Some(record.into()),
            _ => None,
        })
    }

    /// Delete the lock regardless of who holds it. Operator escape hatch.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn force_release_lock(&self) -> Result<(), LockError> {
        let previous: Mutex<Option<String>> = Mutex::new(None);

        self.store
            .transaction(&self.path, &|current| {
                if let Ok(mut seen) = previous.lock() {
                    *seen = LockSlot::read(current).holder().map(str::to_string);
                }
                Some(Value::Null)
            })
            .await
            .map_err(self.fail(LockOperation::ForceRelease))?;

        let previous = previous.into_inner().unwrap_or_else(|e| e.into_inner());
        obs::emit_lock_force_released(&self.path.to_string(), previous.as_deref());
        Ok(())
    }

    /// Clear the lock only if its lease has lapsed.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn check_and_release_expired_lock(&self) -> Result<(), LockError> {
        let cleared: Mutex<Option<LockRecord>> = Mutex::new(None);

        let outcome = self
            .store
            .transaction(&self.path, &|current| match LockSlot::read(current) {
                LockSlot::Held(record) if record.is_expired_at(self.clock.now_ms()) => {
                    if let Ok(mut seen) = cleared.lock() {
                        *seen = Some(record);
                    }
                    Some(Value::Null)
                }
                _ => None,
            })
            .await
            .map_err(self.fail(LockOperation::ReleaseExpired))?;

        if outcome.committed {
            let cleared = cleared.into_inner().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = cleared {
                obs::emit_lock_expired_cleared(
                    &self.path.to_string(),
                    &record.executor_id,
                    record.expires_at,
                );
            }
        }
        Ok(())
    }

    /// Preflight for lock storage: reachable, writable by transaction, and
    /// free of a stale lease.
    ///
    /// An unreachable store is an error here.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn init_lock_storage(&self) -> Result<bool, LockError> {
        let connected = self
            .store
            .check_connection()
            .await
            .map_err(self.fail(LockOperation::InitStorage))?;
        if !connected {
            return Err(LockError::new(
                LockOperation::InitStorage,
                self.path.to_string(),
                StoreError::Connection("store reported itself disconnected".to_string()),
            ));
        }

        self.store
            .transaction(&self.path, &|_| None)
            .await
            .map_err(self.fail(LockOperation::InitStorage))?;

        self.check_and_release_expired_lock().await?;
        Ok(true)
    }

    /// Preflight that only looks: `Ok(false)` when the store is unreachable,
    /// `Ok(true)` when the lock node can be read and transacted on.
    #[instrument(skip(self), fields(path = %self.path), level = "debug")]
    pub async fn ensure_lock_storage_accessible(&self) -> Result<bool, LockError> {
        let connected = self
            .store
            .check_connection()
            .await
            .map_err(self.fail(LockOperation::CheckAccess))?;
        if !connected {
            debug!("lock storage unreachable");
            return Ok(false);
        }

        self.store
            .get(&self.path)
            .await
            .map_err(self.fail(LockOperation::CheckAccess))?;
        self.store
            .transaction(&self.path, &|_| None)
            .await
            .map_err(self.fail(LockOperation::CheckAccess))?;
        Ok(true)
    }

    /// Run `work` while holding the lock.
    ///
    /// Returns `Ok(None)` without running `work` when the lock is taken.
    /// Never retries. A lease that lapses while `work` runs is reported but
    /// the result is still returned.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        executor_id: &str,
        work: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_lock(executor_id).await? {
            return Ok(None);
        }
        if !self.verify_lock_ownership(executor_id).await? {
            obs::emit_lock_lease_lost(&self.path.to_string(), executor_id);
            return Ok(None);
        }

        let output = work().await;

        if !self.verify_lock_ownership(executor_id).await? {
            obs::emit_lock_lease_lost(&self.path.to_string(), executor_id);
        }
        self.release_lock(executor_id).await?;
        Ok(Some(output))
    }
}

/// Identity for one executor: `<host>-<pid>-<random>`.
pub fn generate_executor_id() -> String {
    let host = local_hostname().unwrap_or_else(|| "unknown-host".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &nonce[..8])
}

fn local_hostname() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn record_wire_shape_is_camel_case() {
        let record = LockRecord {
            executor_id: "a".into(),
            locked_at: 1,
            expires_at: 2,
            hostname: None,
            process_id: Some(7),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"executorId": "a", "lockedAt": 1, "expiresAt": 2, "processId": 7})
        );
    }

    #[test]
    fn unparseable_value_is_corrupt_not_vacant() {
        assert_eq!(LockSlot::read(Value::Null), LockSlot::Vacant);
        assert_eq!(LockSlot::read(json!("garbage")), LockSlot::Corrupt);
        assert_eq!(LockSlot::read(json!({"executorId": 3})), LockSlot::Corrupt);
    }

    #[test]
    fn expiry_boundary_is_neither_valid_nor_reclaimable() {
        let record = LockRecord {
            executor_id: "a".into(),
            locked_at: 0,
            expires_at: 100,
            hostname: None,
            process_id: None,
        };
        assert!(!record.is_valid_at(100));
        assert!(!record.is_expired_at(100));
        assert!(record.is_valid_at(99));
        assert!(record.is_expired_at(101));
    }

    #[test]
    fn config_from_lookup() {
        let vars = HashMap::from([
            (LOCK_PATH_ENV, "locks/migrations".to_string()),
            (LOCK_TIMEOUT_ENV, "5000".to_string()),
        ]);
        let config = LockConfig::from_lookup(|var| vars.get(var).cloned()).unwrap();
        assert_eq!(config.lock_path.to_string(), "locks/migrations");
        assert_eq!(config.lease_timeout, Duration::from_millis(5000));

        let defaults = LockConfig::from_lookup(|_| None).unwrap();
        assert_eq!(defaults, LockConfig::default());
        assert_eq!(defaults.lock_path.to_string(), DEFAULT_LOCK_PATH);
    }

    #[test]
    fn config_rejects_bad_values() {
        let zero = LockConfig::from_lookup(|var| (var == LOCK_TIMEOUT_ENV).then(|| "0".into()));
        assert!(matches!(zero, Err(ConfigError::Invalid { .. })));

        let root = LockConfig::from_lookup(|var| (var == LOCK_PATH_ENV).then(|| "/".into()));
        assert!(matches!(root, Err(ConfigError::Invalid { .. })));

        let bad = LockConfig::from_lookup(|var| (var == LOCK_PATH_ENV).then(|| "a.b".into()));
        assert!(matches!(bad, Err(ConfigError::Path { .. })));
    }

    #[test]
    fn executor_ids_are_unique() {
        assert_ne!(generate_executor_id(), generate_executor_id());
    }
}
