//! Data access layer: collection CRUD with out-of-band storage keys
//!
//! Every entity read from the store comes back as a [`Keyed`] value: the
//! payload plus the storage key it was found under. `Keyed` deliberately has
//! no `Serialize` impl, so the key can never be written back into a payload.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::path::NodePath;
use crate::storage_traits::{StoreResult, TreeStore};

/// An entity paired with the storage key it lives under.
///
/// The key is identity, not data: it is attached after reading and stripped
/// before writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    key: Option<String>,
    payload: T,
}

impl<T> Keyed<T> {
    /// A payload that has not been stored yet.
    pub fn new(payload: T) -> Self {
        Self { key: None, payload }
    }

    pub fn with_key(key: impl Into<String>, payload: T) -> Self {
        Self {
            key: Some(key.into()),
            payload,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn into_parts(self) -> (Option<String>, T) {
        (self.key, self.payload)
    }
}

impl<T> Deref for Keyed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

/// Turn a keyed map (a collection node) into `(key, object)` entries.
///
/// Scalars and arrays are boxed as `{"value": ...}` so every entry is an
/// addressable object. `null` entries are skipped.
pub fn into_keyed_entries(collection: Value) -> Vec<Keyed<Value>> {
    let Value::Object(map) = collection else {
        return Vec::new();
    };

    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| match value {
            Value::Object(_) => Keyed::with_key(key, value),
            scalar => Keyed::with_key(key, json!({ "value": scalar })),
        })
        .collect()
}

/// Generic CRUD over a [`TreeStore`].
pub struct DataStore<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for DataStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> DataStore<S>
where
    S: TreeStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read the entity at `path`, tagged with the path's last segment.
    #[instrument(skip(self), fields(path = %path), level = "debug")]
    pub async fn get<T: DeserializeOwned>(&self, path: &NodePath) -> StoreResult<Option<Keyed<T>>> {
        let value = self.store.get(path).await?;
        if value.is_null() {
            return Ok(None);
        }
        let payload = serde_json::from_value(value)?;
        Ok(Some(match path.key() {
            Some(key) => Keyed::with_key(key, payload),
            None => Keyed::new(payload),
        }))
    }

    /// Overwrite the value at `path`.
    pub async fn set<T: Serialize + ?Sized>(&self, path: &NodePath, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.store.set(path, value).await
    }

    /// Write an entity's payload under `collection/<key>`. The key itself is
    /// never part of what is written.
    pub async fn set_entity<T: Serialize>(
        &self,
        collection: &NodePath,
        key: &str,
        entity: &Keyed<T>,
    ) -> StoreResult<()> {
        let path = collection.child(key)?;
        self.set(&path, entity.payload()).await
    }

    /// Shallow-merge `partial` into the object at `path`.
    pub async fn update(&self, path: &NodePath, partial: Map<String, Value>) -> StoreResult<()> {
        self.store.update(path, partial).await
    }

    /// Append `value` to `collection` under a freshly generated key.
    #[instrument(skip(self, value), fields(collection = %collection))]
    pub async fn push<T: Serialize>(&self, collection: &NodePath, value: &T) -> StoreResult<String> {
        let key = generate_push_key();
        let path = collection.child(&key)?;
        self.set(&path, value).await?;
        debug!(key = %key, "pushed entity");
        Ok(key)
    }

    pub async fn remove(&self, path: &NodePath) -> StoreResult<()> {
        self.store.remove(path).await
    }

    /// Every entry of `collection`, keyed, in key order.
    pub async fn list<T: DeserializeOwned>(&self, collection: &NodePath) -> StoreResult<Vec<Keyed<T>>> {
        let value = self.store.get(collection).await?;
        into_keyed_entries(value)
            .into_iter()
            .map(|entry| {
                let (key, payload) = entry.into_parts();
                Ok(Keyed {
                    key,
                    payload: serde_json::from_value(payload)?,
                })
            })
            .collect()
    }

    /// Entries of `collection` whose `field` equals `expected`.
    ///
    /// The store has no indexes, so this is a full scan of the collection.
    #[instrument(skip(self, expected), fields(collection = %collection), level = "debug")]
    pub async fn find_all_by_equality<T: DeserializeOwned>(
        &self,
        collection: &NodePath,
        field: &str,
        expected: &Value,
    ) -> StoreResult<Vec<Keyed<T>>> {
        let value = self.store.get(collection).await?;
        into_keyed_entries(value)
            .into_iter()
            .filter(|entry| entry.payload().get(field) == Some(expected))
            .map(|entry| {
                let (key, payload) = entry.into_parts();
                Ok(Keyed {
                    key,
                    payload: serde_json::from_value(payload)?,
                })
            })
            .collect()
    }
}

static PUSH_SEQ: AtomicU32 = AtomicU32::new(0);

/// Time-prefixed key: lexical order follows creation order. Within one
/// process the sequence breaks same-millisecond ties; the random tail keeps
/// keys from different processes apart.
fn generate_push_key() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let seq = PUSH_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{:013}-{:08x}-{}", millis, seq, &suffix[..6])
}
