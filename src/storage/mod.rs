//! Shared KV storage with per-key TTLs
//!
//! The session core records presence, routing and snapshot state through the
//! [Storage] trait so that gateway nodes can share a backend (Redis or
//! similar). [MemoryStorage] is the single-node backend and the one used in
//! tests.

use futures_util::future::BoxFuture;
use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

/// Value shape stored under a key
///
/// Shared backends hand values back in whatever shape their client library
/// produces, so readers must accept decoded JSON, raw byte strings and
/// native strings
#[derive(Debug, Clone)]
pub enum StorageValue {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl StorageValue {
    /// Encodes a serializable value into the JSON shape
    pub fn encode<T: Serialize>(value: &T) -> Result<StorageValue, StorageError> {
        Ok(StorageValue::Json(serde_json::to_value(value)?))
    }

    /// Decodes the stored value regardless of the shape the backend
    /// returned it in
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        let value = match self {
            StorageValue::Json(value) => serde_json::from_value(value.clone())?,
            StorageValue::Bytes(bytes) => serde_json::from_slice(bytes)?,
            StorageValue::Text(text) => serde_json::from_str(text)?,
        };
        Ok(value)
    }
}

/// Errors produced by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to serialize stored value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Contract every storage backend must provide
///
/// All operations are idempotent on missing keys: getting a missing key
/// yields [None], deleting a missing key succeeds
pub trait Storage: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str)
        -> BoxFuture<'a, Result<Option<StorageValue>, StorageError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: StorageValue,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

struct Entry {
    value: StorageValue,
    expires_at: Instant,
}

/// In-process storage backend with lazy expiry plus a background sweep
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    /// Interval between expired-entry sweeps
    const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    /// Removes every expired entry, returning the removed count
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let entries = &mut *self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of live entries (test hook)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Background task that periodically drops expired entries
pub async fn expiry_sweep(storage: Arc<MemoryStorage>) {
    let mut interval = tokio::time::interval(MemoryStorage::SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let removed = storage.sweep_expired();
        if removed > 0 {
            debug!("storage sweep removed {} expired entries", removed);
        }
    }
}

impl Storage for MemoryStorage {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<StorageValue>, StorageError>> {
        Box::pin(async move {
            let entries = self.entries.read();
            let entry = match entries.get(key) {
                Some(value) => value,
                None => return Ok(None),
            };

            if entry.expires_at <= Instant::now() {
                // Leave removal to the sweep, callers just see a miss
                return Ok(None);
            }

            Ok(Some(entry.value.clone()))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: StorageValue,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.entries.write().insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.entries.write().remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::{MemoryStorage, Storage, StorageValue};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let storage = MemoryStorage::default();
        let record = Record {
            name: "a".to_string(),
            count: 3,
        };

        storage
            .set(
                "k",
                StorageValue::encode(&record).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let loaded: Record = storage.get("k").await.unwrap().unwrap().decode().unwrap();
        assert_eq!(loaded, record);
    }

    /// Values must decode regardless of the shape the backend returned
    #[test]
    fn test_decode_all_shapes() {
        let record = Record {
            name: "b".to_string(),
            count: 7,
        };
        let json = serde_json::to_value(&record).unwrap();
        let text = serde_json::to_string(&record).unwrap();

        let shapes = [
            StorageValue::Json(json),
            StorageValue::Bytes(text.clone().into_bytes()),
            StorageValue::Text(text),
        ];
        for shape in shapes {
            let decoded: Record = shape.decode().unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let storage = MemoryStorage::default();
        storage
            .set(
                "k",
                StorageValue::Text("1".to_string()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert!(storage.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(storage.get("k").await.unwrap().is_none());

        assert_eq!(storage.sweep_expired(), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let storage = MemoryStorage::default();
        storage.delete("missing").await.unwrap();
    }
}
