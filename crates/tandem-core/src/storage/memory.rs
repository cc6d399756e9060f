//! In-process storage medium
//!
//! Two areas (`local` and `sync`) backed by hash maps, sharing one broadcast
//! change feed. Every write is announced on the feed, including writes that
//! store an equal value. Quotas are enforced on write.
//!
//! ## Usage
//!
//! ```ignore
//! let storage = Arc::new(MemoryStorage::new());
//! let area = storage.area(AreaName::Local);
//! area.set("tandem", json!([...])).await?;
//! ```
//!
//! [`MemoryStorage::with_callbacks`] exposes the same data through the
//! callback transport, bridged by [`Callbacked`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::area::{
    item_size, AreaName, AreaQuota, Callbacked, CallbackStorageArea, ChangeBatch, GetCallback,
    SetCallback, StorageArea, StorageChange, StorageNamespace, UsageCallback,
};
use super::error::{BackendError, BackendResult};

/// Capacity of the change feed before slow subscribers start lagging
const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Async,
    Callback,
}

/// In-memory storage namespace
pub struct MemoryStorage {
    local: Arc<MemoryArea>,
    sync: Arc<MemoryArea>,
    changes: broadcast::Sender<ChangeBatch>,
    transport: Transport,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Unlimited areas, async transport
    pub fn new() -> Self {
        Self::with_quotas(AreaQuota::unlimited(), AreaQuota::unlimited())
    }

    /// Areas with the given limits
    pub fn with_quotas(local: AreaQuota, sync: AreaQuota) -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            local: Arc::new(MemoryArea::new(AreaName::Local, local, changes.clone())),
            sync: Arc::new(MemoryArea::new(AreaName::Sync, sync, changes.clone())),
            changes,
            transport: Transport::Async,
        }
    }

    /// Serve areas through the callback transport
    pub fn with_callbacks(mut self) -> Self {
        self.transport = Transport::Callback;
        self
    }

    /// Direct access to an area, for seeding data and inspecting writes
    pub fn memory_area(&self, name: AreaName) -> Arc<MemoryArea> {
        match name {
            AreaName::Local => Arc::clone(&self.local),
            AreaName::Sync => Arc::clone(&self.sync),
        }
    }
}

impl StorageNamespace for MemoryStorage {
    fn area(&self, name: AreaName) -> Arc<dyn StorageArea> {
        let area = self.memory_area(name);
        match self.transport {
            Transport::Async => area as Arc<dyn StorageArea>,
            Transport::Callback => Arc::new(Callbacked::new(area)),
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes.subscribe()
    }
}

/// One in-memory area
pub struct MemoryArea {
    name: AreaName,
    quota: AreaQuota,
    data: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<ChangeBatch>,
    failure: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryArea {
    fn new(name: AreaName, quota: AreaQuota, changes: broadcast::Sender<ChangeBatch>) -> Self {
        Self {
            name,
            quota,
            data: Mutex::new(HashMap::new()),
            changes,
            failure: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value of a key, bypassing the transport
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.data().get(key).cloned()
    }

    /// Store a value without quota checks or change notification
    pub fn seed(&self, key: impl Into<String>, value: Value) {
        self.data().insert(key.into(), value);
    }

    /// Make every following write fail with `message` (`None` restores writes)
    pub fn fail_writes(&self, message: Option<String>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = message;
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn usage(data: &HashMap<String, Value>) -> u64 {
        data.iter().map(|(k, v)| item_size(k, v)).sum()
    }

    fn check_quota(&self, data: &HashMap<String, Value>, key: &str, value: &Value) -> BackendResult<()> {
        let size = item_size(key, value);
        if let Some(limit) = self.quota.quota_bytes_per_item {
            if size > limit {
                return Err(BackendError::QuotaBytesPerItem {
                    key: key.to_string(),
                    size,
                    limit,
                });
            }
        }
        if let Some(limit) = self.quota.quota_bytes {
            let others: u64 = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| item_size(k, v))
                .sum();
            if others + size > limit {
                return Err(BackendError::QuotaBytes {
                    needed: others + size,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn write(&self, key: &str, value: Value) -> BackendResult<()> {
        if let Some(message) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(BackendError::Backend(message));
        }

        let old_value = {
            let mut data = self.data();
            self.check_quota(&data, key, &value)?;
            data.insert(key.to_string(), value.clone())
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut changes = HashMap::new();
        changes.insert(
            key.to_string(),
            StorageChange {
                new_value: Some(value),
                old_value,
            },
        );
        // No subscribers is not an error
        let _ = self.changes.send(ChangeBatch {
            area: self.name,
            changes,
        });
        Ok(())
    }
}

#[async_trait]
impl StorageArea for MemoryArea {
    async fn get(&self, key: &str) -> BackendResult<Option<Value>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: Value) -> BackendResult<()> {
        self.write(key, value)
    }

    async fn bytes_in_use(&self) -> BackendResult<u64> {
        Ok(Self::usage(&self.data()))
    }

    fn quota(&self) -> AreaQuota {
        self.quota
    }
}

impl CallbackStorageArea for MemoryArea {
    fn get(&self, key: &str, done: GetCallback) {
        done(Ok(self.peek(key)));
    }

    fn set(&self, key: &str, value: Value, done: SetCallback) {
        done(self.write(key, value));
    }

    fn bytes_in_use(&self, done: UsageCallback) {
        done(Ok(Self::usage(&self.data())));
    }

    fn quota(&self) -> AreaQuota {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_feed() {
        let storage = MemoryStorage::new();
        let mut feed = storage.subscribe_changes();
        let area = storage.area(AreaName::Sync);

        area.set("k", json!({"a": 1})).await.unwrap();
        area.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(json!({"a": 1})));

        let first = feed.recv().await.unwrap();
        assert_eq!(first.area, AreaName::Sync);
        assert_eq!(first.changes["k"].old_value, None);

        // Equal values are still announced
        let second = feed.recv().await.unwrap();
        assert_eq!(second.changes["k"].old_value, Some(json!({"a": 1})));
        assert_eq!(storage.memory_area(AreaName::Sync).write_count(), 2);
    }

    #[tokio::test]
    async fn test_areas_are_separate() {
        let storage = MemoryStorage::new();
        storage.area(AreaName::Local).set("k", json!(1)).await.unwrap();
        assert_eq!(storage.area(AreaName::Sync).get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_per_item_quota() {
        let quota = AreaQuota {
            quota_bytes: None,
            quota_bytes_per_item: Some(10),
        };
        let storage = MemoryStorage::with_quotas(quota, AreaQuota::unlimited());
        let area = storage.area(AreaName::Local);

        let err = area.set("key", json!("0123456789")).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaBytesPerItem { .. }));
        assert_eq!(area.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_aggregate_quota() {
        let quota = AreaQuota {
            quota_bytes: Some(20),
            quota_bytes_per_item: None,
        };
        let storage = MemoryStorage::with_quotas(quota, AreaQuota::unlimited());
        let memory = storage.memory_area(AreaName::Local);
        memory.seed("other", json!("abcdefgh"));
        let area = storage.area(AreaName::Local);

        assert_eq!(area.bytes_in_use().await.unwrap(), 15);
        area.set("k", json!(1)).await.unwrap();
        let err = area.set("k", json!("abcdef")).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaBytes { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let storage = MemoryStorage::new();
        let memory = storage.memory_area(AreaName::Local);
        memory.fail_writes(Some("backend offline".to_string()));

        let err = storage.area(AreaName::Local).set("k", json!(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "backend offline");

        memory.fail_writes(None);
        storage.area(AreaName::Local).set("k", json!(1)).await.unwrap();
        assert_eq!(memory.write_count(), 1);
    }

    #[tokio::test]
    async fn test_callback_transport() {
        let storage = MemoryStorage::new().with_callbacks();
        let area = storage.area(AreaName::Local);
        area.set("k", json!([1])).await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(json!([1])));
        assert_eq!(area.bytes_in_use().await.unwrap(), 4);
    }
}
