//! Persisted storage adapter
//!
//! [`WrappedStorage`] watches one key of one area of a [`StorageNamespace`]
//! and gives the engine a transport-independent contract:
//!
//! - `load()` resolves to the stored value, or `None` on absence or failure
//! - `save(value)` queues a write and returns immediately; writes are
//!   applied in the order they were queued
//! - `subscribe(listener)` receives `(new_value, old_value)` for the watched
//!   key only; deletions are not forwarded
//! - `subscribe_for_error(listener)` receives `(message, quota_exceeded)`
//!   for every failed write
//!
//! Backend errors never propagate out of the adapter.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::area::{item_size, AreaName, ChangeBatch, StorageArea, StorageNamespace};
use super::error::BackendError;
use crate::listeners::{ListenerId, Registry};

/// Receives `(new_value, old_value)` of the watched key
pub type StorageListener = dyn Fn(&Value, Option<&Value>) + Send + Sync;

/// Receives `(message, quota_exceeded)` of a failed write
pub type ErrorListener = dyn Fn(&str, bool) + Send + Sync;

enum WriteOp {
    Save(Value),
    Flush(oneshot::Sender<()>),
}

/// Adapter over one key of a storage area
#[derive(Clone)]
pub struct WrappedStorage {
    shared: Arc<Shared>,
}

/// Non-owning handle to a [`WrappedStorage`]
#[derive(Clone)]
pub struct WeakWrappedStorage {
    shared: Weak<Shared>,
}

impl WeakWrappedStorage {
    pub fn upgrade(&self) -> Option<WrappedStorage> {
        self.shared.upgrade().map(|shared| WrappedStorage { shared })
    }
}

struct Shared {
    namespace: Arc<dyn StorageNamespace>,
    area_name: AreaName,
    area: Arc<dyn StorageArea>,
    key: String,
    listeners: Registry<StorageListener>,
    error_listeners: Registry<ErrorListener>,
    feed: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WrappedStorage {
    pub fn new(
        namespace: Arc<dyn StorageNamespace>,
        area_name: AreaName,
        key: impl Into<String>,
    ) -> Self {
        let area = namespace.area(area_name);
        Self {
            shared: Arc::new(Shared {
                namespace,
                area_name,
                area,
                key: key.into(),
                listeners: Registry::new(),
                error_listeners: Registry::new(),
                feed: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn area_name(&self) -> AreaName {
        self.shared.area_name
    }

    pub fn downgrade(&self) -> WeakWrappedStorage {
        WeakWrappedStorage {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Start forwarding the change feed to listeners
    ///
    /// Idempotent. Requires a tokio runtime; without one the feed stays off.
    pub fn init(&self) {
        let mut feed = lock(&self.shared.feed);
        if feed.is_some() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %self.shared.key, "No async runtime, change feed disabled");
            return;
        };

        let mut changes = self.shared.namespace.subscribe_changes();
        let weak = Arc::downgrade(&self.shared);
        *feed = Some(runtime.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(batch) => match weak.upgrade() {
                        Some(shared) => shared.forward(&batch),
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change feed lagged, notifications dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        debug!(area = %self.shared.area_name, key = %self.shared.key, "Change feed started");
    }

    /// Read the watched key
    pub async fn load(&self) -> Option<Value> {
        match self.shared.area.get(&self.shared.key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.shared.key, error = %e, "Failed to load persisted state");
                None
            }
        }
    }

    /// Queue a write of the watched key
    pub fn save(&self, value: Value) {
        self.enqueue(WriteOp::Save(value));
    }

    /// Wait until every write queued so far has completed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.enqueue(WriteOp::Flush(tx)) {
            let _ = rx.await;
        }
    }

    /// Register a change listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.shared.listeners.add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Register an error listener
    pub fn subscribe_for_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.shared.error_listeners.add(Arc::new(listener))
    }

    pub fn unsubscribe_for_error(&self, id: ListenerId) -> bool {
        self.shared.error_listeners.remove(id)
    }

    fn enqueue(&self, op: WriteOp) -> bool {
        let mut writer = lock(&self.shared.writer);
        if writer.is_none() {
            *writer = self.spawn_writer();
        }
        match writer.as_ref() {
            Some(tx) => tx.send(op).is_ok(),
            None => {
                warn!(key = %self.shared.key, "No async runtime, write dropped");
                false
            }
        }
    }

    fn spawn_writer(&self) -> Option<mpsc::UnboundedSender<WriteOp>> {
        let runtime = Handle::try_current().ok()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        runtime.spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Save(value) => match weak.upgrade() {
                        Some(shared) => shared.persist(value).await,
                        None => break,
                    },
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Some(tx)
    }
}

impl Shared {
    fn forward(&self, batch: &ChangeBatch) {
        if batch.area != self.area_name {
            return;
        }
        let Some(change) = batch.changes.get(&self.key) else {
            return;
        };
        let Some(new_value) = change.new_value.as_ref() else {
            return;
        };
        for listener in self.listeners.snapshot() {
            listener(new_value, change.old_value.as_ref());
        }
    }

    async fn persist(&self, value: Value) {
        let size = item_size(&self.key, &value);
        if let Err(e) = self.area.set(&self.key, value).await {
            self.report_failure(e, size).await;
        }
    }

    /// Decide whether a failed write hit a quota and notify error listeners
    async fn report_failure(&self, error: BackendError, size: u64) {
        let quota = self.area.quota();
        let mut quota_exceeded = quota
            .quota_bytes_per_item
            .filter(|limit| *limit > 0)
            .is_some_and(|limit| size > limit);

        if !quota_exceeded {
            if let Some(limit) = quota.quota_bytes.filter(|limit| *limit > 0) {
                match self.area.bytes_in_use().await {
                    Ok(used) => {
                        // The item being replaced does not count against the new one
                        let replaced = match self.area.get(&self.key).await {
                            Ok(Some(current)) => item_size(&self.key, &current),
                            _ => 0,
                        };
                        quota_exceeded = used.saturating_sub(replaced) + size > limit;
                    }
                    Err(e) => debug!(error = %e, "Could not read bytes in use"),
                }
            }
        }

        let message = error.to_string();
        warn!(
            area = %self.area_name,
            key = %self.key,
            quota_exceeded,
            "Failed to persist state: {}",
            message
        );
        for listener in self.error_listeners.snapshot() {
            listener(&message, quota_exceeded);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(feed) = lock(&self.feed).take() {
            feed.abort();
        }
    }
}

impl fmt::Debug for WrappedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedStorage")
            .field("area", &self.shared.area_name)
            .field("key", &self.shared.key)
            .field("listeners", &self.shared.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::area::AreaQuota;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    type Seen = Arc<Mutex<Vec<(Value, Option<Value>)>>>;

    fn recorder(storage: &WrappedStorage) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        storage.subscribe(move |new, old| {
            sink.lock().unwrap().push((new.clone(), old.cloned()));
        });
        seen
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let storage = WrappedStorage::new(Arc::new(MemoryStorage::new()), AreaName::Local, "k");
        assert_eq!(storage.load().await, None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let storage = WrappedStorage::new(Arc::new(MemoryStorage::new()), AreaName::Sync, "k");
        storage.save(json!({"a": 1}));
        storage.save(json!({"a": 2}));
        storage.flush().await;
        assert_eq!(storage.load().await, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_feed_filters_area_and_key() {
        let memory = Arc::new(MemoryStorage::new());
        let storage = WrappedStorage::new(memory.clone(), AreaName::Local, "watched");
        storage.init();
        storage.init();
        let seen = recorder(&storage);

        memory.area(AreaName::Sync).set("watched", json!(1)).await.unwrap();
        memory.area(AreaName::Local).set("other", json!(2)).await.unwrap();
        memory.area(AreaName::Local).set("watched", json!(3)).await.unwrap();
        memory.area(AreaName::Local).set("watched", json!(4)).await.unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(json!(3), None), (json!(4), Some(json!(3)))]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let memory = Arc::new(MemoryStorage::new());
        let storage = WrappedStorage::new(memory.clone(), AreaName::Local, "k");
        storage.init();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let id = storage.subscribe(move |_, _| *counter.lock().unwrap() += 1);

        storage.save(json!(1));
        storage.flush().await;
        settle().await;
        assert!(storage.unsubscribe(id));
        storage.save(json!(2));
        storage.flush().await;
        settle().await;

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    type Errors = Arc<Mutex<Vec<(String, bool)>>>;

    fn error_recorder(storage: &WrappedStorage) -> Errors {
        let errors: Errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        storage.subscribe_for_error(move |message, quota_exceeded| {
            sink.lock().unwrap().push((message.to_string(), quota_exceeded));
        });
        errors
    }

    #[tokio::test]
    async fn test_per_item_quota_reported() {
        let quota = AreaQuota {
            quota_bytes: None,
            quota_bytes_per_item: Some(16),
        };
        let memory = Arc::new(MemoryStorage::with_quotas(quota, AreaQuota::unlimited()));
        let storage = WrappedStorage::new(memory, AreaName::Local, "k");
        let errors = error_recorder(&storage);

        storage.save(json!("this value is far too long"));
        storage.flush().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("QUOTA_BYTES_PER_ITEM"));
        assert!(errors[0].1);
    }

    #[tokio::test]
    async fn test_aggregate_quota_reported() {
        let quota = AreaQuota {
            quota_bytes: Some(24),
            quota_bytes_per_item: Some(16),
        };
        let memory = Arc::new(MemoryStorage::with_quotas(quota, AreaQuota::unlimited()));
        memory.memory_area(AreaName::Local).seed("other", json!("0123456789"));
        let storage = WrappedStorage::new(memory, AreaName::Local, "k");
        let errors = error_recorder(&storage);

        storage.save(json!("0123456789"));
        storage.flush().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("QUOTA_BYTES"));
        assert!(errors[0].1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_quota() {
        let memory = Arc::new(MemoryStorage::new());
        memory
            .memory_area(AreaName::Local)
            .fail_writes(Some("backend offline".to_string()));
        let storage = WrappedStorage::new(memory, AreaName::Local, "k");
        let errors = error_recorder(&storage);

        storage.save(json!(1));
        storage.flush().await;

        assert_eq!(
            *errors.lock().unwrap(),
            vec![("backend offline".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_replaced_item_not_counted_twice() {
        let quota = AreaQuota {
            quota_bytes: Some(1000),
            quota_bytes_per_item: None,
        };
        let memory = Arc::new(MemoryStorage::with_quotas(quota, AreaQuota::unlimited()));
        let area = memory.memory_area(AreaName::Local);
        area.seed("k", json!("x".repeat(600)));
        area.fail_writes(Some("backend offline".to_string()));
        let storage = WrappedStorage::new(memory, AreaName::Local, "k");
        let errors = error_recorder(&storage);

        storage.save(json!("y".repeat(500)));
        storage.flush().await;

        assert_eq!(
            *errors.lock().unwrap(),
            vec![("backend offline".to_string(), false)]
        );
    }

    #[test]
    fn test_without_runtime() {
        let storage = WrappedStorage::new(Arc::new(MemoryStorage::new()), AreaName::Local, "k");
        storage.init();
        storage.save(json!(1));
    }
}
