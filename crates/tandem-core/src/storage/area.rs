//! Storage area capability
//!
//! A storage namespace exposes named areas (`local`, `sync`) and one change
//! feed shared by all of them. Areas come in two transport flavors:
//!
//! - [`StorageArea`]: async completion (the capability the adapter consumes)
//! - [`CallbackStorageArea`]: completion callbacks, bridged into
//!   [`StorageArea`] by [`Callbacked`]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use super::error::{BackendError, BackendResult};

/// Name of a storage area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaName {
    #[default]
    Local,
    Sync,
}

impl AreaName {
    /// Parse leniently: anything other than "sync" is the local area
    pub fn parse_lenient(name: &str) -> Self {
        if name.eq_ignore_ascii_case("sync") {
            AreaName::Sync
        } else {
            AreaName::Local
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AreaName::Local => "local",
            AreaName::Sync => "sync",
        }
    }
}

impl fmt::Display for AreaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AreaName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

/// Limits reported by an area; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaQuota {
    /// Aggregate limit for the whole area
    pub quota_bytes: Option<u64>,
    /// Limit for a single item (key + serialized value)
    pub quota_bytes_per_item: Option<u64>,
}

impl AreaQuota {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Serialized size of an item as counted against quotas
pub fn item_size(key: &str, value: &Value) -> u64 {
    let serialized = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
    (key.len() + serialized) as u64
}

/// One key's change
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

/// All changes from one write, tagged with the area they happened in
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub area: AreaName,
    pub changes: HashMap<String, StorageChange>,
}

/// Async storage area
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> BackendResult<Option<Value>>;

    /// Write one key
    async fn set(&self, key: &str, value: Value) -> BackendResult<()>;

    /// Total bytes currently used by the area
    async fn bytes_in_use(&self) -> BackendResult<u64>;

    /// Limits of this area
    fn quota(&self) -> AreaQuota;
}

/// Completion callback for reads
pub type GetCallback = Box<dyn FnOnce(BackendResult<Option<Value>>) + Send>;
/// Completion callback for writes
pub type SetCallback = Box<dyn FnOnce(BackendResult<()>) + Send>;
/// Completion callback for usage queries
pub type UsageCallback = Box<dyn FnOnce(BackendResult<u64>) + Send>;

/// Callback-style storage area
pub trait CallbackStorageArea: Send + Sync {
    fn get(&self, key: &str, done: GetCallback);
    fn set(&self, key: &str, value: Value, done: SetCallback);
    fn bytes_in_use(&self, done: UsageCallback);
    fn quota(&self) -> AreaQuota;
}

/// Bridges a [`CallbackStorageArea`] into a [`StorageArea`]
pub struct Callbacked<C: ?Sized> {
    inner: Arc<C>,
}

impl<C: CallbackStorageArea + ?Sized> Callbacked<C> {
    pub fn new(inner: Arc<C>) -> Self {
        Self { inner }
    }
}

fn dropped_callback() -> BackendError {
    BackendError::Backend("storage area dropped the completion callback".to_string())
}

#[async_trait]
impl<C: CallbackStorageArea + ?Sized> StorageArea for Callbacked<C> {
    async fn get(&self, key: &str) -> BackendResult<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.get(
            key,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or_else(|_| Err(dropped_callback()))
    }

    async fn set(&self, key: &str, value: Value) -> BackendResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.set(
            key,
            value,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or_else(|_| Err(dropped_callback()))
    }

    async fn bytes_in_use(&self) -> BackendResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.inner.bytes_in_use(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or_else(|_| Err(dropped_callback()))
    }

    fn quota(&self) -> AreaQuota {
        self.inner.quota()
    }
}

/// A storage medium: named areas plus a shared change feed
pub trait StorageNamespace: Send + Sync {
    /// The area with the given name
    fn area(&self, name: AreaName) -> Arc<dyn StorageArea>;

    /// Subscribe to changes in every area
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch>;
}
