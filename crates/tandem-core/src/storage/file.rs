//! JSON-file storage medium
//!
//! Each area is one JSON object on disk (`local.json`, `sync.json`) under
//! the data directory. Writes are atomic (write to temp file, then rename)
//! and announced on an in-process change feed. Changes made by other
//! processes are not observed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::area::{
    item_size, AreaName, AreaQuota, ChangeBatch, StorageArea, StorageChange, StorageNamespace,
};
use super::error::{BackendError, BackendResult};

const FEED_CAPACITY: usize = 64;

/// File-backed storage namespace
pub struct FileStorage {
    data_dir: PathBuf,
    local: Arc<FileArea>,
    sync: Arc<FileArea>,
    changes: broadcast::Sender<ChangeBatch>,
}

impl FileStorage {
    /// Unlimited areas stored under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_quota(data_dir, AreaQuota::unlimited())
    }

    /// Areas stored under `data_dir`, both enforcing `quota`
    pub fn with_quota(data_dir: impl Into<PathBuf>, quota: AreaQuota) -> Self {
        let data_dir = data_dir.into();
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let area = |name: AreaName| {
            Arc::new(FileArea {
                name,
                path: data_dir.join(format!("{}.json", name)),
                quota,
                write_lock: Mutex::new(()),
                changes: changes.clone(),
            })
        };
        Self {
            local: area(AreaName::Local),
            sync: area(AreaName::Sync),
            data_dir,
            changes,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the file backing an area
    pub fn area_path(&self, name: AreaName) -> &Path {
        match name {
            AreaName::Local => &self.local.path,
            AreaName::Sync => &self.sync.path,
        }
    }
}

impl StorageNamespace for FileStorage {
    fn area(&self, name: AreaName) -> Arc<dyn StorageArea> {
        match name {
            AreaName::Local => Arc::clone(&self.local) as Arc<dyn StorageArea>,
            AreaName::Sync => Arc::clone(&self.sync) as Arc<dyn StorageArea>,
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes.subscribe()
    }
}

/// One area file
pub struct FileArea {
    name: AreaName,
    path: PathBuf,
    quota: AreaQuota,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<ChangeBatch>,
}

impl FileArea {
    /// Read the whole area; a missing file is an empty area
    async fn read_all(&self) -> BackendResult<Map<String, Value>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(BackendError::from_io(e, self.path.clone())),
        };
        if bytes.is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_slice(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(BackendError::Backend(format!(
                "{} does not contain a JSON object (found {})",
                self.path.display(),
                kind_of(&other)
            ))),
        }
    }

    fn check_quota(&self, data: &Map<String, Value>, key: &str, value: &Value) -> BackendResult<()> {
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
            let needed = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| item_size(k, v))
                .sum::<u64>()
                + size;
            if needed > limit {
                return Err(BackendError::QuotaBytes { needed, limit });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageArea for FileArea {
    async fn get(&self, key: &str) -> BackendResult<Option<Value>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> BackendResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut data = self.read_all().await?;
        self.check_quota(&data, key, &value)?;
        let old_value = data.insert(key.to_string(), value.clone());

        let bytes = serde_json::to_vec_pretty(&Value::Object(data))?;
        atomic_write(&self.path, &bytes).await?;
        debug!(area = %self.name, key, bytes = bytes.len(), "Wrote area file");

        let mut changes = HashMap::new();
        changes.insert(
            key.to_string(),
            StorageChange {
                new_value: Some(value),
                old_value,
            },
        );
        let _ = self.changes.send(ChangeBatch {
            area: self.name,
            changes,
        });
        Ok(())
    }

    async fn bytes_in_use(&self) -> BackendResult<u64> {
        let data = self.read_all().await?;
        Ok(data.iter().map(|(k, v)| item_size(k, v)).sum())
    }

    fn quota(&self) -> AreaQuota {
        self.quota
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Write data to a file atomically
///
/// Writes to a temp file next to the target, syncs it, then renames it
/// over the target.
async fn atomic_write(path: &Path, data: &[u8]) -> BackendResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| BackendError::from_io(e, parent.to_path_buf()))?;
    }

    let temp_path = path.with_extension("json.tmp");
    let io_err = |e: std::io::Error| BackendError::from_io(e, temp_path.clone());

    let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
    file.write_all(data).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| BackendError::from_io(e, path.to_path_buf()))?;
    Ok(())
}
