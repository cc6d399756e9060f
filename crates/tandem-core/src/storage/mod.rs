//! Storage layer
//!
//! Media implement [`StorageNamespace`]; the engine only ever talks to a
//! [`WrappedStorage`] adapter watching one key of one area.
//!
//! ## Media
//!
//! - [`MemoryStorage`]: in-process, either transport, optional quotas
//! - [`FileStorage`]: one JSON file per area, atomic writes

pub mod area;
pub mod error;
pub mod file;
pub mod memory;
pub mod wrapped;

pub use area::{
    item_size, AreaName, AreaQuota, CallbackStorageArea, Callbacked, ChangeBatch, StorageArea,
    StorageChange, StorageNamespace,
};
pub use error::{BackendError, BackendResult};
pub use file::FileStorage;
pub use memory::{MemoryArea, MemoryStorage};
pub use wrapped::{ErrorListener, StorageListener, WeakWrappedStorage, WrappedStorage};
