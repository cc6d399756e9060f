//! Tandem Core Library
//!
//! Keeps several independently running copies of an application's reducer
//! state consistent through one shared, asynchronous key-value slot.
//!
//! # Architecture
//!
//! - **Engine** (`sync`): owns a local store generation, a snapshot and a
//!   logical clock; persists local changes and merges remote ones
//! - **Adapter** (`storage`): watches one key of one storage area and turns
//!   backend failures into error-listener events
//! - **Store contract** (`store`): the reducer store the engine drives
//!
//! # Quick Start
//!
//! ```text
//! let instantiator = Setup::new()
//!     .store_factory(ReducerFactory::new(todos))
//!     .namespace(Arc::new(FileStorage::new(&config.data_dir)))
//!     .config(&config)
//!     .build()?;
//!
//! let store = instantiator.instantiate(None).await?;
//! store.dispatch(json!({"type": "ADD_TODO", "text": "milk"}));
//! ```
//!
//! # Modules
//!
//! - `value`: structural clone, equality, diff and merge over JSON trees
//! - `snapshot`: persisted `[writer_id, timestamp, state]` format
//! - `listeners`: listener registries and subscription handles
//! - `store`: reducer store contract and reference store
//! - `storage`: storage areas, media and the adapter
//! - `sync`: synchronization engine and store façade
//! - `setup`: factory wiring everything together
//! - `config`: application configuration

pub mod config;
pub mod error;
pub mod listeners;
pub mod setup;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod sync;
pub mod value;

pub use config::Config;
pub use error::ConfigError;
pub use listeners::{ListenerId, Subscription};
pub use setup::{Instantiator, Setup};
pub use snapshot::{PersistedPayload, StateSnapshot, WriterId};
pub use storage::{
    AreaName, AreaQuota, BackendError, FileStorage, MemoryStorage, StorageNamespace, WrappedStorage,
};
pub use store::{reducer, Action, BasicStore, ReactiveStore, Reducer, ReducerFactory, StoreFactory};
pub use sync::{EngineOptions, StateObservable, SyncedStore};
