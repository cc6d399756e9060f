//! State synchronization
//!
//! The engine keeps a local reducer store consistent with a shared storage
//! slot written by any number of other engines.
//!
//! ## Usage
//!
//! ```ignore
//! let store = SyncedStore::builder(factory, storage)
//!     .options(EngineOptions::default().plain_actions(true))
//!     .build()?
//!     .init()
//!     .await;
//! let _subscription = store.subscribe(|| println!("changed"));
//! ```

mod engine;
mod observable;
mod options;
mod outdated;

pub use engine::{
    ChangeListener, LocalChangeListener, SyncedStore, SyncedStoreBuilder, WeakSyncedStore,
};
pub use observable::{Observer, StateObservable, StateStream};
pub use options::{
    clamp_buffer_life, clamp_outdated_timeout, EngineOptions, DEFAULT_BUFFER_LIFE_MS,
    DEFAULT_OUTDATED_TIMEOUT_MS, MAX_BUFFER_LIFE_MS, MIN_OUTDATED_TIMEOUT_MS,
};
pub use outdated::OutdatedSubscriptions;
