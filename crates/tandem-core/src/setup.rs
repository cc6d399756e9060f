//! Setup factory
//!
//! Wires a store factory, a storage medium and listeners together once,
//! then hands out initialized engines that all share one storage adapter.
//!
//! ## Usage
//!
//! ```ignore
//! let instantiator = Setup::new()
//!     .store_factory(ReducerFactory::new(todos))
//!     .namespace(Arc::new(MemoryStorage::new()))
//!     .config(&config)
//!     .on_error(|message, quota_exceeded| eprintln!("{message} ({quota_exceeded})"))
//!     .build()?;
//!
//! let store = instantiator.instantiate(None).await?;
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::config::{Config, DEFAULT_STORAGE_KEY};
use crate::error::ConfigError;
use crate::snapshot::PersistedPayload;
use crate::storage::{AreaName, StorageNamespace, WrappedStorage};
use crate::store::StoreFactory;
use crate::sync::{EngineOptions, LocalChangeListener, SyncedStore};

/// Receives an isolated engine holding the new state, and the previous state
pub type GlobalChangeListener = dyn Fn(&SyncedStore, Option<&Value>) + Send + Sync;

/// Builder for an [`Instantiator`]
pub struct Setup {
    store_factory: Option<Arc<dyn StoreFactory>>,
    namespace: Option<Arc<dyn StorageNamespace>>,
    storage_area: AreaName,
    storage_key: String,
    options: EngineOptions,
    on_global_change: Option<Arc<GlobalChangeListener>>,
    on_local_change: Option<Arc<LocalChangeListener>>,
    on_error: Option<Arc<dyn Fn(&str, bool) + Send + Sync>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self::new()
    }
}

impl Setup {
    pub fn new() -> Self {
        Self {
            store_factory: None,
            namespace: None,
            storage_area: AreaName::default(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            options: EngineOptions::default(),
            on_global_change: None,
            on_local_change: None,
            on_error: None,
        }
    }

    pub fn store_factory<F>(mut self, factory: F) -> Self
    where
        F: StoreFactory + 'static,
    {
        self.store_factory = Some(Arc::new(factory));
        self
    }

    pub fn namespace(mut self, namespace: Arc<dyn StorageNamespace>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn storage_area(mut self, area: AreaName) -> Self {
        self.storage_area = area;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Take area, key and engine options from a [`Config`]
    pub fn config(self, config: &Config) -> Self {
        self.storage_area(config.storage_area)
            .storage_key(config.storage_key.clone())
            .options(config.engine_options())
    }

    /// Called on every change of the shared slot, including own writes
    pub fn on_global_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SyncedStore, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_global_change = Some(Arc::new(listener));
        self
    }

    /// Called when an instantiated engine persists a change it made itself
    pub fn on_local_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SyncedStore, &Value) + Send + Sync + 'static,
    {
        self.on_local_change = Some(Arc::new(listener));
        self
    }

    /// Called with `(message, quota_exceeded)` when a write fails
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(listener));
        self
    }

    /// Validate arguments and create the shared storage adapter
    pub fn build(self) -> Result<Instantiator, ConfigError> {
        let factory = self.store_factory.ok_or(ConfigError::MissingStoreFactory)?;
        let namespace = self.namespace.ok_or(ConfigError::MissingStorage)?;

        let storage = WrappedStorage::new(namespace, self.storage_area, self.storage_key);
        storage.init();

        if let Some(on_error) = self.on_error {
            storage.subscribe_for_error(move |message, quota_exceeded| {
                on_error(message, quota_exceeded)
            });
        }

        if let Some(on_global_change) = self.on_global_change {
            let factory = Arc::clone(&factory);
            let weak_storage = storage.downgrade();
            let options = self.options.isolated(true);
            storage.subscribe(move |new_value, old_value| {
                let Some(storage) = weak_storage.upgrade() else {
                    return;
                };
                let engine = match SyncedStore::new(Arc::clone(&factory), storage, options) {
                    Ok(engine) => engine,
                    Err(e) => {
                        error!(error = %e, "Failed to create engine for global change");
                        return;
                    }
                };
                let state = PersistedPayload::decode(new_value.clone()).into_snapshot().value;
                let old_state =
                    old_value.map(|old| PersistedPayload::decode(old.clone()).into_snapshot().value);
                engine.init_from(state);
                on_global_change(&engine, old_state.as_ref());
            });
        }

        debug!(
            area = %storage.area_name(),
            key = storage.key(),
            "Setup complete"
        );
        Ok(Instantiator {
            factory,
            storage,
            options: self.options,
            on_local_change: self.on_local_change,
        })
    }
}

/// Creates initialized engines sharing one storage adapter
#[derive(Clone)]
pub struct Instantiator {
    factory: Arc<dyn StoreFactory>,
    storage: WrappedStorage,
    options: EngineOptions,
    on_local_change: Option<Arc<LocalChangeListener>>,
}

impl Instantiator {
    /// Create an engine and wait until its persisted state is restored
    ///
    /// `reset_state` is merged over the restored state.
    pub async fn instantiate(&self, reset_state: Option<Value>) -> Result<SyncedStore, ConfigError> {
        let mut builder = SyncedStore::builder(Arc::clone(&self.factory), self.storage.clone())
            .options(self.options)
            .reset_state(reset_state);
        if let Some(listener) = &self.on_local_change {
            let listener = Arc::clone(listener);
            builder = builder.local_listener(move |store, old_state| listener(store, old_state));
        }
        Ok(builder.build()?.init().await)
    }

    pub fn storage(&self) -> &WrappedStorage {
        &self.storage
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}
