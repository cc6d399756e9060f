//! Synchronization engine
//!
//! A [`SyncedStore`] owns one local reducer store generation, the snapshot
//! it believes is current, and a logical timestamp. It mediates between the
//! local store and a [`WrappedStorage`] adapter:
//!
//! - **Outbound**: every change of the current generation updates the
//!   snapshot and is persisted as `[writer_id, timestamp, state]`. In
//!   buffered mode a dispatch opens a short window; changes inside it are
//!   persisted once, when the window closes.
//! - **Inbound**: a change written by another engine is merged with the
//!   local snapshot (the causally newer side wins field conflicts) and the
//!   local store is regenerated from the result.
//! - **Late effects**: a superseded generation keeps its listener for the
//!   outdated timeout. If an asynchronous action completes against it, the
//!   part of its state that changed is merged onto the current snapshot.
//!
//! ## Usage
//!
//! ```ignore
//! let storage = WrappedStorage::new(namespace, AreaName::Local, "tandem");
//! let store = SyncedStore::new(Arc::new(ReducerFactory::new(todos)), storage, EngineOptions::default())?
//!     .init()
//!     .await;
//!
//! store.dispatch(json!({"type": "ADD_TODO", "text": "milk"}));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::observable::StateObservable;
use super::options::EngineOptions;
use super::outdated::OutdatedSubscriptions;
use crate::error::ConfigError;
use crate::listeners::{ListenerId, Registry, Subscription};
use crate::snapshot::{PersistedPayload, StateSnapshot, WriterId};
use crate::storage::WrappedStorage;
use crate::store::{Action, Reducer, StoreFactory, StoreHandle};
use crate::value::{diff_deep, is_equal, merge_or_replace};

/// Engine-level change listener
pub type ChangeListener = dyn Fn() + Send + Sync;

/// Called with the engine and its previous state whenever it persists a
/// change it made itself
pub type LocalChangeListener = dyn Fn(&SyncedStore, &Value) + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Running,
}

#[derive(Debug, Default)]
struct Buffer {
    /// Identity of the open window, if any
    open: Option<u64>,
    last: u64,
    /// Snapshot value before the first change inside the open window
    pending_base: Option<Value>,
}

struct EngineState {
    phase: Phase,
    value: Value,
    timestamp: i64,
    store: StoreHandle,
    generation: u64,
    active: Option<Subscription>,
    outdated: OutdatedSubscriptions,
    reducer: Option<Reducer>,
    buffer: Buffer,
    /// Newest remote snapshot seen while the initial load was in flight
    pending_remote: Option<StateSnapshot>,
}

struct EngineInner {
    writer_id: WriterId,
    factory: Arc<dyn StoreFactory>,
    storage: WrappedStorage,
    options: EngineOptions,
    reset_state: Option<Value>,
    local_listener: Option<Arc<LocalChangeListener>>,
    state: Mutex<EngineState>,
    listeners: Registry<ChangeListener>,
    storage_listener: Mutex<Option<ListenerId>>,
    initialized: OnceCell<()>,
}

/// Side effects collected under the state lock, run after releasing it
#[derive(Default)]
struct Effects {
    cancel: Vec<Subscription>,
    save: Option<Value>,
    local_change: Option<Value>,
    notify: bool,
}

impl Effects {
    fn apply(self, engine: &Arc<EngineInner>) {
        for subscription in self.cancel {
            subscription.unsubscribe();
        }
        if let Some(payload) = self.save {
            engine.storage.save(payload);
        }
        if let (Some(old_state), Some(listener)) = (self.local_change, &engine.local_listener) {
            listener(&engine.handle(), &old_state);
        }
        if self.notify {
            for listener in engine.listeners.snapshot() {
                listener();
            }
        }
    }
}

/// Store façade over a synchronization engine
#[derive(Clone)]
pub struct SyncedStore {
    inner: Arc<EngineInner>,
}

/// Non-owning handle to a [`SyncedStore`]
#[derive(Clone)]
pub struct WeakSyncedStore {
    inner: Weak<EngineInner>,
}

impl WeakSyncedStore {
    pub fn upgrade(&self) -> Option<SyncedStore> {
        self.inner.upgrade().map(|inner| SyncedStore { inner })
    }
}

/// Builder for [`SyncedStore`]
pub struct SyncedStoreBuilder {
    factory: Arc<dyn StoreFactory>,
    storage: WrappedStorage,
    options: EngineOptions,
    local_listener: Option<Arc<LocalChangeListener>>,
    reset_state: Option<Value>,
}

impl SyncedStoreBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Listener for changes this engine persists itself
    pub fn local_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SyncedStore, &Value) + Send + Sync + 'static,
    {
        self.local_listener = Some(Arc::new(listener));
        self
    }

    /// Partial state merged over the restored state by `init`
    pub fn reset_state(mut self, reset_state: Option<Value>) -> Self {
        self.reset_state = reset_state;
        self
    }

    /// Create the engine
    ///
    /// Calls the store factory once; a factory that cannot produce a store
    /// is a configuration error.
    pub fn build(self) -> Result<SyncedStore, ConfigError> {
        let store = self.factory.create_store(None)?;
        let value = store.get_state();
        let writer_id = Uuid::new_v4().to_string();
        debug!(writer = %writer_id, "Created engine");

        Ok(SyncedStore {
            inner: Arc::new(EngineInner {
                writer_id,
                factory: self.factory,
                storage: self.storage,
                options: self.options,
                reset_state: self.reset_state,
                local_listener: self.local_listener,
                state: Mutex::new(EngineState {
                    phase: Phase::Uninitialized,
                    value,
                    timestamp: 0,
                    store,
                    generation: 0,
                    active: None,
                    outdated: OutdatedSubscriptions::new(),
                    reducer: None,
                    buffer: Buffer::default(),
                    pending_remote: None,
                }),
                listeners: Registry::new(),
                storage_listener: Mutex::new(None),
                initialized: OnceCell::new(),
            }),
        })
    }
}

impl SyncedStore {
    pub fn builder(factory: Arc<dyn StoreFactory>, storage: WrappedStorage) -> SyncedStoreBuilder {
        SyncedStoreBuilder {
            factory,
            storage,
            options: EngineOptions::default(),
            local_listener: None,
            reset_state: None,
        }
    }

    pub fn new(
        factory: Arc<dyn StoreFactory>,
        storage: WrappedStorage,
        options: EngineOptions,
    ) -> Result<Self, ConfigError> {
        Self::builder(factory, storage).options(options).build()
    }

    /// Restore the persisted state and start reacting to remote changes
    ///
    /// The stored state is merged over the factory's default state, then
    /// the reset state (if any) over the result. If the outcome differs
    /// from what was stored it is written back. Runs once; later and
    /// concurrent calls wait for the first one.
    pub async fn init(&self) -> SyncedStore {
        let inner = Arc::clone(&self.inner);
        self.inner
            .initialized
            .get_or_init(|| inner.initialize())
            .await;
        self.clone()
    }

    /// Start from a state already in hand, without loading or subscribing
    pub fn init_from(&self, state: Value) -> SyncedStore {
        let mut effects = Effects::default();
        {
            let mut st = self.inner.lock();
            if st.phase == Phase::Running {
                warn!(writer = %self.inner.writer_id, "Engine already initialized");
            } else {
                st.value = state;
                st.phase = Phase::Running;
                self.inner.regenerate(&mut st, &mut effects);
            }
        }
        let _ = self.inner.initialized.set(());
        effects.apply(&self.inner);
        self.clone()
    }

    /// Current snapshot value
    pub fn get_state(&self) -> Value {
        self.inner.lock().value.clone()
    }

    /// Dispatch to the current store generation
    pub fn dispatch(&self, action: impl Into<Action>) -> Value {
        let store = {
            let mut st = self.inner.lock();
            if !self.inner.options.plain_actions
                && st.phase == Phase::Running
                && st.buffer.open.is_none()
            {
                self.inner.open_window(&mut st);
            }
            Arc::clone(&st.store)
        };
        store.dispatch(action.into())
    }

    /// Register a listener called after every change of the snapshot
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        let engine = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(engine) = engine.upgrade() {
                engine.listeners.remove(id);
            }
        })
    }

    /// Swap the reducer of the current store and of every later generation
    pub fn replace_reducer(&self, reducer: Reducer) -> SyncedStore {
        let store = {
            let mut st = self.inner.lock();
            st.reducer = Some(Arc::clone(&reducer));
            Arc::clone(&st.store)
        };
        store.replace_reducer(reducer);
        self.clone()
    }

    /// Observable view of the snapshot
    pub fn observable(&self) -> StateObservable {
        StateObservable::new(self.downgrade())
    }

    /// Close an open buffer window now and wait for queued writes
    pub async fn flush(&self) {
        self.inner.close_window(None);
        self.inner.storage.flush().await;
    }

    pub fn downgrade(&self) -> WeakSyncedStore {
        WeakSyncedStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn writer_id(&self) -> &str {
        &self.inner.writer_id
    }

    /// Current logical timestamp
    pub fn timestamp(&self) -> i64 {
        self.inner.lock().timestamp
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let st = self.inner.lock();
        StateSnapshot::new(st.value.clone(), self.inner.writer_id.clone(), st.timestamp)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn storage(&self) -> &WrappedStorage {
        &self.inner.storage
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().phase == Phase::Running
    }

    /// Number of superseded generations still watched
    pub fn outdated_len(&self) -> usize {
        self.inner.lock().outdated.len()
    }
}

impl fmt::Debug for SyncedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("SyncedStore")
            .field("writer_id", &self.inner.writer_id)
            .field("phase", &st.phase)
            .field("timestamp", &st.timestamp)
            .field("generation", &st.generation)
            .field("outdated", &st.outdated.len())
            .finish()
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }

    fn handle(self: &Arc<Self>) -> SyncedStore {
        SyncedStore {
            inner: Arc::clone(self),
        }
    }

    async fn initialize(self: Arc<Self>) {
        if !self.options.isolated {
            self.attach_storage_listener();
            self.storage.init();
        }

        let stored = self
            .storage
            .load()
            .await
            .filter(|raw| !raw.is_null())
            .map(|raw| PersistedPayload::decode(raw).into_snapshot());

        let mut effects = Effects::default();
        {
            let mut st = self.lock();
            if st.phase == Phase::Running {
                return;
            }

            let default_state = st.store.get_state();
            let mut value = match &stored {
                Some(snapshot) => merge_or_replace(&default_state, &snapshot.value),
                None => default_state,
            };
            if let Some(reset) = &self.reset_state {
                value = merge_or_replace(&value, reset);
            }

            st.value = value;
            if let Some(snapshot) = &stored {
                st.timestamp = st.timestamp.max(snapshot.timestamp);
            }
            st.phase = Phase::Running;
            self.regenerate(&mut st, &mut effects);

            let in_sync = stored
                .as_ref()
                .is_some_and(|snapshot| is_equal(&snapshot.value, &st.value));
            if !in_sync {
                Self::stamp(&mut st);
                effects.save = Some(self.pack(&st));
            }

            if let Some(remote) = st.pending_remote.take() {
                debug!(writer = %remote.writer_id, "Applying remote change received during load");
                self.reconcile(&mut st, remote, &mut effects);
                if effects.save.is_some() {
                    effects.save = Some(self.pack(&st));
                }
            }
            info!(
                writer = %self.writer_id,
                restored = stored.is_some(),
                timestamp = st.timestamp,
                "Engine initialized"
            );
        }
        effects.apply(&self);
    }

    fn attach_storage_listener(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let id = self.storage.subscribe(move |new_value, _old_value| {
            if let Some(engine) = engine.upgrade() {
                engine.on_remote_change(new_value);
            }
        });
        *lock(&self.storage_listener) = Some(id);
    }

    /// Advance the logical clock for a local write
    fn stamp(st: &mut EngineState) {
        st.timestamp = Utc::now()
            .timestamp_millis()
            .max(st.timestamp.saturating_add(1));
    }

    fn pack(&self, st: &EngineState) -> Value {
        StateSnapshot::new(st.value.clone(), self.writer_id.clone(), st.timestamp).pack()
    }

    fn persist_now(&self, st: &mut EngineState, old_state: Value, effects: &mut Effects) {
        Self::stamp(st);
        effects.save = Some(self.pack(st));
        effects.local_change = Some(old_state);
    }

    fn persist_or_defer(&self, st: &mut EngineState, old_state: Value, effects: &mut Effects) {
        if st.buffer.open.is_some() {
            st.buffer.pending_base.get_or_insert(old_state);
        } else {
            self.persist_now(st, old_state, effects);
        }
    }

    /// Replace the current store with a fresh one built from the snapshot
    fn regenerate(self: &Arc<Self>, st: &mut EngineState, effects: &mut Effects) {
        let store = match self.factory.create_store(Some(st.value.clone())) {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to regenerate store, keeping the current generation");
                return;
            }
        };
        if let Some(reducer) = &st.reducer {
            store.replace_reducer(Arc::clone(reducer));
        }

        let now = Instant::now();
        let retired = st.generation;
        st.generation += 1;
        let subscription = self.watch_generation(&store, st.generation, st.value.clone());
        if let Some(previous) = st.active.replace(subscription) {
            if self.options.plain_actions {
                effects.cancel.push(previous);
            } else {
                st.outdated.retire(now, retired, previous);
            }
        }
        st.store = store;

        let expired = st.outdated.sweep(now, self.options.outdated_timeout);
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired outdated subscriptions");
        }
        effects.cancel.extend(expired);
        debug!(
            generation = st.generation,
            outdated = st.outdated.len(),
            "Regenerated store"
        );
    }

    fn watch_generation(
        self: &Arc<Self>,
        store: &StoreHandle,
        generation: u64,
        baseline: Value,
    ) -> Subscription {
        let engine = Arc::downgrade(self);
        let watched = Arc::downgrade(store);
        let baseline = Mutex::new(baseline);
        store.subscribe(Arc::new(move || {
            let (Some(engine), Some(store)) = (engine.upgrade(), watched.upgrade()) else {
                return;
            };
            engine.on_generation_change(generation, &store, &baseline);
        }))
    }

    fn on_generation_change(
        self: &Arc<Self>,
        generation: u64,
        store: &StoreHandle,
        baseline: &Mutex<Value>,
    ) {
        let current = store.get_state();
        let mut effects = Effects::default();
        {
            let mut st = self.lock();
            self.absorb(&mut st, generation, current, baseline, &mut effects);
        }
        effects.apply(self);
    }

    /// Fold a store change into the snapshot
    fn absorb(
        self: &Arc<Self>,
        st: &mut EngineState,
        generation: u64,
        current: Value,
        baseline: &Mutex<Value>,
        effects: &mut Effects,
    ) {
        let expired = st.outdated.sweep(Instant::now(), self.options.outdated_timeout);
        effects.cancel.extend(expired);

        if st.phase != Phase::Running || is_equal(&current, &st.value) {
            return;
        }

        if generation == st.generation {
            *lock(baseline) = current.clone();
            let old_state = std::mem::replace(&mut st.value, current);
            self.persist_or_defer(st, old_state, effects);
            effects.notify = true;
            return;
        }

        if !st.outdated.contains(generation) {
            debug!(generation, "Dropped change from an expired generation");
            return;
        }

        let diff = {
            let mut base = lock(baseline);
            let diff = diff_deep(&current, &base);
            *base = current;
            diff
        };
        let Some(diff) = diff else {
            return;
        };

        info!(
            generation,
            current = st.generation,
            "Carrying late change over from a superseded generation"
        );
        let merged = merge_or_replace(&st.value, &diff);
        let old_state = std::mem::replace(&mut st.value, merged);
        self.regenerate(st, effects);
        self.persist_or_defer(st, old_state, effects);
        effects.notify = true;
    }

    fn on_remote_change(self: &Arc<Self>, raw: &Value) {
        let remote = PersistedPayload::decode(raw.clone()).into_snapshot();
        let mut effects = Effects::default();
        {
            let mut st = self.lock();
            self.reconcile(&mut st, remote, &mut effects);
        }
        effects.apply(self);
    }

    /// Merge a snapshot written by another engine
    ///
    /// Before the engine runs, the snapshot is held for `initialize`. Change
    /// listeners are notified only when the merge changes the local
    /// snapshot; an older remote whose fields are all already known
    /// notifies nobody.
    fn reconcile(self: &Arc<Self>, st: &mut EngineState, remote: StateSnapshot, effects: &mut Effects) {
        if st.phase != Phase::Running {
            debug!("Holding remote change until initialization completes");
            st.pending_remote = Some(remote);
            return;
        }
        if remote.writer_id == self.writer_id || is_equal(&remote.value, &st.value) {
            return;
        }

        let remote_is_newer = remote.timestamp >= st.timestamp;
        let merged = if remote_is_newer {
            merge_or_replace(&st.value, &remote.value)
        } else {
            merge_or_replace(&remote.value, &st.value)
        };
        st.timestamp = st.timestamp.max(remote.timestamp);
        debug!(
            writer = %remote.writer_id,
            remote_timestamp = remote.timestamp,
            remote_is_newer,
            "Reconciling remote change"
        );

        if !is_equal(&merged, &st.value) {
            st.value = merged;
            self.regenerate(st, effects);
            effects.notify = true;
        }

        // Local fields the newer remote lacked: push so other writers converge
        if remote_is_newer && !is_equal(&st.value, &remote.value) {
            Self::stamp(st);
            effects.save = Some(self.pack(st));
        }
    }

    fn open_window(self: &Arc<Self>, st: &mut EngineState) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        st.buffer.last += 1;
        let window = st.buffer.last;
        st.buffer.open = Some(window);

        let engine = Arc::downgrade(self);
        let life = self.options.buffer_life;
        runtime.spawn(async move {
            tokio::time::sleep(life).await;
            if let Some(engine) = engine.upgrade() {
                engine.close_window(Some(window));
            }
        });
    }

    /// Close the given window (or whichever is open) and persist its changes
    fn close_window(self: &Arc<Self>, window: Option<u64>) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock();
            let Some(open) = st.buffer.open else {
                return;
            };
            if window.is_some_and(|w| w != open) {
                return;
            }
            st.buffer.open = None;
            if let Some(base) = st.buffer.pending_base.take() {
                if !is_equal(&base, &st.value) {
                    debug!(window = open, "Buffer window closed, persisting");
                    self.persist_now(&mut st, base, &mut effects);
                }
            }
        }
        effects.apply(self);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(id) = lock(&self.storage_listener).take() {
            self.storage.unsubscribe(id);
        }
    }
}
