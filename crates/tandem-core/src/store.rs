//! Reactive store contract
//!
//! The engine treats the reducer store as a black box satisfying the
//! classic contract: `get_state`, `dispatch`, `subscribe` and
//! `replace_reducer`, created by a factory from an optional preloaded
//! state.
//!
//! ## Usage
//!
//! ```ignore
//! let factory = ReducerFactory::new(reducer(|state, action| { /* ... */ }));
//! let store = factory.create_store(None)?;
//!
//! store.dispatch(Action::plain(json!({"type": "ADD_TODO", "text": "milk"})));
//! ```
//!
//! [`BasicStore`] is the reference implementation. Thunk actions receive a
//! handle to the store they were dispatched on, so an asynchronous effect
//! always lands on the same store generation even if the engine has
//! replaced it in the meantime.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Map, Value};

use crate::error::ConfigError;
use crate::listeners::{Registry, Subscription};

/// Action type dispatched when a store is created
pub const INIT_ACTION: &str = "@@tandem/INIT";
/// Action type dispatched when a store's reducer is replaced
pub const REPLACE_ACTION: &str = "@@tandem/REPLACE";

/// Pure state transition: `(previous state or absent, action) -> next state`
pub type Reducer = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// Store change listener
pub type StoreListener = dyn Fn() + Send + Sync;

/// Shared handle to a store
pub type StoreHandle = Arc<dyn ReactiveStore>;

/// Wrap a closure as a [`Reducer`]
pub fn reducer<F>(f: F) -> Reducer
where
    F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Something that can be dispatched
pub enum Action {
    /// A plain action object handed to the reducer
    Plain(Value),
    /// A function run against the store (asynchronous or multi-step actions)
    Thunk(Box<dyn FnOnce(StoreHandle) -> Value + Send>),
}

impl Action {
    pub fn plain(action: Value) -> Self {
        Action::Plain(action)
    }

    pub fn thunk<F>(f: F) -> Self
    where
        F: FnOnce(StoreHandle) -> Value + Send + 'static,
    {
        Action::Thunk(Box::new(f))
    }
}

impl From<Value> for Action {
    fn from(action: Value) -> Self {
        Action::Plain(action)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Plain(action) => f.debug_tuple("Plain").field(action).finish(),
            Action::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

/// The reducer-store contract
pub trait ReactiveStore: Send + Sync {
    /// Current state
    fn get_state(&self) -> Value;

    /// Apply an action; returns the action (plain) or the thunk's result
    fn dispatch(&self, action: Action) -> Value;

    /// Register a listener called after every dispatch
    fn subscribe(&self, listener: Arc<StoreListener>) -> Subscription;

    /// Swap the reducer
    fn replace_reducer(&self, reducer: Reducer);
}

/// Creates stores from an optional preloaded state
pub trait StoreFactory: Send + Sync {
    fn create_store(&self, preloaded: Option<Value>) -> Result<StoreHandle, ConfigError>;
}

impl<F> StoreFactory for F
where
    F: Fn(Option<Value>) -> Result<StoreHandle, ConfigError> + Send + Sync,
{
    fn create_store(&self, preloaded: Option<Value>) -> Result<StoreHandle, ConfigError> {
        self(preloaded)
    }
}

/// Factory producing [`BasicStore`]s for one reducer
#[derive(Clone)]
pub struct ReducerFactory {
    reducer: Reducer,
}

impl ReducerFactory {
    pub fn new(reducer: Reducer) -> Self {
        Self { reducer }
    }
}

impl StoreFactory for ReducerFactory {
    fn create_store(&self, preloaded: Option<Value>) -> Result<StoreHandle, ConfigError> {
        Ok(BasicStore::create(Arc::clone(&self.reducer), preloaded))
    }
}

/// Reference reducer store
pub struct BasicStore {
    this: Weak<BasicStore>,
    inner: Mutex<StoreInner>,
    listeners: Arc<Registry<StoreListener>>,
}

struct StoreInner {
    state: Value,
    reducer: Reducer,
}

impl BasicStore {
    /// Create a store, running the reducer once with the init action
    pub fn create(reducer: Reducer, preloaded: Option<Value>) -> Arc<Self> {
        let state = reducer(preloaded.as_ref(), &json!({ "type": INIT_ACTION }));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            inner: Mutex::new(StoreInner { state, reducer }),
            listeners: Arc::new(Registry::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reduce(&self, action: &Value) {
        {
            let mut inner = self.lock();
            let next = (inner.reducer)(Some(&inner.state), action);
            inner.state = next;
        }
        for listener in self.listeners.snapshot() {
            listener();
        }
    }
}

impl ReactiveStore for BasicStore {
    fn get_state(&self) -> Value {
        self.lock().state.clone()
    }

    fn dispatch(&self, action: Action) -> Value {
        match action {
            Action::Plain(action) => {
                self.reduce(&action);
                action
            }
            Action::Thunk(thunk) => match self.this.upgrade() {
                Some(this) => thunk(this),
                None => Value::Null,
            },
        }
    }

    fn subscribe(&self, listener: Arc<StoreListener>) -> Subscription {
        let id = self.listeners.add(listener);
        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.remove(id);
            }
        })
    }

    fn replace_reducer(&self, reducer: Reducer) {
        self.lock().reducer = reducer;
        self.reduce(&json!({ "type": REPLACE_ACTION }));
    }
}

impl fmt::Debug for BasicStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicStore")
            .field("state", &self.lock().state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Combine slice reducers into one reducer over a map state
///
/// Each slice reducer sees only its own key of the previous state; keys
/// without a slice reducer are dropped.
pub fn combine_reducers<K>(slices: Vec<(K, Reducer)>) -> Reducer
where
    K: Into<String>,
{
    let slices: Vec<(String, Reducer)> = slices
        .into_iter()
        .map(|(key, reducer)| (key.into(), reducer))
        .collect();
    reducer(move |state, action| {
        let mut next = Map::new();
        for (key, slice) in &slices {
            let previous = state.and_then(|s| s.get(key));
            next.insert(key.clone(), slice(previous, action));
        }
        Value::Object(next)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter() -> Reducer {
        reducer(|state, action| {
            let count = state.and_then(Value::as_i64).unwrap_or(0);
            match action["type"].as_str() {
                Some("INCREMENT") => json!(count + 1),
                _ => json!(count),
            }
        })
    }

    fn increment() -> Action {
        Action::plain(json!({"type": "INCREMENT"}))
    }

    #[test]
    fn test_initial_state_from_reducer() {
        let store = BasicStore::create(counter(), None);
        assert_eq!(store.get_state(), json!(0));
    }

    #[test]
    fn test_preloaded_state() {
        let store = BasicStore::create(counter(), Some(json!(41)));
        store.dispatch(increment());
        assert_eq!(store.get_state(), json!(42));
    }

    #[test]
    fn test_dispatch_returns_action() {
        let store = BasicStore::create(counter(), None);
        let returned = store.dispatch(increment());
        assert_eq!(returned, json!({"type": "INCREMENT"}));
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let store = BasicStore::create(counter(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let subscription = store.subscribe(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        store.dispatch(increment());
        store.dispatch(increment());
        subscription.unsubscribe();
        store.dispatch(increment());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_state(), json!(3));
    }

    #[test]
    fn test_listener_can_read_state() {
        let store = BasicStore::create(counter(), None);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let reader = Arc::downgrade(&store);
        let _subscription = store.subscribe(Arc::new(move || {
            if let Some(store) = reader.upgrade() {
                sink.lock().unwrap().push(store.get_state());
            }
        }));

        store.dispatch(increment());
        assert_eq!(*observed.lock().unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_replace_reducer() {
        let store = BasicStore::create(counter(), Some(json!(5)));
        store.replace_reducer(reducer(|state, action| match action["type"].as_str() {
            Some("INCREMENT") => json!(state.and_then(Value::as_i64).unwrap_or(0) + 10),
            _ => state.cloned().unwrap_or(json!(0)),
        }));
        store.dispatch(increment());
        assert_eq!(store.get_state(), json!(15));
    }

    #[test]
    fn test_thunk_receives_store() {
        let store = BasicStore::create(counter(), None);
        let result = store.dispatch(Action::thunk(|store| {
            store.dispatch(increment());
            store.dispatch(increment());
            json!("done")
        }));
        assert_eq!(result, json!("done"));
        assert_eq!(store.get_state(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_thunk() {
        let store = BasicStore::create(counter(), None);
        store.dispatch(Action::thunk(|store| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                store.dispatch(increment());
            });
            Value::Null
        }));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(store.get_state(), json!(0));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(store.get_state(), json!(1));
    }

    #[test]
    fn test_combine_reducers() {
        let filter = reducer(|state, action| match action["type"].as_str() {
            Some("SET_FILTER") => action["filter"].clone(),
            _ => state.cloned().unwrap_or(json!("SHOW_ALL")),
        });
        let combined = combine_reducers(vec![("count", counter()), ("filter", filter)]);
        let store = BasicStore::create(combined, Some(json!({"count": 3, "stale": true})));

        assert_eq!(store.get_state(), json!({"count": 3, "filter": "SHOW_ALL"}));
        store.dispatch(Action::plain(json!({"type": "SET_FILTER", "filter": "SHOW_ACTIVE"})));
        store.dispatch(increment());
        assert_eq!(store.get_state(), json!({"count": 4, "filter": "SHOW_ACTIVE"}));
    }

    #[test]
    fn test_factory_closure() {
        let factory = |preloaded: Option<Value>| -> Result<StoreHandle, ConfigError> {
            Ok(BasicStore::create(counter(), preloaded))
        };
        let store = factory.create_store(Some(json!(7))).unwrap();
        assert_eq!(store.get_state(), json!(7));
    }
}
