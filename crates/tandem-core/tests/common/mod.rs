//! Shared helpers for engine scenarios

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tandem_core::storage::{AreaName, MemoryStorage, StorageNamespace};
use tandem_core::store::combine_reducers;
use tandem_core::{
    reducer, Action, EngineOptions, Reducer, ReducerFactory, SyncedStore, WrappedStorage,
};

pub const KEY: &str = "tandem";

/// Map state: `INCREMENT` bumps `count`, `SET` assigns `key` to `value`
pub fn fields() -> Reducer {
    reducer(|state, action| {
        let mut next = state.cloned().unwrap_or_else(|| json!({"count": 0}));
        match action["type"].as_str() {
            Some("INCREMENT") => {
                let count = next["count"].as_i64().unwrap_or(0);
                next["count"] = json!(count + 1);
            }
            Some("SET") => {
                if let Some(key) = action["key"].as_str() {
                    next[key] = action["value"].clone();
                }
            }
            _ => {}
        }
        next
    })
}

/// Todo list with a visibility filter
pub fn todos() -> Reducer {
    let list = reducer(|state, action| {
        let mut items = state
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if action["type"] == "ADD_TODO" {
            items.push(json!({"id": action["id"], "text": action["text"], "completed": false}));
        }
        Value::Array(items)
    });
    let filter = reducer(|state, action| match action["type"].as_str() {
        Some("SET_VISIBILITY_FILTER") => action["filter"].clone(),
        _ => state.cloned().unwrap_or_else(|| json!("SHOW_ALL")),
    });
    combine_reducers(vec![("todos", list), ("visibilityFilter", filter)])
}

pub fn increment() -> Value {
    json!({"type": "INCREMENT"})
}

pub fn set(key: &str, value: Value) -> Value {
    json!({"type": "SET", "key": key, "value": value})
}

pub fn add_todo(id: u64, text: &str) -> Value {
    json!({"type": "ADD_TODO", "id": id, "text": text})
}

/// Action that dispatches `action` on the same store generation after `delay`
pub fn delayed(action: Value, delay: Duration) -> Action {
    Action::thunk(move |store| {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.dispatch(Action::plain(action));
        });
        Value::Null
    })
}

pub fn engine_with(
    namespace: Arc<dyn StorageNamespace>,
    reducer: Reducer,
    options: EngineOptions,
) -> SyncedStore {
    let storage = WrappedStorage::new(namespace, AreaName::Local, KEY);
    SyncedStore::new(Arc::new(ReducerFactory::new(reducer)), storage, options)
        .expect("engine")
}

pub fn engine(memory: &Arc<MemoryStorage>, options: EngineOptions) -> SyncedStore {
    engine_with(memory.clone(), fields(), options)
}

pub fn writes(memory: &Arc<MemoryStorage>) -> usize {
    memory.memory_area(AreaName::Local).write_count()
}

/// Let queued writes and change notifications run without advancing time
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Flush every engine, then deliver notifications, a few rounds
pub async fn converge(stores: &[&SyncedStore]) {
    for _ in 0..3 {
        for store in stores {
            store.flush().await;
        }
        settle().await;
    }
}

/// Counts engine-level notifications
pub fn count_notifications(store: &SyncedStore) -> Arc<Mutex<usize>> {
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let _subscription = store.subscribe(move || *counter.lock().unwrap() += 1);
    calls
}
