//! Set command handler

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use tandem_core::value::merge_or_replace;
use tandem_core::{reducer, Reducer, ReducerFactory, Setup};

use super::{load_config, open_storage};
use crate::output::Output;

const MERGE: &str = "MERGE";

/// State is a JSON object; `MERGE` deep-merges the action's `patch` into it
fn merge_reducer() -> Reducer {
    reducer(|state, action| {
        let current = state.cloned().unwrap_or_else(|| json!({}));
        if action["type"] == MERGE {
            merge_or_replace(&current, &action["patch"])
        } else {
            current
        }
    })
}

/// Parse the patch argument; only JSON objects are accepted
fn parse_patch(patch: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(patch).context("Patch is not valid JSON")?;
    if !value.is_object() {
        bail!("Patch must be a JSON object, e.g. '{{\"theme\": \"dark\"}}'");
    }
    Ok(value)
}

/// Merge a patch into the shared state through an engine and wait for the write
pub async fn set(config_path: &Path, patch: &str, output: &Output) -> Result<()> {
    let patch = parse_patch(patch)?;
    let config = load_config(config_path)?;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let instantiator = Setup::new()
        .store_factory(ReducerFactory::new(merge_reducer()))
        .namespace(Arc::new(open_storage(&config)))
        .config(&config)
        .on_error(move |message, quota_exceeded| {
            if let Ok(mut errors) = sink.lock() {
                errors.push((message.to_string(), quota_exceeded));
            }
        })
        .build()?;

    let store = instantiator.instantiate(None).await?;
    store.dispatch(json!({"type": MERGE, "patch": patch}));
    store.flush().await;
    debug!(writer = store.writer_id(), timestamp = store.timestamp(), "Patch merged");

    let errors = errors.lock().map(|e| e.clone()).unwrap_or_default();
    if let Some((message, quota_exceeded)) = errors.first() {
        if *quota_exceeded {
            bail!("State not saved, storage quota exceeded: {}", message);
        }
        bail!("State not saved: {}", message);
    }

    output.print_state(&store.get_state());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_reducer() {
        let merge = merge_reducer();
        let state = merge(None, &json!({"type": "@@INIT"}));
        assert_eq!(state, json!({}));

        let state = merge(Some(&json!({"a": {"b": 1}})), &json!({"type": MERGE, "patch": {"a": {"c": 2}}}));
        assert_eq!(state, json!({"a": {"b": 1, "c": 2}}));
    }

    #[test]
    fn test_parse_patch() {
        assert!(parse_patch(r#"{"theme": "dark"}"#).is_ok());
        assert!(parse_patch("[1, 2]").is_err());
        assert!(parse_patch("not json").is_err());
    }
}
