//! Show command handler

use std::path::Path;

use anyhow::{Context, Result};

use tandem_core::storage::{StorageArea, StorageNamespace};
use tandem_core::PersistedPayload;

use super::{load_config, open_storage};
use crate::output::Output;

/// Print the persisted slot without starting an engine
pub async fn show(config_path: &Path, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;
    let storage = open_storage(&config);

    let raw = storage
        .area(config.storage_area)
        .get(&config.storage_key)
        .await
        .with_context(|| format!("Failed to read {}", storage.area_path(config.storage_area).display()))?;
    let payload = raw.map(PersistedPayload::decode);

    output.print_slot(config.storage_area, &config.storage_key, payload.as_ref());
    Ok(())
}
