//! Config command handlers

use std::path::Path;

use anyhow::{Context, Result};

use tandem_core::config::CONFIG_KEYS;
use tandem_core::Config;

use super::load_config;
use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: &Path, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "storage_area": config.storage_area,
                    "storage_key": config.storage_key,
                    "isolated": config.isolated,
                    "plain_actions": config.plain_actions,
                    "outdated_timeout_ms": config.effective_outdated_timeout_ms(),
                    "buffer_life_ms": config.effective_buffer_life_ms(),
                    "data_dir": config.data_dir,
                    "quota_bytes": config.quota_bytes,
                    "quota_bytes_per_item": config.quota_bytes_per_item
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  storage_area:         {}", config.storage_area);
            println!("  storage_key:          {}", config.storage_key);
            println!("  isolated:             {}", config.isolated);
            println!("  plain_actions:        {}", config.plain_actions);
            println!(
                "  outdated_timeout_ms:  {}",
                config.effective_outdated_timeout_ms()
            );
            println!("  buffer_life_ms:       {}", config.effective_buffer_life_ms());
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  quota_bytes:          {}",
                format_limit(config.quota_bytes)
            );
            println!(
                "  quota_bytes_per_item: {}",
                format_limit(config.quota_bytes_per_item)
            );
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(config_path: &Path, key: String, value: String, output: &Output) -> Result<()> {
    let mut config = load_config(config_path)?;

    config.set_value(&key, &value).with_context(|| {
        format!("Valid keys: {}", CONFIG_KEYS.join(", "))
    })?;

    config
        .save_to(config_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn format_limit(limit: Option<u64>) -> String {
    limit
        .map(|bytes| bytes.to_string())
        .unwrap_or_else(|| "(unlimited)".to_string())
}
