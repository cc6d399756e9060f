//! Command handlers

pub mod config;
pub mod set;
pub mod show;

use std::path::Path;

use anyhow::{Context, Result};

use tandem_core::{Config, FileStorage};

/// Load configuration from `config_path` (plus environment overrides)
fn load_config(config_path: &Path) -> Result<Config> {
    Config::load_from_path(config_path).context("Failed to load configuration")
}

/// File-backed medium described by the configuration
fn open_storage(config: &Config) -> FileStorage {
    FileStorage::with_quota(&config.data_dir, config.quota())
}
