//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tandem/config.toml)
//! 3. Environment variables (TANDEM_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::{AreaName, AreaQuota};
use crate::sync::{
    clamp_buffer_life, clamp_outdated_timeout, EngineOptions, DEFAULT_BUFFER_LIFE_MS,
    DEFAULT_OUTDATED_TIMEOUT_MS,
};

/// Environment variable prefix
const ENV_PREFIX: &str = "TANDEM";

/// Default key of the shared slot
pub const DEFAULT_STORAGE_KEY: &str = "tandem";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage area holding the shared slot
    #[serde(default, deserialize_with = "lenient_area")]
    pub storage_area: AreaName,

    /// Key of the shared slot
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Ignore changes written by other engines
    #[serde(default)]
    pub isolated: bool,

    /// Persist every change immediately instead of buffering bursts
    #[serde(default)]
    pub plain_actions: bool,

    /// Grace period for superseded store generations (0 selects the default, at least 500)
    #[serde(default = "default_outdated_timeout_ms")]
    pub outdated_timeout_ms: u64,

    /// Buffer window length (0 selects the default, at most 2000)
    #[serde(default = "default_buffer_life_ms")]
    pub buffer_life_ms: u64,

    /// Directory of the file-backed storage medium
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Aggregate quota of the file-backed medium
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Per-item quota of the file-backed medium
    #[serde(default)]
    pub quota_bytes_per_item: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_area: AreaName::default(),
            storage_key: default_storage_key(),
            isolated: false,
            plain_actions: false,
            outdated_timeout_ms: DEFAULT_OUTDATED_TIMEOUT_MS,
            buffer_life_ms: DEFAULT_BUFFER_LIFE_MS,
            data_dir: default_data_dir(),
            quota_bytes: None,
            quota_bytes_per_item: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TANDEM_STORAGE_AREA, TANDEM_DATA_DIR, ...)
    /// 2. Config file (~/.config/tandem/config.toml or TANDEM_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("STORAGE_AREA") {
            self.storage_area = AreaName::parse_lenient(&val);
        }

        if let Some(val) = env_var("STORAGE_KEY") {
            if !val.is_empty() {
                self.storage_key = val;
            }
        }

        if let Some(val) = env_var("ISOLATED") {
            self.isolated = parse_flag(&val);
        }

        if let Some(val) = env_var("PLAIN_ACTIONS") {
            self.plain_actions = parse_flag(&val);
        }

        if let Some(ms) = env_var("OUTDATED_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.outdated_timeout_ms = ms;
        }

        if let Some(ms) = env_var("BUFFER_LIFE_MS").and_then(|v| v.parse().ok()) {
            self.buffer_life_ms = ms;
        }

        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
    }

    /// Engine options with durations clamped to their accepted ranges
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::default()
            .isolated(self.isolated)
            .plain_actions(self.plain_actions)
            .outdated_timeout_ms(self.outdated_timeout_ms)
            .buffer_life_ms(self.buffer_life_ms)
    }

    /// Quota of the file-backed medium
    pub fn quota(&self) -> AreaQuota {
        AreaQuota {
            quota_bytes: self.quota_bytes,
            quota_bytes_per_item: self.quota_bytes_per_item,
        }
    }

    /// Effective outdated timeout in milliseconds
    pub fn effective_outdated_timeout_ms(&self) -> u64 {
        clamp_outdated_timeout(self.outdated_timeout_ms)
    }

    /// Effective buffer window in milliseconds
    pub fn effective_buffer_life_ms(&self) -> u64 {
        clamp_buffer_life(self.buffer_life_ms)
    }

    /// Set a field from its string form
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "storage_area" => self.storage_area = AreaName::parse_lenient(value),
            "storage_key" => {
                if value.is_empty() {
                    bail!("storage_key cannot be empty");
                }
                self.storage_key = value.to_string();
            }
            "isolated" => self.isolated = parse_bool(key, value)?,
            "plain_actions" => self.plain_actions = parse_bool(key, value)?,
            "outdated_timeout_ms" => self.outdated_timeout_ms = parse_u64(key, value)?,
            "buffer_life_ms" => self.buffer_life_ms = parse_u64(key, value)?,
            "data_dir" => self.data_dir = PathBuf::from(value),
            "quota_bytes" => self.quota_bytes = parse_optional_u64(key, value)?,
            "quota_bytes_per_item" => self.quota_bytes_per_item = parse_optional_u64(key, value)?,
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TANDEM_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tandem")
            .join("config.toml")
    }
}

/// Config keys accepted by [`Config::set_value`]
pub const CONFIG_KEYS: &[&str] = &[
    "storage_area",
    "storage_key",
    "isolated",
    "plain_actions",
    "outdated_timeout_ms",
    "buffer_life_ms",
    "data_dir",
    "quota_bytes",
    "quota_bytes_per_item",
];

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => bail!("Invalid value for {}: expected true or false, got '{}'", key, value),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: expected a number, got '{}'", key, value))
}

fn parse_optional_u64(key: &str, value: &str) -> Result<Option<u64>> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_u64(key, value).map(Some)
}

fn lenient_area<'de, D>(deserializer: D) -> std::result::Result<AreaName, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    Ok(AreaName::parse_lenient(&name))
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_outdated_timeout_ms() -> u64 {
    DEFAULT_OUTDATED_TIMEOUT_MS
}

fn default_buffer_life_ms() -> u64 {
    DEFAULT_BUFFER_LIFE_MS
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
}
