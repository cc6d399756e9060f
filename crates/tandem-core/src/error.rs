//! Configuration errors
//!
//! Raised synchronously while wiring stores, engines and storage together.
//! Storage failures at runtime are never errors of this kind; they are
//! reported through error listeners (see `storage::BackendError`).

use thiserror::Error;

/// Fatal setup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No store factory was supplied
    #[error("Missing argument for 'store factory': a factory creating reducer stores is required")]
    MissingStoreFactory,

    /// No storage medium was supplied
    #[error("Missing argument for 'storage': a storage namespace is required")]
    MissingStorage,

    /// The store factory did not produce a usable store
    #[error("Invalid store factory supplied: {0}")]
    InvalidStore(String),
}
