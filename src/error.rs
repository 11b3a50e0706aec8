//! Error types for the fleet gateway

use thiserror::Error;

/// Result type alias for fleet gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fleet gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared store rejected or failed an operation
    #[error("store error: {0}")]
    Store(String),

    /// Shared store is not reachable from this process
    #[error("store unavailable")]
    StoreUnavailable,

    /// Malformed store path or path segment
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Device identifier that cannot be used as a store key
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Command type outside the known vocabulary
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
