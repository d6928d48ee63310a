//! Error types for scrape-pool.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Mint error: {0}")]
    Mint(#[from] MintError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Session-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Session has no id; persist it with create() first")]
    Unpersisted,
}

/// Job-queue transport errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection failed: {0}")]
    Connection(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Session-minting boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    #[error("Minter failed to launch: {0}")]
    Launch(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Mint timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-item execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("No valid session available")]
    NoSession,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Target blocked the request (status {status})")]
    Blocked { status: u16 },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Item execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
