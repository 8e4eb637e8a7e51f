//! Error types for tinyrelay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("{0}")]
    Other(String),
}
