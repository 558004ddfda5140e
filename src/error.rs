//! Error types for studio-relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
