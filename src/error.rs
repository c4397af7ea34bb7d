//! Error types for reconq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// An event whose payload does not match the stream it arrived on.
    #[error("malformed {kind} event: {reason}")]
    MalformedEvent { kind: String, reason: String },

    #[error("error setting up event handler: {0}")]
    Subscribe(String),

    #[error("timed out waiting for caches to sync")]
    CacheSync,

    #[error("lister error: {0}")]
    Lister(String),

    #[error("reconcile failed: {0:#}")]
    Reconcile(anyhow::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("reconcile panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
