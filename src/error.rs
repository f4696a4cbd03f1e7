//! Crate-wide error types.

use thiserror::Error;

/// Errors surfaced by the training pipeline
///
/// Configuration and checkpoint errors are fatal by design: a run never
/// retries them. Degenerate statistics (zero denominators in perplexity or
/// the latent diagnostics) get their own variant so callers see what broke
/// instead of a raw division artifact.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model contract violation: {0}")]
    Model(String),

    #[error("degenerate statistic: {0}")]
    Degenerate(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, Error>;
