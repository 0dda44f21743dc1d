//! Error types for the retrieval engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Lexical or vector projection diverged from the chunk rows. Repaired
    /// by a backfill pass on open rather than failing queries.
    #[error("chunk projections out of sync: {0}")]
    OutOfSync(String),

    #[error("stored embedding blob has invalid length {0}")]
    BadEmbedding(usize),
}

/// Errors from the embedding client adapter.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The backend stayed unreachable or rate-limited through every retry.
    #[error("embedding backend unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    /// The backend returned fewer vectors than texts and data would be lost.
    #[error("embedding count mismatch: {expected} texts, {got} vectors")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
