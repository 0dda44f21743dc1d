//! Hybrid retrieval engine for a personal knowledge assistant.
//!
//! Indexes a tree of markdown documents into a per-collection SQLite store
//! (chunks, embeddings, and an FTS5 lexical projection) and answers
//! relevance queries over it: keyword (BM25), vector (exact KNN), or both
//! merged with reciprocal rank fusion.

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod models;
pub mod search;
pub mod store;

pub use config::EngineConfig;
pub use embedding::{Embedder, OllamaEmbedder};
pub use error::{Error, Result};
pub use indexer::{Indexer, SyncOptions};
pub use models::{SearchMode, SearchResult, StoreStats, SyncStats};
pub use search::SearchEngine;
pub use store::Store;
