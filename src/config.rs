//! Configuration for the indexing and search engine.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Name of the corpus this store holds (e.g. "memory", "notes").
    pub collection: String,
    /// Path of the store database. Defaults to
    /// `<data dir>/recall/<collection>.db`.
    pub store_path: Option<PathBuf>,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collection: "memory".to_string(),
            store_path: None,
            chunking: ChunkingConfig::default(),
            indexing: IndexingConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve the store database path, falling back to the platform data dir.
    pub fn resolved_store_path(&self) -> PathBuf {
        if let Some(path) = &self.store_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recall")
            .join(format!("{}.db", self.collection))
    }
}

/// Chunker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Target chunk size in estimated tokens.
    pub target_tokens: usize,
    /// Fraction of a chunk repeated at the start of the next one.
    pub overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 800,
            overlap_fraction: 0.1,
        }
    }
}

/// File discovery and sync tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexingConfig {
    /// Directory names skipped during the walk. Hidden directories
    /// (dot-prefixed) are always skipped.
    pub exclude_dirs: Vec<String>,
    /// File extensions considered indexable.
    pub extensions: Vec<String>,
    /// Maximum files chunked and embedded concurrently.
    pub embed_concurrency: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: vec![
                "node_modules".to_string(),
                "target".to_string(),
                "__pycache__".to_string(),
            ],
            extensions: vec!["md".to_string(), "markdown".to_string()],
            embed_concurrency: 4,
        }
    }
}

/// Embedding backend connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Base URL of an Ollama-compatible embedding endpoint.
    pub base_url: String,
    /// Model identifier passed to the backend and recorded on every chunk.
    pub model: String,
    /// Attempts before a transient failure becomes `EmbeddingUnavailable`.
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3-embedding:0.6b".to_string(),
            max_retries: 3,
            timeout_secs: 60,
        }
    }
}
