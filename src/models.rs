//! Shared data-model types for files, chunks, and search results.

use serde::{Deserialize, Serialize};

/// Which index(es) serve a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Lexical (BM25) ranking only.
    Keyword,
    /// Nearest-neighbor ranking over embeddings only.
    Vector,
    /// Both, merged with reciprocal rank fusion.
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode '{other}' (expected keyword, vector, or hybrid)"
            )),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub collection_id: i64,
    /// Absolute path of the source document.
    pub path: String,
    pub title: Option<String>,
    pub media_type: String,
    /// Caller-supplied tag, opaque to the engine.
    pub category: Option<String>,
    /// SHA-256 of the raw file bytes; the change-detection signal.
    pub content_hash: String,
    pub mtime: f64,
    pub size: i64,
}

/// A single result from the fusion query engine.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// The literal chunk text.
    pub content: String,
    /// Fused relevance score in [0, 1].
    pub score: f32,
    pub file_path: String,
    pub file_title: Option<String>,
    pub category: Option<String>,
    /// 1-indexed line span of the chunk in its source file.
    pub start_line: i64,
    pub end_line: i64,
    /// Stable chunk identifier, usable for dedup across repeated queries.
    pub chunk_id: i64,
}

/// Counts reported by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Files seen for the first time.
    pub added: usize,
    /// Files whose content hash changed and were re-chunked.
    pub updated: usize,
    /// Stored files whose source path disappeared.
    pub removed: usize,
    /// Files skipped entirely by the hash comparison.
    pub unchanged: usize,
    /// Files that errored and were left in their previous indexed state.
    pub failed: usize,
    /// Chunks written across added and updated files.
    pub chunks: usize,
}

/// Store health metrics for the diagnostics command.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub db_size_bytes: u64,
    pub files: u64,
    pub chunks: u64,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
}
