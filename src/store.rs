//! SQLite-backed document store holding files, chunks, and their lexical
//! and vector projections.
//!
//! One database file per collection. The lexical projection is an FTS5
//! table whose rowids stay in lock-step with `chunks.id`; rows are created
//! and deleted in the same transaction as their chunk. Embeddings live on
//! the chunk rows as little-endian f32 blobs and are searched with exact
//! KNN, which is plenty at personal-corpus scale.

use crate::chunker::Chunk;
use crate::error::{Result, StoreError};
use crate::models::{FileRecord, StoreStats};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata for a file row written alongside its chunk set.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub path: &'a str,
    pub title: Option<&'a str>,
    pub media_type: &'a str,
    pub category: Option<&'a str>,
    pub content_hash: &'a str,
    pub mtime: f64,
    pub size: i64,
}

/// A chunk row joined back to its owning file, ready for result hydration.
#[derive(Debug, Clone)]
pub struct HydratedChunk {
    pub content: String,
    pub start_line: i64,
    pub end_line: i64,
    pub file_path: String,
    pub file_title: Option<String>,
    pub category: Option<String>,
}

/// Persistent store for one collection.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create the store at `path`. Fatal on an unwritable location.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await.map_err(StoreError::from)?;
        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.init_schema().await?;
        store.repair_lexical_index().await?;
        Ok(store)
    }

    /// In-memory store for tests. Pinned to one connection so every query
    /// sees the same database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::from)?;
        let store = Self { pool, path: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                title TEXT,
                media_type TEXT NOT NULL DEFAULT 'text/markdown',
                category TEXT,
                content_hash TEXT NOT NULL,
                mtime REAL NOT NULL,
                size INTEGER NOT NULL,
                UNIQUE(collection_id, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                embedding_model TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(file_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;

        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts \
             USING fts5(content, tokenize='porter unicode61')",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    /// Re-align the lexical projection with the chunk rows: backfill chunks
    /// missing from FTS and drop orphaned FTS rows. Returns rows touched.
    pub async fn repair_lexical_index(&self) -> Result<usize> {
        let missing = sqlx::query(
            "SELECT id, content FROM chunks WHERE id NOT IN (SELECT rowid FROM chunks_fts)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        for row in &missing {
            let id: i64 = row.get("id");
            let content: String = row.get("content");
            sqlx::query("INSERT INTO chunks_fts (rowid, content) VALUES (?1, ?2)")
                .bind(id)
                .bind(content)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)?;
        }

        let orphans = sqlx::query(
            "DELETE FROM chunks_fts WHERE rowid NOT IN (SELECT id FROM chunks)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let repaired = missing.len() + orphans.rows_affected() as usize;
        if repaired > 0 {
            tracing::warn!(repaired, "lexical projection was out of sync, repaired");
        }
        Ok(repaired)
    }

    /// Get or create a collection by name.
    pub async fn ensure_collection(&self, name: &str) -> Result<i64> {
        let existing = sqlx::query("SELECT id FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        if let Some(row) = existing {
            return Ok(row.get("id"));
        }

        let result = sqlx::query("INSERT INTO collections (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(result.last_insert_rowid())
    }

    /// Look up a file row by collection and path.
    pub async fn get_file_by_path(
        &self,
        collection_id: i64,
        path: &str,
    ) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, collection_id, path, title, media_type, category, \
             content_hash, mtime, size FROM files \
             WHERE collection_id = ?1 AND path = ?2",
        )
        .bind(collection_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(row.map(|row| FileRecord {
            id: row.get("id"),
            collection_id: row.get("collection_id"),
            path: row.get("path"),
            title: row.get("title"),
            media_type: row.get("media_type"),
            category: row.get("category"),
            content_hash: row.get("content_hash"),
            mtime: row.get("mtime"),
            size: row.get("size"),
        }))
    }

    /// All (path, file id) pairs currently indexed in a collection.
    pub async fn indexed_paths(&self, collection_id: i64) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT id, path FROM files WHERE collection_id = ?1")
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("path"), row.get("id")))
            .collect())
    }

    /// Write a file row and its full chunk set in one transaction.
    ///
    /// Any previous chunk set and its lexical rows are dropped first, so a
    /// concurrent reader sees either the fully-old or fully-new generation.
    /// Only `min(chunks, embeddings)` pairs are written; callers validate
    /// the counts before getting here.
    pub async fn commit_file(
        &self,
        collection_id: i64,
        file: &NewFile<'_>,
        embedding_model: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let existing = sqlx::query("SELECT id FROM files WHERE collection_id = ?1 AND path = ?2")
            .bind(collection_id)
            .bind(file.path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        let file_id = match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                sqlx::query(
                    "UPDATE files SET title = ?1, media_type = ?2, category = ?3, \
                     content_hash = ?4, mtime = ?5, size = ?6 WHERE id = ?7",
                )
                .bind(file.title)
                .bind(file.media_type)
                .bind(file.category)
                .bind(file.content_hash)
                .bind(file.mtime)
                .bind(file.size)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO files (collection_id, path, title, media_type, category, \
                     content_hash, mtime, size) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .bind(collection_id)
                .bind(file.path)
                .bind(file.title)
                .bind(file.media_type)
                .bind(file.category)
                .bind(file.content_hash)
                .bind(file.mtime)
                .bind(file.size)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
                result.last_insert_rowid()
            }
        };

        sqlx::query(
            "DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?1)",
        )
        .bind(file_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        let now = chrono::Utc::now().to_rfc3339();
        let count = chunks.len().min(embeddings.len());
        for i in 0..count {
            let chunk = &chunks[i];
            let result = sqlx::query(
                "INSERT INTO chunks (file_id, embedding_model, sequence, content_hash, \
                 start_line, end_line, embedding, content, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(file_id)
            .bind(embedding_model)
            .bind(chunk.sequence as i64)
            .bind(&chunk.content_hash)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(encode_embedding(&embeddings[i]))
            .bind(&chunk.content)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

            sqlx::query("INSERT INTO chunks_fts (rowid, content) VALUES (?1, ?2)")
                .bind(result.last_insert_rowid())
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(file_id)
    }

    /// Delete a file, its chunks, and their lexical rows in one transaction.
    pub async fn delete_file(&self, file_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?1)",
        )
        .bind(file_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Drop every chunk in a collection and blank stored content hashes so
    /// the next sync re-chunks and re-embeds everything. Used when the
    /// embedding model changes.
    pub async fn reset_for_model_change(&self, collection_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE rowid IN (SELECT c.id FROM chunks c \
             JOIN files f ON f.id = c.file_id WHERE f.collection_id = ?1)",
        )
        .bind(collection_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        sqlx::query(
            "DELETE FROM chunks WHERE file_id IN \
             (SELECT id FROM files WHERE collection_id = ?1)",
        )
        .bind(collection_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        sqlx::query("UPDATE files SET content_hash = '' WHERE collection_id = ?1")
            .bind(collection_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Ranked lexical search. Returns chunk ids, most relevant first.
    ///
    /// The query is treated as a conjunction of individually-quoted tokens,
    /// so FTS operator characters in user input match literally.
    pub async fn search_keyword(&self, query: &str, limit: usize) -> Result<Vec<i64>> {
        let sanitized = sanitize_match_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT rowid FROM chunks_fts WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )
        .bind(sanitized)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows.into_iter().map(|row| row.get("rowid")).collect())
    }

    /// Exact KNN over chunk embeddings. Returns (chunk id, L2 distance)
    /// pairs, nearest first, ties broken by insertion order.
    pub async fn search_vector(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(i64, f32)>> {
        let rows = sqlx::query("SELECT id, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            let embedding = decode_embedding(&blob)?;
            if embedding.len() != query_embedding.len() {
                // Stale generation embedded under a different model; the
                // model-change reset will clear these on the next sync.
                tracing::trace!(chunk_id = id, "skipping chunk with mismatched embedding dim");
                continue;
            }
            candidates.push((id, l2_distance(query_embedding, &embedding)));
        }

        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    /// Fetch chunk rows joined to their owning files, keyed by chunk id.
    pub async fn fetch_chunks(&self, ids: &[i64]) -> Result<HashMap<i64, HydratedChunk>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT c.id, c.content, c.start_line, c.end_line, \
             f.path, f.title, f.category \
             FROM chunks c JOIN files f ON f.id = c.file_id \
             WHERE c.id IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::from)?;

        let mut hydrated = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            hydrated.insert(
                id,
                HydratedChunk {
                    content: row.get("content"),
                    start_line: row.get("start_line"),
                    end_line: row.get("end_line"),
                    file_path: row.get("path"),
                    file_title: row.get("title"),
                    category: row.get("category"),
                },
            );
        }
        Ok(hydrated)
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.map(|row| row.get("value")))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn file_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM files")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    pub async fn chunk_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Store health metrics for the diagnostics command.
    pub async fn stats(&self) -> Result<StoreStats> {
        let db_size_bytes = match &self.path {
            Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        };
        let embedding_dim = self
            .meta("embedding_dim")
            .await?
            .and_then(|raw| raw.parse::<usize>().ok());

        Ok(StoreStats {
            db_size_bytes,
            files: self.file_count().await?,
            chunks: self.chunk_count().await?,
            embedding_model: self.meta("embedding_model").await?,
            embedding_dim,
        })
    }
}

/// Quote every whitespace-separated token so FTS operator characters in
/// user input cannot be interpreted as query syntax.
fn sanitize_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pack a vector into raw little-endian f32 bytes.
pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> std::result::Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::BadEmbedding(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
