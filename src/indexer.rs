//! Sync orchestration: discover files, detect changes, chunk, embed, store.

use crate::chunker;
use crate::config::{ChunkingConfig, EngineConfig, IndexingConfig};
use crate::embedding::{self, Embedder};
use crate::error::{EmbeddingError, Error, Result};
use crate::models::SyncStats;
use crate::store::{NewFile, Store};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Options for one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Opaque category tag recorded on every file this run writes.
    pub category: Option<String>,
    /// Re-chunk and re-embed files even when their hash is unchanged.
    pub force: bool,
}

/// What happened to a single discovered file.
enum FileOutcome {
    Added(usize),
    Updated(usize),
    Unchanged,
}

/// Indexes a directory tree of documents into the store.
pub struct Indexer {
    store: Store,
    embedder: Arc<dyn Embedder>,
    collection: String,
    chunking: ChunkingConfig,
    indexing: IndexingConfig,
}

impl Indexer {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, config: &EngineConfig) -> Self {
        Self {
            store,
            embedder,
            collection: config.collection.clone(),
            chunking: config.chunking.clone(),
            indexing: config.indexing.clone(),
        }
    }

    /// Walk `root` and bring the store in line with what is on disk.
    ///
    /// Unchanged files (by content hash) are skipped entirely; changed
    /// files have their chunk set replaced atomically; stored files whose
    /// path disappeared are deleted. One file's failure never aborts the
    /// run. Interrupting between files is safe: the next sync picks up
    /// where this one left off because unchanged files cost nothing.
    pub async fn sync(&self, root: &Path, options: &SyncOptions) -> Result<SyncStats> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Config(format!("unreadable root {}: {e}", root.display())))?;
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "index root {} is not a directory",
                root.display()
            )));
        }

        let collection_id = self.store.ensure_collection(&self.collection).await?;
        self.apply_model_guard(collection_id).await?;

        let mut stats = SyncStats::default();

        let discovered = self.discover_files(&root);
        let discovered_set: HashSet<String> = discovered
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();

        // Prune stored files whose source path no longer exists.
        for (path, file_id) in self.store.indexed_paths(collection_id).await? {
            if !discovered_set.contains(&path) {
                self.store.delete_file(file_id).await?;
                tracing::debug!(path = %path, "removed vanished file from index");
                stats.removed += 1;
            }
        }

        let concurrency = self.indexing.embed_concurrency.max(1);
        let outcomes: Vec<(PathBuf, Result<FileOutcome>)> =
            futures::stream::iter(discovered.into_iter().map(|path| async move {
                let outcome = self.process_file(collection_id, &path, options).await;
                (path, outcome)
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (path, outcome) in outcomes {
            match outcome {
                Ok(FileOutcome::Added(chunks)) => {
                    stats.added += 1;
                    stats.chunks += chunks;
                }
                Ok(FileOutcome::Updated(chunks)) => {
                    stats.updated += 1;
                    stats.chunks += chunks;
                }
                Ok(FileOutcome::Unchanged) => stats.unchanged += 1,
                Err(error) => {
                    // The file stays in its previous indexed state.
                    tracing::warn!(path = %path.display(), error = %error, "failed to index file");
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            unchanged = stats.unchanged,
            failed = stats.failed,
            chunks = stats.chunks,
            "sync complete"
        );
        Ok(stats)
    }

    /// Full rebuild: the sync path with the hash short-circuit disabled.
    pub async fn rebuild(&self, root: &Path, options: &SyncOptions) -> Result<SyncStats> {
        let options = SyncOptions {
            force: true,
            ..options.clone()
        };
        self.sync(root, &options).await
    }

    /// Detect an embedding model change and force a full re-embed: mixed
    /// model generations in one store would make distances meaningless.
    async fn apply_model_guard(&self, collection_id: i64) -> Result<()> {
        let current = self.embedder.model_id();
        let stored = self.store.meta("embedding_model").await?;
        let model_changed = stored.as_deref().is_some_and(|m| m != current);

        if model_changed {
            tracing::info!(
                old = stored.as_deref().unwrap_or_default(),
                new = current,
                "embedding model changed, forcing full re-embed"
            );
            self.store.reset_for_model_change(collection_id).await?;
        }

        if model_changed || self.store.meta("embedding_dim").await?.is_none() {
            match embedding::probe_dimensions(self.embedder.as_ref()).await {
                Ok(dim) => {
                    self.store
                        .set_meta("embedding_dim", &dim.to_string())
                        .await?;
                }
                Err(error) => {
                    // Not fatal; per-file embedding will report its own
                    // failures and the dim lands on a later sync.
                    tracing::warn!(%error, "could not probe embedding dimensions");
                }
            }
        }
        self.store.set_meta("embedding_model", current).await?;
        Ok(())
    }

    /// Recursively collect indexable files under `root`, skipping hidden
    /// and excluded directories. Sorted for deterministic processing.
    fn discover_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.walk_directory(root, &mut files);
        files.sort();
        tracing::debug!(count = files.len(), "discovered indexable files");
        files
    }

    fn walk_directory(&self, dir: &Path, files: &mut Vec<PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(path = %dir.display(), error = %error, "failed to read directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with('.') || self.indexing.exclude_dirs.iter().any(|d| d == name)
                    {
                        continue;
                    }
                }
                self.walk_directory(&path, files);
            } else if self.is_indexable(&path) {
                files.push(path);
            }
        }
    }

    fn is_indexable(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.indexing.extensions.iter().any(|e| e == ext))
    }

    /// Index one file: hash, compare, chunk, embed, commit atomically.
    async fn process_file(
        &self,
        collection_id: i64,
        path: &Path,
        options: &SyncOptions,
    ) -> Result<FileOutcome> {
        let bytes = tokio::fs::read(path).await?;
        let content_hash = hex::encode(Sha256::digest(&bytes));
        let path_str = path.to_string_lossy();

        let existing = self.store.get_file_by_path(collection_id, &path_str).await?;
        let is_new = existing.is_none();
        if let Some(existing) = &existing {
            if !options.force && existing.content_hash == content_hash {
                return Ok(FileOutcome::Unchanged);
            }
        }

        let content = String::from_utf8_lossy(&bytes);
        let chunks = chunker::chunk_markdown(
            &content,
            self.chunking.target_tokens,
            self.chunking.overlap_fraction,
        );

        let embeddings = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            // The adapter tolerates a short response; losing chunks is a
            // hard error here so the file keeps its previous generation.
            if vectors.len() != chunks.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: chunks.len(),
                    got: vectors.len(),
                }
                .into());
            }
            vectors
        };

        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());

        let chunk_total = chunks.len();
        self.store
            .commit_file(
                collection_id,
                &NewFile {
                    path: &path_str,
                    title: title.as_deref(),
                    media_type: media_type_for(path),
                    category: options.category.as_deref(),
                    content_hash: &content_hash,
                    mtime,
                    size: bytes.len() as i64,
                },
                self.embedder.model_id(),
                &chunks,
                &embeddings,
            )
            .await?;

        Ok(if is_new {
            FileOutcome::Added(chunk_total)
        } else {
            FileOutcome::Updated(chunk_total)
        })
    }
}

fn media_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md" | "markdown") => "text/markdown",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::{CountingEmbedder, FailingEmbedder};
    use sqlx::Row;

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            store_path: Some(dir.join("store.db")),
            ..EngineConfig::default()
        }
    }

    async fn setup(dir: &Path) -> (Store, Arc<CountingEmbedder>, Indexer) {
        let config = test_config(dir);
        let store = Store::open_memory().await.expect("open store");
        let embedder = Arc::new(CountingEmbedder::new());
        let indexer = Indexer::new(store.clone(), embedder.clone(), &config);
        (store, embedder, indexer)
    }

    fn write_corpus(root: &Path) {
        std::fs::create_dir_all(root.join("sessions")).expect("mkdir");
        std::fs::write(
            root.join("weather.md"),
            "# Weather\n\nweather forecast tomorrow looks sunny\n",
        )
        .expect("write a");
        std::fs::write(
            root.join("sessions/cooking.md"),
            "# Cooking\n\nsourdough bread needs a long fermentation\n",
        )
        .expect("write b");
    }

    #[tokio::test]
    async fn first_sync_indexes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (store, _, indexer) = setup(dir.path()).await;

        let stats = indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("sync");
        assert_eq!(stats.added, 2);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.file_count().await.expect("files"), 2);
        assert!(store.chunk_count().await.expect("chunks") >= 2);
        assert_eq!(
            store.meta("embedding_model").await.expect("meta").as_deref(),
            Some("test-embed")
        );
    }

    #[tokio::test]
    async fn unchanged_resync_embeds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (_, embedder, indexer) = setup(dir.path()).await;

        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");
        let calls_after_first = embedder.call_count();

        let stats = indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("second sync");
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.added + stats.updated, 0);
        // The incrementality guarantee: zero embedding calls on re-sync.
        assert_eq!(embedder.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn changed_file_reembeds_only_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (store, _, indexer) = setup(dir.path()).await;

        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");

        let sibling_updated_at: Vec<String> =
            sqlx::query("SELECT c.updated_at FROM chunks c JOIN files f ON f.id = c.file_id WHERE f.path LIKE '%cooking.md'")
                .fetch_all(store.pool())
                .await
                .expect("sibling timestamps")
                .into_iter()
                .map(|row| row.get("updated_at"))
                .collect();
        assert!(!sibling_updated_at.is_empty());

        // One byte of new content changes the hash.
        std::fs::write(
            dir.path().join("weather.md"),
            "# Weather\n\nweather forecast tomorrow looks sunny!\n",
        )
        .expect("rewrite a");

        let stats = indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("second sync");
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 1);

        let sibling_after: Vec<String> =
            sqlx::query("SELECT c.updated_at FROM chunks c JOIN files f ON f.id = c.file_id WHERE f.path LIKE '%cooking.md'")
                .fetch_all(store.pool())
                .await
                .expect("sibling timestamps")
                .into_iter()
                .map(|row| row.get("updated_at"))
                .collect();
        assert_eq!(sibling_updated_at, sibling_after);
    }

    #[tokio::test]
    async fn vanished_files_are_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (store, _, indexer) = setup(dir.path()).await;

        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");
        assert_eq!(store.file_count().await.expect("files"), 2);

        std::fs::remove_file(dir.path().join("weather.md")).expect("remove");
        let stats = indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("second sync");
        assert_eq!(stats.removed, 1);
        assert_eq!(store.file_count().await.expect("files"), 1);
        assert!(store
            .search_keyword("forecast", 10)
            .await
            .expect("keyword")
            .is_empty());
    }

    #[tokio::test]
    async fn rebuild_reembeds_unchanged_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (_, embedder, indexer) = setup(dir.path()).await;

        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");
        let calls_after_first = embedder.call_count();

        let stats = indexer
            .rebuild(dir.path(), &SyncOptions::default())
            .await
            .expect("rebuild");
        assert_eq!(stats.updated, 2);
        assert!(embedder.call_count() > calls_after_first);
    }

    #[tokio::test]
    async fn embedding_failure_leaves_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let config = test_config(dir.path());
        let store = Store::open_memory().await.expect("open store");

        // First pass with a working embedder.
        let good = Arc::new(CountingEmbedder::with_model("failing-embed"));
        let indexer = Indexer::new(store.clone(), good, &config);
        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");
        let chunks_before = store.chunk_count().await.expect("chunks");

        // Change one file, then sync with a dead backend. The sync itself
        // succeeds; the changed file is counted failed and keeps its old
        // chunks.
        std::fs::write(dir.path().join("weather.md"), "# Weather\n\nrewritten\n")
            .expect("rewrite");
        let indexer = Indexer::new(store.clone(), Arc::new(FailingEmbedder), &config);
        let stats = indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("sync with dead backend");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(store.chunk_count().await.expect("chunks"), chunks_before);
        assert!(!store
            .search_keyword("forecast", 10)
            .await
            .expect("keyword")
            .is_empty());
    }

    #[tokio::test]
    async fn model_change_forces_full_reindex() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let config = test_config(dir.path());
        let store = Store::open_memory().await.expect("open store");

        let first = Arc::new(CountingEmbedder::with_model("model-a"));
        Indexer::new(store.clone(), first, &config)
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("first sync");

        let second = Arc::new(CountingEmbedder::with_model("model-b"));
        let stats = Indexer::new(store.clone(), second, &config)
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("second sync");
        // Hashes were blanked, so every file re-embeds under the new model.
        assert_eq!(stats.updated, 2);
        assert_eq!(
            store.meta("embedding_model").await.expect("meta").as_deref(),
            Some("model-b")
        );
    }

    #[tokio::test]
    async fn hidden_and_excluded_directories_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        std::fs::create_dir_all(dir.path().join(".obsidian")).expect("mkdir");
        std::fs::write(dir.path().join(".obsidian/workspace.md"), "# hidden\n").expect("write");
        std::fs::create_dir_all(dir.path().join("node_modules")).expect("mkdir");
        std::fs::write(dir.path().join("node_modules/readme.md"), "# vendored\n").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "not markdown\n").expect("write");

        let (store, _, indexer) = setup(dir.path()).await;
        indexer
            .sync(dir.path(), &SyncOptions::default())
            .await
            .expect("sync");
        assert_eq!(store.file_count().await.expect("files"), 2);
    }

    #[tokio::test]
    async fn category_tag_is_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path());
        let (store, _, indexer) = setup(dir.path()).await;

        indexer
            .sync(
                dir.path(),
                &SyncOptions {
                    category: Some("episodic".to_string()),
                    force: false,
                },
            )
            .await
            .expect("sync");

        let ids = store.search_keyword("forecast", 10).await.expect("keyword");
        let hydrated = store.fetch_chunks(&ids).await.expect("hydrate");
        assert!(hydrated
            .values()
            .all(|row| row.category.as_deref() == Some("episodic")));
    }

    #[tokio::test]
    async fn unreadable_root_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, _, indexer) = setup(dir.path()).await;
        let missing = dir.path().join("does-not-exist");
        assert!(indexer
            .sync(&missing, &SyncOptions::default())
            .await
            .is_err());
    }
}
