//! Fusion query engine: keyword, vector, and hybrid search over the store.
//!
//! Hybrid queries fan out to the lexical and vector indexes concurrently
//! and merge the ranked lists with reciprocal rank fusion. Query paths
//! degrade rather than fail: an empty or missing index yields an empty
//! result list, and a dead embedding backend downgrades a hybrid query to
//! keyword-only.

use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{SearchMode, SearchResult};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// Standard RRF damping constant from the literature; not tuned.
pub const RRF_K: f32 = 60.0;

/// High-level search API over one collection's store.
#[derive(Clone)]
pub struct SearchEngine {
    store: Store,
    embedder: Arc<dyn Embedder>,
}

impl SearchEngine {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Search the collection and return hydrated results, best first.
    ///
    /// Every mode runs through the fusion step (single-source modes with
    /// one list) so scores are comparable across modes and land in [0, 1].
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.max(1);
        // Over-fetch so the fusion step has enough material.
        let fetch = limit * 2;

        let lists: Vec<Vec<i64>> = match mode {
            SearchMode::Keyword => vec![self.keyword_candidates(query, fetch).await],
            SearchMode::Vector => vec![self.vector_candidates(query, fetch).await],
            SearchMode::Hybrid => {
                let (keyword, vector) = tokio::join!(
                    self.keyword_candidates(query, fetch),
                    self.vector_candidates(query, fetch)
                );
                vec![keyword, vector]
            }
        };

        let mut fused = reciprocal_rank_fusion(&lists);
        fused.retain(|(_, score)| *score >= min_score);
        fused.truncate(limit);
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = fused.iter().map(|(id, _)| *id).collect();
        let hydrated = self.store.fetch_chunks(&ids).await?;

        // Preserve fused order; a chunk deleted mid-flight is skipped.
        let results = fused
            .into_iter()
            .filter_map(|(id, score)| {
                let row = hydrated.get(&id)?;
                Some(SearchResult {
                    content: row.content.clone(),
                    score,
                    file_path: row.file_path.clone(),
                    file_title: row.file_title.clone(),
                    category: row.category.clone(),
                    start_line: row.start_line,
                    end_line: row.end_line,
                    chunk_id: id,
                })
            })
            .collect();
        Ok(results)
    }

    /// Lexical-only search; diagnostics variant of [`search`](Self::search).
    pub async fn search_keyword(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search(query, SearchMode::Keyword, limit, 0.0).await
    }

    /// Vector-only search; diagnostics variant of [`search`](Self::search).
    pub async fn search_vector(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search(query, SearchMode::Vector, limit, 0.0).await
    }

    async fn keyword_candidates(&self, query: &str, fetch: usize) -> Vec<i64> {
        match self.store.search_keyword(query, fetch).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(%error, "keyword search failed, continuing without lexical results");
                Vec::new()
            }
        }
    }

    async fn vector_candidates(&self, query: &str, fetch: usize) -> Vec<i64> {
        let embedding = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => {
                tracing::warn!("embedding backend returned no vector for query");
                return Vec::new();
            }
            Err(error) => {
                tracing::warn!(%error, "query embedding failed, continuing without vector results");
                return Vec::new();
            }
        };

        match self.store.search_vector(&embedding, fetch).await {
            Ok(hits) => hits.into_iter().map(|(id, _distance)| id).collect(),
            Err(error) => {
                tracing::warn!(%error, "vector search failed, continuing without vector results");
                Vec::new()
            }
        }
    }
}

/// Merge ranked id lists with reciprocal rank fusion.
///
/// Each list contributes `1/(k + rank)` per id (1-indexed ranks);
/// contributions are summed and normalized by the theoretical maximum
/// `n_lists / (k + 1)` so scores land in [0, 1]. Ties sort by id so the
/// result is stable under reordering of equal-score entries.
pub(crate) fn reciprocal_rank_fusion(lists: &[Vec<i64>]) -> Vec<(i64, f32)> {
    let mut scores: HashMap<i64, f32> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) += 1.0 / (RRF_K + (rank + 1) as f32);
        }
    }

    let max_score = if lists.is_empty() {
        1.0
    } else {
        lists.len() as f32 / (RRF_K + 1.0)
    };

    let mut fused: Vec<(i64, f32)> = scores
        .into_iter()
        .map(|(id, score)| (id, score / max_score))
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, content_hash};
    use crate::embedding::testing::{CountingEmbedder, FailingEmbedder};
    use crate::store::NewFile;

    fn chunk(sequence: usize, content: &str) -> Chunk {
        Chunk {
            content_hash: content_hash(content),
            content: content.to_string(),
            sequence,
            start_line: sequence + 1,
            end_line: sequence + 1,
        }
    }

    async fn seeded_engine() -> SearchEngine {
        let store = Store::open_memory().await.expect("open store");
        let collection_id = store.ensure_collection("memory").await.expect("collection");
        let embedder = Arc::new(CountingEmbedder::new());

        let texts_a = ["weather forecast tomorrow looks sunny"];
        let texts_b = ["sourdough bread needs a long fermentation"];

        for (path, category, texts) in [
            ("/vault/weather.md", "semantic", &texts_a),
            ("/vault/cooking.md", "episodic", &texts_b),
        ] {
            let chunks: Vec<Chunk> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| chunk(i, t))
                .collect();
            let embeddings: Vec<Vec<f32>> = texts
                .iter()
                .map(|t| CountingEmbedder::embed_one(t))
                .collect();
            store
                .commit_file(
                    collection_id,
                    &NewFile {
                        path,
                        title: Some("doc"),
                        media_type: "text/markdown",
                        category: Some(category),
                        content_hash: "h",
                        mtime: 1.0,
                        size: 10,
                    },
                    "test-embed",
                    &chunks,
                    &embeddings,
                )
                .await
                .expect("commit");
        }

        SearchEngine::new(store, embedder)
    }

    #[test]
    fn rrf_single_list_preserves_order() {
        let fused = reciprocal_rank_fusion(&[vec![10, 20, 30]]);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].0, 10);
        assert!(fused[0].1 > fused[1].1);
        assert!(fused[1].1 > fused[2].1);
    }

    #[test]
    fn rrf_agreement_beats_single_list_presence() {
        let fused = reciprocal_rank_fusion(&[vec![10, 20, 30], vec![20, 10, 40]]);
        let scores: HashMap<i64, f32> = fused.into_iter().collect();
        assert!(scores[&10] > scores[&30]);
        assert!(scores[&20] > scores[&30]);
        assert!(scores[&20] > scores[&40]);
    }

    #[test]
    fn rrf_scores_are_normalized() {
        let fused = reciprocal_rank_fusion(&[vec![1, 2], vec![1, 3]]);
        for (_, score) in &fused {
            assert!((0.0..=1.0).contains(score));
        }
        // Rank 1 in every list is the theoretical maximum.
        let fused = reciprocal_rank_fusion(&[vec![42], vec![42]]);
        assert!((fused[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rrf_is_monotonic_in_list_membership() {
        // Appearing in both lists never scores below appearing in either
        // alone at the same rank; the raw sum is strictly larger.
        let both = reciprocal_rank_fusion(&[vec![1], vec![1]]);
        let keyword_only = reciprocal_rank_fusion(&[vec![1]]);
        assert!(both[0].1 >= keyword_only[0].1);

        let raw_both = 2.0 / (RRF_K + 1.0);
        let raw_single = 1.0 / (RRF_K + 1.0);
        assert!(raw_both > raw_single);
    }

    #[test]
    fn rrf_ties_are_stable_under_reordering() {
        // Symmetric ranks produce equal scores; ordering falls back to id.
        let a = reciprocal_rank_fusion(&[vec![1, 2], vec![2, 1]]);
        let b = reciprocal_rank_fusion(&[vec![2, 1], vec![1, 2]]);
        assert_eq!(a, b);
        assert!((a[0].1 - a[1].1).abs() < 1e-6);
        assert!(a[0].0 < a[1].0);
    }

    #[test]
    fn rrf_empty_input() {
        assert!(reciprocal_rank_fusion(&[]).is_empty());
        assert!(reciprocal_rank_fusion(&[vec![], vec![]]).is_empty());
    }

    #[tokio::test]
    async fn keyword_mode_finds_lexical_match() {
        let engine = seeded_engine().await;
        let results = engine.search_keyword("forecast", 5).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_path, "/vault/weather.md");
        assert!(results[0].score > 0.0);
        assert_eq!(results[0].category.as_deref(), Some("semantic"));
    }

    #[tokio::test]
    async fn vector_mode_ranks_by_similarity() {
        let engine = seeded_engine().await;
        let results = engine
            .search_vector("weather conditions forecast", 5)
            .await
            .expect("search");
        assert!(!results.is_empty());
        assert_eq!(results[0].file_path, "/vault/weather.md");
    }

    #[tokio::test]
    async fn hybrid_agreement_ranks_first_and_scores_at_least_single_mode() {
        let engine = seeded_engine().await;
        let hybrid = engine
            .search("forecast tomorrow", SearchMode::Hybrid, 5, 0.0)
            .await
            .expect("hybrid");
        assert!(!hybrid.is_empty());
        assert_eq!(hybrid[0].file_path, "/vault/weather.md");

        let keyword = engine
            .search("forecast tomorrow", SearchMode::Keyword, 5, 0.0)
            .await
            .expect("keyword");
        let vector = engine
            .search("forecast tomorrow", SearchMode::Vector, 5, 0.0)
            .await
            .expect("vector");
        assert!(hybrid[0].score >= keyword[0].score);
        assert!(hybrid[0].score >= vector[0].score);
    }

    #[tokio::test]
    async fn min_score_filters_everything_above_one() {
        let engine = seeded_engine().await;
        let all = engine
            .search("forecast", SearchMode::Hybrid, 5, 0.0)
            .await
            .expect("search");
        assert!(!all.is_empty());
        let filtered = engine
            .search("forecast", SearchMode::Hybrid, 5, 1.01)
            .await
            .expect("search");
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn empty_store_returns_empty_not_error() {
        let store = Store::open_memory().await.expect("open");
        let engine = SearchEngine::new(store, Arc::new(CountingEmbedder::new()));
        let results = engine
            .search("anything", SearchMode::Hybrid, 5, 0.0)
            .await
            .expect("search must not error");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_empty() {
        let engine = seeded_engine().await;
        assert!(engine
            .search("   ", SearchMode::Hybrid, 5, 0.0)
            .await
            .expect("search")
            .is_empty());
    }

    #[tokio::test]
    async fn dead_backend_degrades_hybrid_to_keyword() {
        let engine = seeded_engine().await;
        let degraded = SearchEngine::new(engine.store.clone(), Arc::new(FailingEmbedder));
        let results = degraded
            .search("forecast", SearchMode::Hybrid, 5, 0.0)
            .await
            .expect("hybrid search must not error");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_path, "/vault/weather.md");
    }

    #[tokio::test]
    async fn reserved_characters_do_not_error() {
        let engine = seeded_engine().await;
        let results = engine
            .search("forecast: (tomorrow) \"sunny\"", SearchMode::Keyword, 5, 0.0)
            .await
            .expect("sanitized search");
        // Tokens match literally; no FTS syntax error either way.
        assert!(results.len() <= 1);
    }
}
