//! Embedding providers and the `build_embeddings` artifact pipeline.
//!
//! [`EmbeddingProvider`] is the seam between deterministic, offline
//! operation (tests, air-gapped deployments) and a real model behind an
//! OpenAI-compatible HTTP endpoint. Both implementations return unit
//! vectors of a fixed dimensionality so cosine similarity downstream never
//! has to special-case magnitude.

use async_trait::async_trait;
use rusqlite::params;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::store::Store;

/// Anything that turns text into a fixed-width float vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic, network-free provider: each dimension is a byte of
/// `sha256(text)` (cycled if `dims` exceeds 32), linearly mapped to
/// `[-1, 1]` and L2-normalized. Reproducible across machines and runs,
/// which is the point — it exists for tests and for callers who want a
/// stable baseline without depending on model drift.
pub struct LocalDeterministicProvider {
    model_id: String,
    dims: usize,
}

impl LocalDeterministicProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            model_id: format!("local-deterministic-{dims}"),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalDeterministicProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| deterministic_vector(t, self.dims)).collect())
    }
}

fn deterministic_vector(text: &str, dims: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut v: Vec<f32> = (0..dims)
        .map(|i| {
            let byte = digest[i % digest.len()];
            (byte as f32 / 255.0) * 2.0 - 1.0
        })
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// HTTP client for an OpenAI-compatible `/embeddings` endpoint.
#[cfg(feature = "http-embeddings")]
pub struct HttpEmbeddingProvider {
    model_id: String,
    dims: usize,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[cfg(feature = "http-embeddings")]
impl HttpEmbeddingProvider {
    pub fn new(model_id: impl Into<String>, dims: usize, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            dims,
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http-embeddings")]
#[derive(serde::Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[cfg(feature = "http-embeddings")]
#[derive(serde::Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[cfg(feature = "http-embeddings")]
#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[cfg(feature = "http-embeddings")]
#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model_id,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| EngineError::tool_failure(format!("embedding request failed: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::tool_failure(format!("embedding endpoint returned an error: {e}")))?
            .json::<EmbeddingsResponse>()
            .await
            .map_err(|e| EngineError::tool_failure(format!("malformed embedding response: {e}")))?;

        for datum in &response.data {
            if datum.embedding.len() != self.dims {
                return Err(EngineError::embedding_dims(format!(
                    "provider {} returned {} dims, expected {}",
                    self.model_id,
                    datum.embedding.len(),
                    self.dims
                )));
            }
        }
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Lookup table from model id to provider, so `build_embeddings` can be
/// invoked against whichever model a caller names.
pub struct ProviderRegistry {
    providers: std::collections::HashMap<String, std::sync::Arc<dyn EmbeddingProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: std::collections::HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: std::sync::Arc<dyn EmbeddingProvider>) {
        self.providers.insert(provider.model_id().to_string(), provider);
    }

    pub fn get(&self, model_id: &str) -> Result<std::sync::Arc<dyn EmbeddingProvider>> {
        self.providers
            .get(model_id)
            .cloned()
            .ok_or_else(|| EngineError::embeddings_not_found(format!("no provider registered for model {model_id}")))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default and maximum batch size for provider calls, per the embedding
/// artifact builder's batching contract.
pub const DEFAULT_BATCH_SIZE: usize = 128;
pub const MAX_BATCH_SIZE: usize = 2048;

pub struct EmbeddingsBuildReport {
    pub tree_hash: String,
    pub model_id: String,
    pub chunk_count: usize,
    pub skipped: bool,
}

pub struct Embeddings<'s> {
    store: &'s Store,
}

impl<'s> Embeddings<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Embed every chunk of a frozen tree under one model and record the
    /// artifact.
    ///
    /// Preconditions: the tree must be frozen (`tree_chunks` non-empty),
    /// and the working tree (scoped to whichever `repo_id` the tree's
    /// docs belong to) must hash-equal `tree_hash` — otherwise the text
    /// actually sent to the provider (read from the working `chunks`
    /// table, per the documented working-tree-read ambiguity) would not
    /// be the text the frozen tree claims to contain
    /// (`ERR_WORKING_TREE_DIRTY`). `batch_size` defaults to 128 and is
    /// capped at 2048.
    pub async fn build_embeddings(
        &self,
        dag: &crate::dag::Dag<'_>,
        tree_hash: &str,
        provider: &dyn EmbeddingProvider,
        batch_size: Option<usize>,
    ) -> Result<EmbeddingsBuildReport> {
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).clamp(1, MAX_BATCH_SIZE);

        let chunks: Vec<(String, String, String)> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tc.chunk_id, tc.content_hash, COALESCE(c.text, '')
                 FROM tree_chunks tc
                 LEFT JOIN chunks c ON c.chunk_id = tc.chunk_id
                 WHERE tc.tree_hash = ?1
                 ORDER BY tc.chunk_id ASC",
            )?;
            let rows = stmt.query_map(params![tree_hash], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(EngineError::from)
        })?;

        if chunks.is_empty() {
            return Err(EngineError::not_frozen(format!(
                "tree {tree_hash} has no tree_chunks rows; call save_tree first"
            )));
        }

        let repo_id: Option<String> = self.store.read(|conn| {
            conn.query_row(
                "SELECT repo_id FROM tree_docs WHERE tree_hash = ?1 LIMIT 1",
                params![tree_hash],
                |r| r.get(0),
            )
            .optional_engine()
        })?;
        if let Some(repo_id) = repo_id {
            let working = dag.create_tree_from_current_state(&repo_id)?;
            if working.tree_hash != tree_hash {
                return Err(EngineError::working_tree_dirty(format!(
                    "working tree {} does not match target tree {tree_hash}; checkout it first",
                    working.tree_hash
                )));
            }
        }

        let exists: bool = self.store.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM index_artifacts WHERE tree_hash = ?1 AND kind = 'embeddings' AND model_id = ?2",
                params![tree_hash, provider.model_id()],
                |r| r.get(0),
            )?;
            Ok(count > 0)
        })?;
        if exists {
            return Ok(EmbeddingsBuildReport {
                tree_hash: tree_hash.to_string(),
                model_id: provider.model_id().to_string(),
                chunk_count: chunks.len(),
                skipped: true,
            });
        }

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
            let batch_vectors = provider.embed(&texts).await?;
            if batch_vectors.len() != batch.len() {
                return Err(EngineError::embedding_dims(format!(
                    "provider returned {} vectors for a batch of {}",
                    batch_vectors.len(),
                    batch.len()
                )));
            }
            vectors.extend(batch_vectors);
        }

        self.store.transaction(|tx| {
            for ((chunk_id, _, _), vector) in chunks.iter().zip(vectors.iter()) {
                if vector.len() != provider.dims() {
                    return Err(EngineError::embedding_dims(format!(
                        "chunk {chunk_id} got a {}-dim vector, provider declares {}",
                        vector.len(),
                        provider.dims()
                    )));
                }
                let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
                let blob_hash = crate::codec::sha256_hex(&blob);
                tx.execute(
                    "INSERT OR IGNORE INTO chunk_embeddings (tree_hash, chunk_id, model_id, blob, dims, content_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![tree_hash, chunk_id, provider.model_id(), blob, vector.len() as i64, blob_hash],
                )?;
            }

            let payload_hash = crate::codec::sha256_hex_of(
                &chunks.iter().map(|(id, h, _)| (id.clone(), h.clone())).collect::<Vec<_>>(),
            );
            let manifest = serde_json::json!({
                "kind": "embeddings",
                "provider_id": provider.model_id(),
                "model_id": provider.model_id(),
                "dims": provider.dims(),
                "chunk_count": chunks.len(),
                "tree_entries_hash": tree_hash,
            });
            let manifest_hash = crate::codec::sha256_hex_of(&manifest);
            let artifact_id = crate::codec::sha256_hex_of(&serde_json::json!({
                "kind": "embeddings",
                "tree_hash": tree_hash,
                "provider_id": provider.model_id(),
                "dims": provider.dims(),
                "manifest_hash": manifest_hash,
            }));
            let manifest_json = manifest.to_string();
            tx.execute(
                "INSERT INTO index_artifacts (artifact_id, tree_hash, kind, model_id, manifest_json, payload_hash, chunk_count, created_at)
                 VALUES (?1, ?2, 'embeddings', ?3, ?4, ?5, ?6, ?7)",
                params![artifact_id, tree_hash, provider.model_id(), manifest_json, payload_hash, chunks.len() as i64, crate::domain::EPOCH],
            )?;
            tx.execute(
                "INSERT INTO artifact_refs (ref_type, ref_name, kind, artifact_id) VALUES ('tree', ?1, 'embeddings', ?2)",
                params![tree_hash, artifact_id],
            )?;
            Ok(())
        })?;

        Ok(EmbeddingsBuildReport {
            tree_hash: tree_hash.to_string(),
            model_id: provider.model_id().to_string(),
            chunk_count: chunks.len(),
            skipped: false,
        })
    }
}

trait OptionalEngine<T> {
    fn optional_engine(self) -> Result<Option<T>>;
}

impl<T> OptionalEngine<T> for std::result::Result<T, rusqlite::Error> {
    fn optional_engine(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
