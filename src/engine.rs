//! Top-level handle: owns the database connection and the embedding
//! provider registry, and reads configuration from the environment
//! exactly once at open time.

use std::path::Path;
use std::sync::Arc;

use crate::embeddings::{EmbeddingProvider, LocalDeterministicProvider, ProviderRegistry};
use crate::error::{EngineError, Result};
use crate::store::Store;

const ENV_DB_PATH: &str = "DOCIDX_DB_PATH";
const ENV_EMBED_API_KEY: &str = "DOCIDX_EMBED_API_KEY";
const ENV_EMBED_BASE_URL: &str = "DOCIDX_EMBED_BASE_URL";

pub struct Engine {
    pub store: Store,
    pub providers: ProviderRegistry,
}

impl Engine {
    /// Open against `DOCIDX_DB_PATH`, or an in-memory database if unset
    /// (the latter exists for tests and ephemeral sessions, never for a
    /// real deployment). Always registers a deterministic local provider;
    /// additionally registers an HTTP provider when both
    /// `DOCIDX_EMBED_API_KEY` and `DOCIDX_EMBED_BASE_URL` are set.
    pub fn open() -> Result<Self> {
        let store = match std::env::var(ENV_DB_PATH) {
            Ok(path) => Store::open(Path::new(&path))?,
            Err(_) => Store::open_in_memory()?,
        };

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(LocalDeterministicProvider::new(32)));

        #[cfg(feature = "http-embeddings")]
        {
            if let (Ok(api_key), Ok(base_url)) = (
                std::env::var(ENV_EMBED_API_KEY),
                std::env::var(ENV_EMBED_BASE_URL),
            ) {
                let http_provider = crate::embeddings::HttpEmbeddingProvider::new(
                    "text-embedding-remote",
                    1536,
                    base_url,
                    api_key,
                );
                providers.register(Arc::new(http_provider));
            }
        }

        Ok(Self { store, providers })
    }

    pub fn open_in_memory_for_tests() -> Result<Self> {
        let store = Store::open_in_memory()?;
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(LocalDeterministicProvider::new(32)));
        Ok(Self { store, providers })
    }

    pub fn provider(&self, model_id: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        self.providers.get(model_id)
    }

    /// Flush the WAL before the process exits.
    pub fn close(self) -> Result<()> {
        self.store.checkpoint()
    }
}
