use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use lru::LruCache;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use valet_llm::EmbeddingClient;

use crate::normalize::GistNormalizer;

/// Cached vectors: `"{model}\x1f{cache_key}" → serialized Vec<f32>`.
///
/// The model id is part of the key so switching the configured embedding
/// model logically invalidates prior entries without a wipe.
const EMBEDDINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");

/// Hot-path entries kept in RAM in front of redb.
const LRU_CAPACITY: usize = 512;

/// Dot-product similarity reported on the 0–100 scale used throughout the
/// plane. Empty operands score 0, which is how embedding failures degrade
/// into "no match".
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>() * 100.0
}

/// Normalize-then-cache embedding service.
///
/// One instance is built at the composition root and shared via `Arc`; the
/// dictionaries inside [`GistNormalizer`] are loaded exactly once.
pub struct EmbeddingService {
    client: Arc<dyn EmbeddingClient>,
    normalizer: GistNormalizer,
    model: String,
    expand_symbols: bool,
    db: Database,
    hot: Mutex<LruCache<String, Vec<f32>>>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("model", &self.model)
            .field("expand_symbols", &self.expand_symbols)
            .finish()
    }
}

impl EmbeddingService {
    pub fn open(
        cache_path: impl AsRef<Path>,
        client: Arc<dyn EmbeddingClient>,
        normalizer: GistNormalizer,
        model: impl Into<String>,
        expand_symbols: bool,
    ) -> Result<Self> {
        let cache_path = cache_path.as_ref();
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(cache_path)
            .with_context(|| format!("opening embedding cache at {}", cache_path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(EMBEDDINGS_TABLE)?;
            tx.commit()?;
        }

        Ok(Self {
            client,
            normalizer,
            model: model.into(),
            expand_symbols,
            db,
            hot: Mutex::new(LruCache::new(
                NonZeroUsize::new(LRU_CAPACITY).expect("capacity is non-zero"),
            )),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Canonical cache key for `text` under the requested normalization mode.
    pub fn cache_key(&self, text: &str, normalize_for_cache: bool) -> String {
        if normalize_for_cache {
            self.normalizer.normalize_for_cache(text, self.expand_symbols)
        } else {
            text.to_string()
        }
    }

    /// Embed `text`, caching under its canonical form.
    ///
    /// With `normalize_for_cache` the canonical form is also the embedding
    /// input, so equivalent phrasings share one vector. With it off the exact
    /// text is both key and input (source code). Upstream failure returns an
    /// empty vector — similarity checks treat that as "no match" and the
    /// request continues.
    pub async fn embed(&self, text: &str, normalize_for_cache: bool) -> Vec<f32> {
        let key = self.cache_key(text, normalize_for_cache);
        if key.is_empty() {
            return Vec::new();
        }

        let storage_key = format!("{}\u{1f}{}", self.model, key);

        if let Some(vector) = self.hot.lock().expect("lru lock").get(&storage_key) {
            return vector.clone();
        }
        match self.cache_get(&storage_key) {
            Ok(Some(vector)) => {
                self.hot
                    .lock()
                    .expect("lru lock")
                    .put(storage_key, vector.clone());
                return vector;
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "embedding cache read failed — falling through to backend"),
        }

        debug!(key = %key, "embedding cache miss");
        let vector = match self.client.embed(&self.model, &key).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(%err, "embedding backend unavailable — returning empty vector");
                return Vec::new();
            }
        };

        if let Err(err) = self.cache_put(&storage_key, &vector) {
            warn!(%err, "embedding cache write failed — vector not persisted");
        }
        self.hot
            .lock()
            .expect("lru lock")
            .put(storage_key, vector.clone());
        vector
    }

    fn cache_get(&self, storage_key: &str) -> Result<Option<Vec<f32>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EMBEDDINGS_TABLE)?;
        match table.get(storage_key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        }
    }

    fn cache_put(&self, storage_key: &str, vector: &[f32]) -> Result<()> {
        let bytes = serde_json::to_vec(vector)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(EMBEDDINGS_TABLE)?;
            table.insert(storage_key, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }
}
