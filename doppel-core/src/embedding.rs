//! Vector embedding abstraction layer.
//!
//! The embedding provider is an external collaborator: it maps text to a
//! fixed-length vector and may suspend on the network. The core only depends
//! on the [`EmbeddingProvider`] trait. Two in-crate implementations exist:
//!
//! - [`HashingEmbeddingProvider`]: deterministic feature hashing, used for
//!   tests and as an offline fallback.
//! - [`CachedEmbedder`]: wraps any provider with an LRU cache so repeated
//!   query texts skip the round trip.
//!
//! HTTP-backed providers live in `doppel-llm`.

use std::future::Future;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::RetrievalConfig;
use crate::error::EmbeddingError;
use crate::types::Embedding;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Generate vector embeddings from text.
///
/// Implementations must be `Send + Sync`; the returned futures must be `Send`
/// so a twin handle can be driven from a multi-threaded runtime.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into `dimensions()` floats.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding, EmbeddingError>> + Send;

    /// The dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// A human-readable name for the model (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
}

/// Check a provider result against the store's fixed dimensionality.
///
/// # Errors
///
/// Returns [`EmbeddingError::DimensionMismatch`] for a wrong length and
/// [`EmbeddingError::Malformed`] for empty or non-finite vectors.
pub fn validate(embedding: &Embedding, expected: usize) -> Result<(), EmbeddingError> {
    if embedding.0.is_empty() {
        return Err(EmbeddingError::Malformed {
            reason: "empty vector".to_string(),
        });
    }
    if embedding.dimensions() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: embedding.dimensions(),
        });
    }
    if !embedding.is_finite() {
        return Err(EmbeddingError::Malformed {
            reason: "vector contains NaN or infinite components".to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Feature-hashing provider
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed (FNV-1a, 64 bit) into one of
/// `dims` buckets with a hash-derived sign, then the vector is L2-normalised.
/// Texts sharing words get positive cosine similarity; identical texts get
/// exactly 1.0. The hash is fixed, so persisted vectors stay comparable with
/// fresh ones across builds.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    /// Create a new hashing provider with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dims: dimensions.max(1) }
    }

    /// Embed synchronously; the async trait method delegates here.
    #[must_use]
    pub fn embed_now(&self, text: &str) -> Embedding {
        let mut raw = vec![0.0_f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            raw[bucket] += sign;
        }

        let mag: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag < f32::EPSILON {
            // Empty text still needs a usable, non-zero vector.
            raw[0] = 1.0;
            return Embedding(raw);
        }
        Embedding(raw.iter().map(|x| x / mag).collect())
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding, EmbeddingError>> + Send {
        let embedding = self.embed_now(text);
        async move { Ok(embedding) }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

// ---------------------------------------------------------------------------
// LRU cache wrapper
// ---------------------------------------------------------------------------

/// Wraps a provider with an LRU cache keyed by exact text.
///
/// Failures are never cached.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Embedding>>,
}

impl<E: EmbeddingProvider> CachedEmbedder<E> {
    /// Wrap `inner` with a cache holding at most `capacity` entries
    /// (a capacity of 0 is treated as 1).
    #[must_use]
    pub fn new(inner: E, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Wrap `inner` with a cache sized by `retrieval.query_cache_size`.
    #[must_use]
    pub fn from_config(inner: E, config: &RetrievalConfig) -> Self {
        Self::new(inner, config.query_cache_size)
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Number of cached embeddings.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<E: EmbeddingProvider> EmbeddingProvider for CachedEmbedder<E> {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding, EmbeddingError>> + Send {
        let hit = self.cache.lock().get(text).cloned();
        async move {
            if let Some(embedding) = hit {
                return Ok(embedding);
            }
            let embedding = self.inner.embed(text).await?;
            self.cache.lock().put(text.to_string(), embedding.clone());
            Ok(embedding)
        }
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        inner: HashingEmbeddingProvider,
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding, EmbeddingError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn hashing_is_deterministic_and_unit_length() {
        let provider = HashingEmbeddingProvider::new(64);
        let a = provider.embed_now("I love hiking in the mountains");
        let b = provider.embed_now("I love hiking in the mountains");
        assert_eq!(a, b);
        let mag: f32 = a.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-4, "expected unit vector, got {mag}");
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn hashing_layout_is_pinned() {
        // fnv1a("a") % 8 == 4, top bit set -> negative sign.
        let e = HashingEmbeddingProvider::new(8).embed_now("A");
        assert_eq!(e.0, vec![0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn shared_words_are_more_similar() {
        let provider = HashingEmbeddingProvider::new(256);
        let q = provider.embed_now("hiking mountains weekend");
        let near = provider.embed_now("a weekend of hiking in the mountains");
        let far = provider.embed_now("quarterly tax spreadsheet");
        assert!(q.cosine_similarity(&near) > q.cosine_similarity(&far));
    }

    #[test]
    fn empty_text_still_embeds() {
        let provider = HashingEmbeddingProvider::new(8);
        let e = provider.embed_now("   ");
        assert!(validate(&e, 8).is_ok());
    }

    #[test]
    fn validate_rejects_bad_vectors() {
        assert!(matches!(
            validate(&Embedding(vec![1.0, 0.0]), 3),
            Err(EmbeddingError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            validate(&Embedding(vec![f32::NAN, 0.0]), 2),
            Err(EmbeddingError::Malformed { .. })
        ));
        assert!(validate(&Embedding(vec![]), 0).is_err());
    }

    #[tokio::test]
    async fn cache_skips_repeat_calls() {
        let provider = CachedEmbedder::new(
            CountingProvider {
                calls: AtomicUsize::new(0),
                inner: HashingEmbeddingProvider::new(16),
            },
            4,
        );
        let a = provider.embed("hello world").await.expect("embed");
        let b = provider.embed("hello world").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(provider.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.cached(), 1);
    }

    #[tokio::test]
    async fn cache_capacity_comes_from_retrieval_config() {
        let config = RetrievalConfig {
            query_cache_size: 2,
            ..RetrievalConfig::default()
        };
        let provider = CachedEmbedder::from_config(
            CountingProvider {
                calls: AtomicUsize::new(0),
                inner: HashingEmbeddingProvider::new(16),
            },
            &config,
        );
        for text in ["one", "two", "three", "three"] {
            provider.embed(text).await.expect("embed");
        }
        assert_eq!(provider.cached(), 2);
        assert_eq!(provider.inner().calls.load(Ordering::SeqCst), 3);
        // "one" was evicted by the LRU.
        provider.embed("one").await.expect("embed");
        assert_eq!(provider.inner().calls.load(Ordering::SeqCst), 4);
    }
}
