//! Embedding provider adapter and its normalising, LRU cache
//!
//! The provider is pluggable behind [`EmbeddingProvider`] so tests can swap in
//! a deterministic stub; production code wires a real model behind the same
//! trait. Every call goes through [`EmbeddingCache`] first, which is keyed by
//! the SHA-256 of the normalised text (trimmed, Unicode NFC, whitespace
//! collapsed) and never evicts on failure - a failed embed leaves no residue
//! in the cache for the caller to mistake for a zero embedding.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Errors raised by an [`EmbeddingProvider`] or the cache wrapping it.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// The provider is unreachable or returned a transport-level failure.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Input text exceeded the provider's maximum length.
    #[error("input exceeds provider length limit: {0}")]
    InputTooLong(String),
    /// The provider returned a vector whose dimension didn't match configuration.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A source of dense text embeddings. Implementations must be deterministic
/// up to the jitter tolerance stated on [`EmbeddingProvider::embed`]; a
/// provider that cannot guarantee this should not implement the trait.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single piece of text into a fixed-dimension vector. Repeated
    /// calls on identical text should return vectors that differ by no more
    /// than 1e-6 per component.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// The dimensionality this provider produces.
    fn dimensions(&self) -> usize;
}

fn normalize_for_cache_key(text: &str) -> String {
    let nfc: String = text.trim().nfc().collect();
    let mut out = String::with_capacity(nfc.len());
    let mut last_was_space = false;
    for c in nfc.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn cache_key(text: &str) -> String {
    let normalized = normalize_for_cache_key(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Wraps an [`EmbeddingProvider`] with an LRU cache keyed by normalised text.
/// Entries are immutable once written; a failed embed is never cached.
pub struct EmbeddingCache {
    provider: Box<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Wrap `provider` with an LRU cache holding up to `capacity` entries.
    pub fn new(provider: Box<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Embed `text`, serving from cache when the normalised text has been
    /// seen before. On provider failure, the pipeline stage calling this
    /// should halt the work item with a retryable error rather than treat
    /// the absence of an embedding as a zero vector.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = cache_key(text);
        if let Some(hit) = self.cache.lock().expect("embedding cache lock poisoned").get(&key) {
            return Ok(hit.clone());
        }
        let vector = self.provider.embed(text)?;
        self.cache
            .lock()
            .expect("embedding cache lock poisoned")
            .put(key, vector.clone());
        Ok(vector)
    }

    /// The provider's declared dimensionality.
    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.lock().expect("embedding cache lock poisoned").len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 if the
/// lengths differ or either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}
