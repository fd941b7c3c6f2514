//! HNSW vector index over concept and mention embeddings
//!
//! Wraps usearch behind string keys (concept/mention ids) so callers never
//! see usearch's internal u64 handles. Cosine metric only - the matching
//! pipeline never needs another distance function. Built without the
//! `vector-search` feature (no usearch, no C++ toolchain required), the
//! index falls back to a brute-force linear scan using the same cosine
//! metric, so `Engine::new` stays functional at smaller scale.

use std::collections::HashMap;
use std::sync::RwLock;

#[cfg(feature = "vector-search")]
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embedding::cosine_similarity;

/// HNSW connectivity parameter (higher = better recall, more memory).
pub const DEFAULT_CONNECTIVITY: usize = 16;
/// HNSW expansion factor for index building.
pub const DEFAULT_EXPANSION_ADD: usize = 128;
/// HNSW expansion factor for search (higher = better recall, slower).
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Errors raised by the vector index.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("failed to add vector: {0}")]
    Add(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("invalid dimensions: expected {expected}, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },
}

/// Configuration for a [`VectorIndex`].
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    /// Build a config for the given embedding dimension, using the index's
    /// default HNSW tuning parameters.
    pub fn for_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

/// A (concept_id or mention_id, similarity score) search hit, highest score first.
pub type SearchHit = (String, f32);

#[cfg(feature = "vector-search")]
struct UsearchBackend {
    index: Index,
}

#[cfg(feature = "vector-search")]
impl UsearchBackend {
    fn new(config: &VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| VectorSearchError::Unavailable(e.to_string()))?;
        Ok(Self { index })
    }
}

/// A thread-safe HNSW index over string-keyed embedding vectors, cosine metric.
pub struct VectorIndex {
    #[cfg(feature = "vector-search")]
    backend: UsearchBackend,
    #[cfg(feature = "vector-search")]
    key_to_id: RwLock<HashMap<String, u64>>,
    #[cfg(feature = "vector-search")]
    id_to_key: RwLock<HashMap<u64, String>>,
    #[cfg(feature = "vector-search")]
    next_id: RwLock<u64>,
    #[cfg(not(feature = "vector-search"))]
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    config: VectorIndexConfig,
}

impl VectorIndex {
    /// Create a new index with the given configuration.
    #[cfg(feature = "vector-search")]
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let backend = UsearchBackend::new(&config)?;
        Ok(Self {
            backend,
            key_to_id: RwLock::new(HashMap::new()),
            id_to_key: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
            config,
        })
    }

    /// Create a new brute-force index with the given configuration. Always
    /// available, regardless of the `vector-search` feature: the HNSW build
    /// can opt out of it and still keep a working, if slower, index.
    #[cfg(not(feature = "vector-search"))]
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        Ok(Self { vectors: RwLock::new(HashMap::new()), config })
    }

    /// Declared embedding dimension for this index.
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Number of vectors currently indexed.
    #[cfg(feature = "vector-search")]
    pub fn len(&self) -> usize {
        self.backend.index.size()
    }

    #[cfg(not(feature = "vector-search"))]
    pub fn len(&self) -> usize {
        self.vectors.read().expect("index lock poisoned").len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present in the index.
    #[cfg(feature = "vector-search")]
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.read().expect("index lock poisoned").contains_key(key)
    }

    #[cfg(not(feature = "vector-search"))]
    pub fn contains(&self, key: &str) -> bool {
        self.vectors.read().expect("index lock poisoned").contains_key(key)
    }

    /// Insert or replace the vector for `key`.
    #[cfg(feature = "vector-search")]
    pub fn upsert(&self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }

        let mut key_to_id = self.key_to_id.write().expect("index lock poisoned");
        if let Some(&existing_id) = key_to_id.get(key) {
            self.backend
                .index
                .remove(existing_id)
                .map_err(|e| VectorSearchError::Add(e.to_string()))?;
            self.reserve_if_needed()?;
            self.backend
                .index
                .add(existing_id, vector)
                .map_err(|e| VectorSearchError::Add(e.to_string()))?;
            return Ok(());
        }

        self.reserve_if_needed()?;
        let mut next_id = self.next_id.write().expect("index lock poisoned");
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.backend
            .index
            .add(id, vector)
            .map_err(|e| VectorSearchError::Add(e.to_string()))?;

        key_to_id.insert(key.to_string(), id);
        self.id_to_key.write().expect("index lock poisoned").insert(id, key.to_string());
        Ok(())
    }

    #[cfg(not(feature = "vector-search"))]
    pub fn upsert(&self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        self.vectors.write().expect("index lock poisoned").insert(key.to_string(), vector.to_vec());
        Ok(())
    }

    #[cfg(feature = "vector-search")]
    fn reserve_if_needed(&self) -> Result<(), VectorSearchError> {
        let capacity = self.backend.index.capacity();
        let size = self.backend.index.size();
        if size >= capacity {
            let new_capacity = std::cmp::max(capacity * 2, 16);
            self.backend
                .index
                .reserve(new_capacity)
                .map_err(|e| VectorSearchError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove `key` from the index. Returns whether it was present.
    #[cfg(feature = "vector-search")]
    pub fn remove(&self, key: &str) -> Result<bool, VectorSearchError> {
        let mut key_to_id = self.key_to_id.write().expect("index lock poisoned");
        if let Some(id) = key_to_id.remove(key) {
            self.id_to_key.write().expect("index lock poisoned").remove(&id);
            self.backend
                .index
                .remove(id)
                .map_err(|e| VectorSearchError::Add(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    #[cfg(not(feature = "vector-search"))]
    pub fn remove(&self, key: &str) -> Result<bool, VectorSearchError> {
        Ok(self.vectors.write().expect("index lock poisoned").remove(key).is_some())
    }

    /// Return up to `top_k` nearest neighbours to `query`, highest
    /// similarity first.
    #[cfg(feature = "vector-search")]
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let results = self
            .backend
            .index
            .search(query, top_k)
            .map_err(|e| VectorSearchError::Search(e.to_string()))?;

        let id_to_key = self.id_to_key.read().expect("index lock poisoned");
        let mut hits = Vec::with_capacity(results.keys.len());
        for (id, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(key) = id_to_key.get(id) {
                hits.push((key.clone(), 1.0 - distance));
            }
        }
        Ok(hits)
    }

    /// Linear scan over every stored vector, ranked by cosine similarity.
    /// O(n) in the number of indexed vectors - correct but not meant for the
    /// scale the HNSW backend handles.
    #[cfg(not(feature = "vector-search"))]
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: query.len(),
            });
        }
        let vectors = self.vectors.read().expect("index lock poisoned");
        let mut hits: Vec<SearchHit> =
            vectors.iter().map(|(key, vector)| (key.clone(), cosine_similarity(query, vector))).collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}
