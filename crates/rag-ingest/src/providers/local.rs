//! Local provider implementations
//!
//! An in-memory vector store and a deterministic feature-hashing embedder.
//! Neither needs a network service, so they back the `local` backend and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Error, Result};

use super::embedding::EmbeddingProvider;
use super::vector_store::{SearchFilter, SearchHit, VectorPoint, VectorStoreProvider};

struct Collection {
    dimensions: usize,
    points: Vec<VectorPoint>,
}

/// In-memory vector store with brute-force cosine search
#[derive(Default)]
pub struct LocalVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl LocalVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.points.len())
    }

    /// Points stored for a document, ordered by `chunk_id`
    pub fn document_points(&self, collection: &str, document_id: &str) -> Vec<VectorPoint> {
        let mut points: Vec<VectorPoint> = self
            .collections
            .read()
            .get(collection)
            .map(|c| {
                c.points
                    .iter()
                    .filter(|p| p.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        points.sort_by_key(|p| p.chunk_id);
        points
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStoreProvider for LocalVectorStore {
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()> {
        let mut collections = self.collections.write();
        match collections.get(collection) {
            Some(existing) if existing.dimensions != dimensions => Err(Error::vector_db(format!(
                "collection '{}' exists with dimension {}, requested {}",
                collection, existing.dimensions, dimensions
            ))),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    collection.to_string(),
                    Collection {
                        dimensions,
                        points: Vec::new(),
                    },
                );
                tracing::info!("Created collection: {}", collection);
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        let mut collections = self.collections.write();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| Error::vector_db(format!("collection '{}' does not exist", collection)))?;

        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.dimensions) {
            return Err(Error::vector_db(format!(
                "invalid vector dimension for chunk {}: expected {}, got {}",
                bad.chunk_id,
                target.dimensions,
                bad.vector.len()
            )));
        }

        target.points.extend_from_slice(points);
        Ok(())
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<usize> {
        let mut collections = self.collections.write();
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.points.len();
        target.points.retain(|p| p.document_id != document_id);
        Ok(before - target.points.len())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>> {
        let collections = self.collections.read();
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = target
            .points
            .iter()
            .filter(|p| filter.map_or(true, |f| f.matches(&p.document_id)))
            .map(|p| SearchHit {
                point: p.clone(),
                score: cosine_similarity(query_vector, &p.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "local-memory"
    }
}

/// Deterministic embedder using feature hashing over lowercase tokens
///
/// Texts sharing words land close together, which is enough for smoke
/// tests of search without a model server.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if token.is_empty() {
                continue;
            }
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "hash"
    }
}
