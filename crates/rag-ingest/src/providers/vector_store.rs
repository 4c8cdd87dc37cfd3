//! Vector store provider trait for storing and searching embeddings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::Result;

/// A single vector written by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    /// Fresh id per write; retries insert rather than overwrite
    pub id: Uuid,
    /// Embedding vector
    pub vector: Vec<f32>,
    /// Chunk text
    pub text: String,
    /// Owning document
    pub document_id: String,
    /// Human-readable document name (filename)
    pub document_name: String,
    /// Position of the chunk in the original document
    pub chunk_id: usize,
}

/// Search result from vector store
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matched point (vector omitted by remote stores)
    pub point: VectorPoint,
    /// Similarity score (higher is more similar)
    pub score: f32,
}

/// Payload filter applied to searches
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict results to these documents
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilter {
    /// Filter matching only the given documents
    pub fn documents(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, document_id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|id| id == document_id),
            None => true,
        }
    }
}

/// Trait for vector storage and similarity search
///
/// The ingestion pipeline calls `ensure_collection` once per document and
/// `upsert` once per batch. Search and deletion serve the surrounding query
/// and document-removal paths.
///
/// Implementations:
/// - `LocalVectorStore`: In-memory store with cosine search
/// - `QdrantStore`: Qdrant REST API
#[async_trait]
pub trait VectorStoreProvider: Send + Sync {
    /// Create the collection if it does not exist yet
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()>;

    /// Insert a batch of points
    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()>;

    /// Delete all points for a document, returning how many were removed
    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<usize>;

    /// Search for the closest points
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
