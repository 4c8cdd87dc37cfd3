//! Provider abstractions for embeddings and vector storage
//!
//! Trait-based so the pipeline can switch between the in-process backend
//! and remote services (Ollama, Qdrant).

pub mod embedding;
pub mod vector_store;
pub mod local;
pub mod ollama;
pub mod qdrant;

pub use embedding::EmbeddingProvider;
pub use vector_store::{SearchFilter, SearchHit, VectorPoint, VectorStoreProvider};
pub use local::{HashEmbedder, LocalVectorStore};
pub use ollama::OllamaEmbedder;
pub use qdrant::QdrantStore;
