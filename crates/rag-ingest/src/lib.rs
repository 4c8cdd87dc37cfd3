//! rag-ingest: Concurrent document ingestion for RAG
//!
//! Takes pre-chunked documents, embeds them in batches and writes the vectors
//! to a per-project collection. Embedding calls and vector writes are bounded
//! by pools shared across every document in flight, transient failures are
//! retried with backoff, and each document's progress is tracked as a job.

pub mod config;
pub mod error;
pub mod processing;
pub mod providers;

pub use config::{BackendProvider, FailurePolicy, PipelineConfig, ProcessingConfig};
pub use error::{Error, Result};
pub use processing::{
    completion_callback, CompletionCallback, EmbeddingPipeline, IngestRequest, JobId, JobOutcome,
    JobProgress, JobStatus, ProgressEvent, QueueStats,
};
