//! Concurrent document processing: batching, resource pools, retries and job tracking

pub mod batcher;
mod executor;
mod governor;
mod job_registry;
mod pipeline;
pub mod retry;

pub use batcher::Batch;
pub use executor::{BatchContext, BatchExecutor, BatchOutcome};
pub use governor::{ConcurrencyGovernor, GovernorStats, Pool, PoolPermit, PoolStats};
pub use job_registry::{
    InFlightJob, JobProgress, JobRegistry, JobStatus, ProgressEvent, ProgressEventKind,
    RegistryStats,
};
pub use pipeline::{
    collection_name, completion_callback, CompletionCallback, EmbeddingPipeline, IngestRequest,
    JobId, JobOutcome, QueueStats,
};
pub use retry::{is_retryable, RetryPolicy};
