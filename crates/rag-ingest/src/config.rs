//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Backend provider (local or remote)
    #[serde(default)]
    pub backend: BackendProvider,
    /// Concurrency, batching and retry configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Embedding service configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    /// Vector database configuration
    #[serde(default)]
    pub vector_db: VectorDbConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.processing.validate()?;
        if self.embeddings.dimensions == 0 {
            return Err(Error::config("embeddings.dimensions must be at least 1"));
        }
        Ok(())
    }
}

/// How a job's status is derived when some of its batches failed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed batch fails the whole job
    #[default]
    Strict,
    /// The job completes if at least one batch succeeded; failures are still reported
    ToleratePartial,
}

/// Processing configuration: pool capacities, batching, retries and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Documents allowed in the processing state at once
    pub max_concurrent_documents: usize,
    /// Embedding calls in flight across all documents
    pub max_concurrent_embed_calls: usize,
    /// Vector store writes in flight across all documents
    pub max_concurrent_writes: usize,
    /// Chunks per batch
    pub batch_size: usize,
    /// Additional attempts for a batch after a transient failure
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds), doubles on each retry
    pub retry_base_delay_ms: u64,
    /// Timeout for a single embedding call
    pub embed_timeout_secs: u64,
    /// Timeout for a single vector store write (bulk upserts are slow)
    pub write_timeout_secs: u64,
    /// Failure aggregation policy
    pub failure_policy: FailurePolicy,
    /// Terminal jobs older than this are removed by the sweep
    pub job_ttl_secs: u64,
    /// How often the background sweeper runs
    pub sweep_interval_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_documents: 5,
            max_concurrent_embed_calls: 10,
            max_concurrent_writes: 8,
            batch_size: 50,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            embed_timeout_secs: 60,
            write_timeout_secs: 120,
            failure_policy: FailurePolicy::Strict,
            job_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl ProcessingConfig {
    /// Validate pool capacities, batch size and the sweep period
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("max_concurrent_documents", self.max_concurrent_documents as u64),
            ("max_concurrent_embed_calls", self.max_concurrent_embed_calls as u64),
            ("max_concurrent_writes", self.max_concurrent_writes as u64),
            ("batch_size", self.batch_size as u64),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::config(format!("processing.{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Embedding service configuration (Ollama)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Embedding model name
    pub model: String,
    /// Embedding dimensions (768 for nomic-embed-text)
    pub dimensions: usize,
    /// HTTP client timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
            timeout_secs: 60,
        }
    }
}

/// Vector database configuration (Qdrant)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorDbConfig {
    /// Qdrant REST URL
    pub url: String,
    /// Optional API key sent as the `api-key` header
    pub api_key: Option<String>,
    /// HTTP client timeout in seconds
    pub timeout_secs: u64,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

/// Backend provider selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    /// In-process hash embedder and in-memory vector store
    #[default]
    Local,
    /// Ollama embeddings + Qdrant vector store
    Remote,
}
