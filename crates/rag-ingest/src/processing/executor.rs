//! Batch executor: embed and write one batch, with retries

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::providers::{EmbeddingProvider, VectorPoint, VectorStoreProvider};

use super::batcher::Batch;
use super::governor::{ConcurrencyGovernor, Pool};
use super::job_registry::JobRegistry;
use super::retry::{is_retryable, RetryPolicy};

/// Result of executing a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Embedded and written
    Succeeded { attempts: u32, retries: u32 },
    /// Gave up, either on a fatal error or after exhausting retries
    Failed {
        retryable: bool,
        reason: String,
        attempts: u32,
        retries: u32,
    },
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            BatchOutcome::Succeeded { attempts, .. } | BatchOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Per-document information every batch of a job needs
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub job_id: Uuid,
    pub document_id: String,
    /// Stored as `document_name` on every point
    pub filename: String,
    pub collection: String,
}

/// Run `future` under a deadline, mapping expiry to `Error::Timeout`
pub(crate) async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, limit.as_secs())),
    }
}

/// Executes batches against the embedding provider and vector store
///
/// Every network call goes through the shared governor, so the embedding and
/// write limits hold across all jobs, not just within one.
pub struct BatchExecutor {
    governor: Arc<ConcurrencyGovernor>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStoreProvider>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    embed_timeout: Duration,
    write_timeout: Duration,
}

impl BatchExecutor {
    pub fn new(
        config: &ProcessingConfig,
        governor: Arc<ConcurrencyGovernor>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreProvider>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            governor,
            embedder,
            store,
            registry,
            retry: RetryPolicy::from_config(config),
            embed_timeout: config.embed_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    /// Override the per-call deadlines
    pub fn with_timeouts(mut self, embed_timeout: Duration, write_timeout: Duration) -> Self {
        self.embed_timeout = embed_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Execute a batch, retrying transient failures
    ///
    /// Never returns an error: the outcome says whether the batch landed.
    pub async fn execute(&self, ctx: &BatchContext, batch: &Batch) -> BatchOutcome {
        let mut retries = 0u32;

        loop {
            let attempts = retries + 1;
            let error = match self.attempt(ctx, batch).await {
                Ok(()) => {
                    tracing::debug!(
                        "[{}] Batch {} stored {} chunks (attempt {})",
                        ctx.filename,
                        batch.batch_index,
                        batch.len(),
                        attempts
                    );
                    return BatchOutcome::Succeeded { attempts, retries };
                }
                Err(e) => e,
            };

            let retryable = is_retryable(&error);
            if retryable && retries < self.retry.max_retries {
                let delay = self.retry.delay_for(retries, batch.batch_index);
                tracing::warn!(
                    "[{}] Job {} batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                    ctx.filename,
                    ctx.job_id,
                    batch.batch_index,
                    attempts,
                    self.retry.max_retries + 1,
                    delay,
                    error
                );
                self.registry.record_retry(ctx.job_id, batch.batch_index);
                tokio::time::sleep(delay).await;
                retries += 1;
                continue;
            }

            if retryable {
                tracing::error!(
                    "[{}] Batch {} failed after {} attempts: {}",
                    ctx.filename,
                    batch.batch_index,
                    attempts,
                    error
                );
            } else {
                tracing::error!(
                    "[{}] Batch {} failed with non-retryable error: {}",
                    ctx.filename,
                    batch.batch_index,
                    error
                );
            }

            return BatchOutcome::Failed {
                retryable,
                reason: error.to_string(),
                attempts,
                retries,
            };
        }
    }

    async fn attempt(&self, ctx: &BatchContext, batch: &Batch) -> Result<()> {
        // Embed permit is held only for the call itself
        let vectors = {
            let _permit = self.governor.acquire(Pool::Embeddings).await?;
            with_timeout(
                "embedding call",
                self.embed_timeout,
                self.embedder.embed_batch(&batch.chunks),
            )
            .await?
        };

        if vectors.len() != batch.len() {
            return Err(Error::embedding(format!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            )));
        }

        let points: Vec<VectorPoint> = batch
            .chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| VectorPoint {
                id: Uuid::new_v4(),
                vector,
                text: text.clone(),
                document_id: ctx.document_id.clone(),
                document_name: ctx.filename.clone(),
                chunk_id: batch.chunk_id(i),
            })
            .collect();

        let _permit = self.governor.acquire(Pool::Writes).await?;
        with_timeout(
            "vector store write",
            self.write_timeout,
            self.store.upsert(&ctx.collection, &points),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::batcher;
    use crate::providers::LocalVectorStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Fails with the scripted messages in order, then succeeds
    struct ScriptedEmbedder {
        failures: Mutex<VecDeque<&'static str>>,
        calls: Mutex<u32>,
        short_by: usize,
        delay: Duration,
    }

    impl ScriptedEmbedder {
        fn new(failures: &[&'static str]) -> Self {
            Self {
                failures: Mutex::new(failures.iter().copied().collect()),
                calls: Mutex::new(0),
                short_by: 0,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            *self.calls.lock() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = self.failures.lock().pop_front() {
                return Err(Error::embedding(message));
            }
            let n = texts.len().saturating_sub(self.short_by);
            Ok(vec![vec![1.0, 0.0]; n])
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Fixture {
        executor: BatchExecutor,
        embedder: Arc<ScriptedEmbedder>,
        store: Arc<LocalVectorStore>,
        registry: Arc<JobRegistry>,
        ctx: BatchContext,
        batch: Batch,
    }

    async fn fixture(embedder: ScriptedEmbedder) -> Fixture {
        let config = ProcessingConfig {
            max_retries: 3,
            retry_base_delay_ms: 1,
            ..ProcessingConfig::default()
        };
        let embedder = Arc::new(embedder);
        let store = Arc::new(LocalVectorStore::new());
        store.ensure_collection("project_p", 2).await.unwrap();
        let registry = Arc::new(JobRegistry::new());
        let job_id = registry.register("doc", "p", "doc.txt", 1);

        let executor = BatchExecutor::new(
            &config,
            Arc::new(ConcurrencyGovernor::new(1, 2, 2)),
            embedder.clone(),
            store.clone(),
            registry.clone(),
        );
        let chunks = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut batches = batcher::split(job_id, chunks, 10).unwrap();

        Fixture {
            executor,
            embedder,
            store,
            registry,
            ctx: BatchContext {
                job_id,
                document_id: "doc".to_string(),
                filename: "doc.txt".to_string(),
                collection: "project_p".to_string(),
            },
            batch: batches.remove(0),
        }
    }

    #[tokio::test]
    async fn test_success_writes_points_with_chunk_ids() {
        let f = fixture(ScriptedEmbedder::new(&[])).await;
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        assert_eq!(outcome, BatchOutcome::Succeeded { attempts: 1, retries: 0 });

        let points = f.store.document_points("project_p", "doc");
        let ids: Vec<usize> = points.iter().map(|p| p.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(points.iter().all(|p| p.document_name == "doc.txt"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(ScriptedEmbedder::new(&["HTTP 429 Too Many Requests", "connection reset"])).await;
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        assert_eq!(outcome, BatchOutcome::Succeeded { attempts: 3, retries: 2 });
        assert_eq!(f.embedder.calls(), 3);

        let job = f.registry.get(f.ctx.job_id).unwrap();
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.batch_retries.get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let f = fixture(ScriptedEmbedder::new(&["payload validation failed"])).await;
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        match outcome {
            BatchOutcome::Failed { retryable, attempts, retries, reason } => {
                assert!(!retryable);
                assert_eq!(attempts, 1);
                assert_eq!(retries, 0);
                assert!(reason.contains("payload validation failed"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(f.embedder.calls(), 1);
        assert_eq!(f.store.len("project_p"), 0);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let f = fixture(ScriptedEmbedder::new(&["service unavailable"; 10])).await;
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        assert!(matches!(
            outcome,
            BatchOutcome::Failed { retryable: true, attempts: 4, retries: 3, .. }
        ));
        assert_eq!(f.embedder.calls(), 4);
    }

    #[tokio::test]
    async fn test_vector_count_mismatch_is_fatal() {
        let mut embedder = ScriptedEmbedder::new(&[]);
        embedder.short_by = 1;
        let f = fixture(embedder).await;
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        assert!(matches!(outcome, BatchOutcome::Failed { retryable: false, attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_slow_embedding_times_out_and_retries() {
        let mut embedder = ScriptedEmbedder::new(&[]);
        embedder.delay = Duration::from_millis(200);
        let mut f = fixture(embedder).await;
        f.executor = f
            .executor
            .with_timeouts(Duration::from_millis(10), Duration::from_secs(5));

        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        match outcome {
            BatchOutcome::Failed { retryable, attempts, reason, .. } => {
                assert!(retryable);
                assert_eq!(attempts, 4);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_to_missing_collection_is_fatal() {
        let mut f = fixture(ScriptedEmbedder::new(&[])).await;
        f.ctx.collection = "project_missing".to_string();
        let outcome = f.executor.execute(&f.ctx, &f.batch).await;
        assert!(matches!(outcome, BatchOutcome::Failed { retryable: false, .. }));
    }
}
