//! Embedding pipeline: accepts documents and runs one job task per document

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::config::{FailurePolicy, ProcessingConfig};
use crate::error::{Error, Result};
use crate::providers::{EmbeddingProvider, VectorStoreProvider};

use super::batcher::{self, Batch};
use super::executor::{with_timeout, BatchContext, BatchExecutor};
use super::governor::{ConcurrencyGovernor, GovernorStats, Pool};
use super::job_registry::{JobProgress, JobRegistry, JobStatus, ProgressEvent, RegistryStats};

/// Job identifier returned by `submit`
pub type JobId = Uuid;

/// A document to embed and store
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub document_id: String,
    pub project_id: String,
    pub filename: String,
    /// Pre-chunked text, in document order
    pub chunks: Vec<String>,
}

/// Final state of a job, handed to the completion callback
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: JobProgress,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn is_success(&self) -> bool {
        self.job.status == JobStatus::Completed
    }
}

/// Invoked once per job after it reaches a terminal state
pub type CompletionCallback = Box<dyn FnOnce(JobOutcome) -> BoxFuture<'static, Result<()>> + Send>;

/// Box an async closure as a `CompletionCallback`
pub fn completion_callback<F, Fut>(f: F) -> CompletionCallback
where
    F: FnOnce(JobOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |outcome| f(outcome).boxed())
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub jobs: RegistryStats,
    /// Job tasks that have not finished yet
    pub active_tasks: usize,
    pub pools: GovernorStats,
}

/// Vector store collection holding a project's chunks
pub fn collection_name(project_id: &str) -> String {
    format!("project_{}", project_id)
}

/// Document ingestion pipeline
///
/// Each submitted document becomes a job task. The task waits for a
/// document slot, creates the project collection if needed, then runs all
/// of its batches at once; the shared embedding and write pools decide how
/// many actually make progress.
pub struct EmbeddingPipeline {
    config: ProcessingConfig,
    governor: Arc<ConcurrencyGovernor>,
    registry: Arc<JobRegistry>,
    executor: Arc<BatchExecutor>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStoreProvider>,
    tasks: Mutex<JoinSet<()>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    /// Only a pipeline that created its governor closes it on shutdown
    owns_governor: bool,
}

impl EmbeddingPipeline {
    /// Create a pipeline with its own governor sized from `config`
    pub fn new(
        config: ProcessingConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let governor = Arc::new(ConcurrencyGovernor::from_config(&config));
        Self::build(config, governor, true, embedder, store)
    }

    /// Create a pipeline that shares an existing governor
    ///
    /// Shutting this pipeline down leaves the governor open for its other users.
    pub fn with_governor(
        config: ProcessingConfig,
        governor: Arc<ConcurrencyGovernor>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(config, governor, false, embedder, store)
    }

    fn build(
        config: ProcessingConfig,
        governor: Arc<ConcurrencyGovernor>,
        owns_governor: bool,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStoreProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(JobRegistry::new());
        let executor = Arc::new(BatchExecutor::new(
            &config,
            Arc::clone(&governor),
            Arc::clone(&embedder),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));

        tracing::info!(
            "Embedding pipeline ready: embedder={}, store={}, batch_size={}, policy={:?}",
            embedder.name(),
            store.name(),
            config.batch_size,
            config.failure_policy
        );

        Ok(Self {
            config,
            governor,
            registry,
            executor,
            embedder,
            store,
            tasks: Mutex::new(JoinSet::new()),
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            owns_governor,
        })
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    /// Submit a document; returns as soon as the job is registered
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        request: IngestRequest,
        on_complete: Option<CompletionCallback>,
    ) -> Result<JobId> {
        // Held until the task is spawned so shutdown cannot take the set in between
        let mut tasks = self.tasks.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let IngestRequest {
            document_id,
            project_id,
            filename,
            chunks,
        } = request;

        let chunk_count = chunks.len();
        let total_batches = batcher::batch_count(chunk_count, self.config.batch_size);
        let job_id = self
            .registry
            .register(&document_id, &project_id, &filename, total_batches);

        let batches = match batcher::split(job_id, chunks, self.config.batch_size) {
            Ok(batches) => batches,
            Err(e) => {
                self.registry.fail(job_id, &e.to_string());
                return Err(e);
            }
        };

        tracing::info!(
            "[{}] Queued job {} for document {}: {} chunks in {} batches",
            filename,
            job_id,
            document_id,
            chunk_count,
            total_batches
        );

        let task = JobTask {
            ctx: BatchContext {
                job_id,
                document_id,
                filename,
                collection: collection_name(&project_id),
            },
            batches,
            governor: Arc::clone(&self.governor),
            registry: Arc::clone(&self.registry),
            executor: Arc::clone(&self.executor),
            dimensions: self.embedder.dimensions(),
            store: Arc::clone(&self.store),
            policy: self.config.failure_policy,
        };

        reap_finished(&mut tasks);
        tasks.spawn(task.run(on_complete));

        Ok(job_id)
    }

    /// Get job progress
    pub fn get_status(&self, job_id: JobId) -> Option<JobProgress> {
        self.registry.get(job_id)
    }

    /// Latest job for a document
    pub fn get_status_by_document(&self, document_id: &str) -> Option<JobProgress> {
        self.registry.get_by_document(document_id)
    }

    /// Job counts, in-flight jobs and pool occupancy
    pub fn get_queue_stats(&self) -> QueueStats {
        let active_tasks = {
            let mut tasks = self.tasks.lock();
            reap_finished(&mut tasks);
            tasks.len()
        };
        QueueStats {
            jobs: self.registry.list_stats(),
            active_tasks,
            pools: self.governor.snapshot(),
        }
    }

    /// Wait for a job to finish
    ///
    /// Returns `Error::ShuttingDown` if the job was cancelled by `shutdown`.
    pub async fn wait(&self, job_id: JobId) -> Result<JobProgress> {
        let job = self.registry.wait_for_terminal(job_id).await?;
        if job.abandoned {
            return Err(Error::ShuttingDown);
        }
        Ok(job)
    }

    /// Subscribe to live progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.registry.subscribe()
    }

    /// Remove terminal jobs older than the configured TTL
    pub fn cleanup_old_jobs(&self) -> usize {
        self.registry.sweep(self.config.job_ttl())
    }

    /// Run `cleanup_old_jobs` periodically until shutdown
    pub fn spawn_sweeper(&self) {
        let registry = Arc::clone(&self.registry);
        let ttl = self.config.job_ttl();
        let period = self.config.sweep_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep(ttl);
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop accepting work and cancel every outstanding job
    ///
    /// Cancelled jobs keep their non-terminal status and are flagged as
    /// abandoned. Batches already written stay in the store, so those
    /// documents must be re-ingested in full.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down embedding pipeline");

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Job task panicked: {}", e);
                }
            }
        }

        if self.owns_governor {
            self.governor.close();
        }

        let mut abandoned = 0;
        for job in self.registry.list_jobs() {
            if !job.status.is_terminal() {
                self.registry.abandon(job.job_id);
                tracing::warn!(
                    "[{}] Job {} abandoned during shutdown at {}%",
                    job.filename,
                    job.job_id,
                    job.progress
                );
                abandoned += 1;
            }
        }

        tracing::info!("Embedding pipeline stopped ({} jobs abandoned)", abandoned);
    }
}

/// Drop handles of tasks that already finished
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().now_or_never().flatten() {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("Job task panicked: {}", e);
            }
        }
    }
}

/// Everything one job task needs, moved into the spawned future
struct JobTask {
    ctx: BatchContext,
    batches: Vec<Batch>,
    governor: Arc<ConcurrencyGovernor>,
    registry: Arc<JobRegistry>,
    executor: Arc<BatchExecutor>,
    store: Arc<dyn VectorStoreProvider>,
    dimensions: usize,
    policy: FailurePolicy,
}

impl JobTask {
    async fn run(self, on_complete: Option<CompletionCallback>) {
        let job_id = self.ctx.job_id;
        let filename = self.ctx.filename.clone();

        let Some(job) = self.process().await else {
            tracing::warn!("[{}] Job {} disappeared from the registry", filename, job_id);
            return;
        };

        match job.status {
            JobStatus::Completed => tracing::info!(
                "[{}] Job {} completed: {}/{} batches in {:.1}s ({} retries)",
                filename,
                job_id,
                job.completed_batches,
                job.total_batches,
                job.duration_secs().unwrap_or_default(),
                job.retry_count
            ),
            _ => tracing::error!(
                "[{}] Job {} failed: {}",
                filename,
                job_id,
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
        }

        if let Some(callback) = on_complete {
            if let Err(e) = callback(JobOutcome { job }).await {
                tracing::error!("[{}] Completion callback for job {} failed: {}", filename, job_id, e);
            }
        }
    }

    async fn process(&self) -> Option<JobProgress> {
        let job_id = self.ctx.job_id;

        // Held until every batch has resolved
        let _slot = match self.governor.acquire(Pool::Documents).await {
            Ok(permit) => permit,
            Err(e) => return self.registry.fail(job_id, &e.to_string()),
        };
        self.registry.mark_processing(job_id);

        if self.batches.is_empty() {
            tracing::info!("[{}] No chunks to embed", self.ctx.filename);
            return self.registry.finalize(job_id, self.policy);
        }

        tracing::info!(
            "[{}] Processing job {}: {} batches",
            self.ctx.filename,
            job_id,
            self.batches.len()
        );
        let start = Instant::now();

        if let Err(e) = self.prepare_collection().await {
            tracing::error!(
                "[{}] Could not prepare collection {}: {}",
                self.ctx.filename,
                self.ctx.collection,
                e
            );
            return self
                .registry
                .fail(job_id, &format!("collection setup failed: {}", e));
        }

        let batch_futures = self.batches.iter().map(|batch| async move {
            let outcome = self.executor.execute(&self.ctx, batch).await;
            self.registry
                .record_batch_result(job_id, batch.batch_index, &outcome);
        });
        join_all(batch_futures).await;

        tracing::debug!(
            "[{}] All {} batches resolved in {:.1}s",
            self.ctx.filename,
            self.batches.len(),
            start.elapsed().as_secs_f64()
        );

        self.registry.finalize(job_id, self.policy)
    }

    /// Create the project collection, under a write slot
    async fn prepare_collection(&self) -> Result<()> {
        let _permit = self.governor.acquire(Pool::Writes).await?;
        with_timeout(
            "collection setup",
            self.executor.write_timeout(),
            self.store.ensure_collection(&self.ctx.collection, self.dimensions),
        )
        .await
    }
}
