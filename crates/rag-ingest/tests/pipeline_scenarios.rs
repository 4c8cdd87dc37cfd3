//! End-to-end pipeline scenarios against scripted providers

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use rag_ingest::processing::{ConcurrencyGovernor, Pool, ProgressEventKind};
use rag_ingest::providers::{
    EmbeddingProvider, LocalVectorStore, SearchFilter, SearchHit, VectorPoint, VectorStoreProvider,
};
use rag_ingest::{
    completion_callback, EmbeddingPipeline, Error, FailurePolicy, IngestRequest, JobStatus,
    ProcessingConfig, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DIMS: usize = 4;

/// Tracks current and peak concurrency of a call site
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Failures scripted per batch, keyed by the batch's first chunk text
#[derive(Default)]
struct Script {
    failures: Mutex<HashMap<String, VecDeque<&'static str>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Script {
    fn fail(&self, first_chunk: &str, messages: &[&'static str]) {
        self.failures
            .lock()
            .insert(first_chunk.to_string(), messages.iter().copied().collect());
    }

    fn next(&self, key: &str) -> Option<&'static str> {
        *self.calls.lock().entry(key.to_string()).or_insert(0) += 1;
        self.failures.lock().get_mut(key).and_then(VecDeque::pop_front)
    }

    fn calls(&self, key: &str) -> u32 {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }
}

struct TestEmbedder {
    delay: Duration,
    gauge: Gauge,
    script: Script,
}

impl TestEmbedder {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            gauge: Gauge::default(),
            script: Script::default(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for TestEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();

        let key = texts.first().cloned().unwrap_or_default();
        if let Some(message) = self.script.next(&key) {
            return Err(Error::embedding(message));
        }
        Ok(texts.iter().map(|_| vec![0.5; DIMS]).collect())
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "test"
    }
}

struct TestStore {
    inner: LocalVectorStore,
    gauge: Gauge,
    script: Script,
    fail_setup: bool,
}

impl TestStore {
    fn new() -> Self {
        Self {
            inner: LocalVectorStore::new(),
            gauge: Gauge::default(),
            script: Script::default(),
            fail_setup: false,
        }
    }
}

#[async_trait]
impl VectorStoreProvider for TestStore {
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()> {
        if self.fail_setup {
            return Err(Error::vector_db("permission denied"));
        }
        self.inner.ensure_collection(collection, dimensions).await
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        self.gauge.enter();
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.gauge.exit();

        let key = points.first().map(|p| p.text.clone()).unwrap_or_default();
        if let Some(message) = self.script.next(&key) {
            return Err(Error::vector_db(message));
        }
        self.inner.upsert(collection, points).await
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<usize> {
        self.inner.delete_by_document(collection, document_id).await
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>> {
        self.inner.search(collection, query_vector, limit, filter).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "test-store"
    }
}

fn fast_config() -> ProcessingConfig {
    ProcessingConfig {
        retry_base_delay_ms: 1,
        ..ProcessingConfig::default()
    }
}

fn chunk(doc: &str, i: usize) -> String {
    format!("{}-c{}", doc, i)
}

fn request(doc: &str, chunks: usize) -> IngestRequest {
    IngestRequest {
        document_id: doc.to_string(),
        project_id: "p1".to_string(),
        filename: format!("{}.txt", doc),
        chunks: (0..chunks).map(|i| chunk(doc, i)).collect(),
    }
}

fn build(
    config: ProcessingConfig,
    embedder: TestEmbedder,
    store: TestStore,
) -> (Arc<EmbeddingPipeline>, Arc<TestEmbedder>, Arc<TestStore>) {
    let embedder = Arc::new(embedder);
    let store = Arc::new(store);
    let pipeline = EmbeddingPipeline::new(config, embedder.clone(), store.clone()).unwrap();
    (Arc::new(pipeline), embedder, store)
}

#[tokio::test]
async fn test_scenario_a_three_batches_complete() {
    let (pipeline, _, store) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        TestStore::new(),
    );
    let mut events = pipeline.subscribe();

    let job_id = pipeline.submit(request("doc", 120), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_batches, 3);
    assert_eq!(job.completed_batches, 3);
    assert_eq!(job.progress, 100);
    assert!(job.failed_batch_indices.is_empty());
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let points = store.inner.document_points("project_p1", "doc");
    assert_eq!(points.len(), 120);
    for (i, point) in points.iter().enumerate() {
        assert_eq!(point.chunk_id, i);
        assert_eq!(point.text, chunk("doc", i));
        assert_eq!(point.document_name, "doc.txt");
    }

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProgressEventKind::BatchSucceeded { completed_batches, .. } = event.kind {
            seen.push(completed_batches);
        }
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_b_embed_pool_bounds_all_documents() {
    let config = ProcessingConfig {
        max_concurrent_embed_calls: 10,
        ..fast_config()
    };
    let (pipeline, embedder, store) = build(
        config,
        TestEmbedder::new(Duration::from_millis(20)),
        TestStore::new(),
    );

    let job_ids: Vec<_> = (0..5)
        .map(|d| pipeline.submit(request(&format!("doc{}", d), 200), None).unwrap())
        .collect();
    for job_id in job_ids {
        let job = pipeline.wait(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_batches, 4);
    }

    assert!(embedder.gauge.peak() <= 10, "peak {}", embedder.gauge.peak());
    assert!(embedder.gauge.peak() >= 2);
    assert!(store.gauge.peak() <= 8);

    let stats = pipeline.get_queue_stats();
    assert!(stats.pools.embeddings.peak <= 10);
    assert!(stats.pools.documents.peak <= 5);
    assert!(stats.pools.writes.peak <= 8);
    assert_eq!(stats.jobs.completed_count, 5);
    assert_eq!(store.inner.len("project_p1"), 1000);
}

#[tokio::test]
async fn test_scenario_c_transient_embed_failures_retry() {
    let embedder = TestEmbedder::new(Duration::from_millis(1));
    embedder
        .script
        .fail(&chunk("doc", 50), &["connection timeout", "connection timeout"]);
    let (pipeline, embedder, store) = build(fast_config(), embedder, TestStore::new());

    let job_id = pipeline.submit(request("doc", 120), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_batches, 3);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.batch_retries.get(&1), Some(&2));
    assert_eq!(job.batch_retries.get(&0), None);
    assert_eq!(embedder.script.calls(&chunk("doc", 50)), 3);
    assert_eq!(store.inner.len("project_p1"), 120);
}

#[tokio::test]
async fn test_scenario_d_fatal_write_fails_job() {
    let store = TestStore::new();
    store.script.fail(
        &chunk("doc", 100),
        &["payload validation failed: chunk_id must be an integer"],
    );
    let (pipeline, _, store) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        store,
    );

    let job_id = pipeline.submit(request("doc", 120), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_batch_indices.iter().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(job.completed_batches, 2);
    assert_eq!(job.progress, 66);
    assert_eq!(job.retry_count, 0);
    assert_eq!(store.script.calls(&chunk("doc", 100)), 1);

    let message = job.error_message.unwrap();
    assert!(message.starts_with("1 of 3 batches failed"), "{}", message);
    assert!(message.contains("payload validation failed"));

    // siblings were still written
    assert_eq!(store.inner.len("project_p1"), 100);
}

#[tokio::test]
async fn test_tolerate_partial_completes_with_failures() {
    let store = TestStore::new();
    store.script.fail(&chunk("doc", 100), &["payload validation failed"]);
    let config = ProcessingConfig {
        failure_policy: FailurePolicy::ToleratePartial,
        ..fast_config()
    };
    let (pipeline, _, _) = build(config, TestEmbedder::new(Duration::from_millis(1)), store);

    let job_id = pipeline.submit(request("doc", 120), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.failed_batch_indices.contains(&2));
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn test_exhausted_retries_fail_batch() {
    let embedder = TestEmbedder::new(Duration::from_millis(1));
    embedder.script.fail(&chunk("doc", 0), &["503 service unavailable"; 8]);
    let config = ProcessingConfig {
        max_retries: 2,
        ..fast_config()
    };
    let (pipeline, embedder, _) = build(config, embedder, TestStore::new());

    let job_id = pipeline.submit(request("doc", 10), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.batch_retries.get(&0), Some(&2));
    assert_eq!(embedder.script.calls(&chunk("doc", 0)), 3);
}

#[tokio::test]
async fn test_collection_setup_failure_fails_every_batch() {
    let mut store = TestStore::new();
    store.fail_setup = true;
    let (pipeline, embedder, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        store,
    );

    let job_id = pipeline.submit(request("doc", 120), None).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_batch_indices.len(), 3);
    assert!(job.error_message.unwrap().contains("collection setup failed"));
    assert_eq!(embedder.gauge.peak(), 0);
}

#[tokio::test]
async fn test_callback_runs_once_with_final_state() {
    let (pipeline, _, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        TestStore::new(),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let on_complete = {
        let calls = Arc::clone(&calls);
        completion_callback(move |outcome| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
            Ok(())
        })
    };

    let job_id = pipeline.submit(request("doc", 75), Some(on_complete)).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.job.job_id, job_id);
    assert!(outcome.is_success());
    assert_eq!(outcome.job.completed_batches, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_callback_does_not_change_status() {
    let (pipeline, _, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        TestStore::new(),
    );
    let on_complete = completion_callback(|_| async { Err(Error::internal("notify failed")) });

    let job_id = pipeline.submit(request("doc", 5), Some(on_complete)).unwrap();
    let job = pipeline.wait(job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(pipeline.get_status(job_id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_document_pool_limits_processing_jobs() {
    let config = ProcessingConfig {
        max_concurrent_documents: 1,
        ..fast_config()
    };
    let (pipeline, _, _) = build(config, TestEmbedder::new(Duration::from_millis(50)), TestStore::new());

    let first = pipeline.submit(request("a", 10), None).unwrap();
    let second = pipeline.submit(request("b", 10), None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = pipeline.get_queue_stats();
    assert_eq!(stats.jobs.processing_count, 1);
    assert_eq!(stats.jobs.pending_count, 1);
    assert_eq!(stats.jobs.in_flight.len(), 2);
    assert_eq!(stats.active_tasks, 2);

    pipeline.wait(first).await.unwrap();
    pipeline.wait(second).await.unwrap();
    assert_eq!(pipeline.get_queue_stats().pools.documents.peak, 1);
}

#[tokio::test]
async fn test_cleanup_removes_finished_jobs() {
    let config = ProcessingConfig {
        job_ttl_secs: 0,
        ..fast_config()
    };
    let (pipeline, _, _) = build(config, TestEmbedder::new(Duration::from_millis(1)), TestStore::new());

    let job_id = pipeline.submit(request("doc", 3), None).unwrap();
    pipeline.wait(job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(pipeline.cleanup_old_jobs(), 1);
    assert!(pipeline.get_status(job_id).is_none());
    assert!(pipeline.get_status_by_document("doc").is_none());
}

#[tokio::test]
async fn test_shutdown_abandons_in_flight_jobs() {
    let (pipeline, _, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_secs(30)),
        TestStore::new(),
    );
    pipeline.spawn_sweeper();

    let job_id = pipeline.submit(request("slow", 10), None).unwrap();
    let waiter = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.wait(job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    pipeline.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::ShuttingDown)));

    let job = pipeline.get_status(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.abandoned);
    assert_eq!(pipeline.get_queue_stats().active_tasks, 0);

    let err = pipeline.submit(request("late", 1), None).unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

#[tokio::test]
async fn test_pipelines_can_share_a_governor() {
    let governor = Arc::new(ConcurrencyGovernor::new(2, 1, 1));
    let embedder = Arc::new(TestEmbedder::new(Duration::from_millis(5)));
    let store = Arc::new(TestStore::new());

    let a = EmbeddingPipeline::with_governor(
        fast_config(),
        Arc::clone(&governor),
        embedder.clone(),
        store.clone(),
    )
    .unwrap();
    let b = EmbeddingPipeline::with_governor(
        fast_config(),
        Arc::clone(&governor),
        embedder.clone(),
        store.clone(),
    )
    .unwrap();

    let ja = a.submit(request("a", 100), None).unwrap();
    let jb = b.submit(request("b", 100), None).unwrap();
    a.wait(ja).await.unwrap();
    b.wait(jb).await.unwrap();

    assert_eq!(embedder.gauge.peak(), 1);
    assert_eq!(governor.snapshot().embeddings.peak, 1);
}

#[tokio::test]
async fn test_shutdown_leaves_shared_governor_open() {
    let governor = Arc::new(ConcurrencyGovernor::new(2, 1, 1));
    let embedder = Arc::new(TestEmbedder::new(Duration::from_millis(1)));
    let store = Arc::new(TestStore::new());

    let a = EmbeddingPipeline::with_governor(
        fast_config(),
        Arc::clone(&governor),
        embedder.clone(),
        store.clone(),
    )
    .unwrap();
    let b = EmbeddingPipeline::with_governor(
        fast_config(),
        Arc::clone(&governor),
        embedder.clone(),
        store.clone(),
    )
    .unwrap();

    a.shutdown().await;
    assert!(matches!(a.submit(request("a", 1), None), Err(Error::ShuttingDown)));

    let job_id = b.submit(request("b", 10), None).unwrap();
    let job = b.wait(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(governor.acquire(Pool::Documents).await.is_ok());

    b.shutdown().await;
    assert!(governor.acquire(Pool::Documents).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_closes_own_governor() {
    let (pipeline, _, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_millis(1)),
        TestStore::new(),
    );
    pipeline.shutdown().await;

    let err = pipeline.governor().acquire(Pool::Documents).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed("documents")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submits_racing_shutdown_are_all_accounted_for() {
    let (pipeline, _, _) = build(
        fast_config(),
        TestEmbedder::new(Duration::from_secs(30)),
        TestStore::new(),
    );

    let submitters: Vec<_> = (0..8)
        .map(|worker| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let mut accepted = Vec::new();
                for n in 0..25 {
                    match pipeline.submit(request(&format!("doc-{}-{}", worker, n), 2), None) {
                        Ok(job_id) => accepted.push(job_id),
                        Err(Error::ShuttingDown) => break,
                        Err(e) => panic!("unexpected submit error: {}", e),
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(2)).await;
    pipeline.shutdown().await;

    for submitter in submitters {
        for job_id in submitter.await.unwrap() {
            let result = tokio::time::timeout(Duration::from_secs(5), pipeline.wait(job_id))
                .await
                .expect("accepted job left without a task");
            assert!(matches!(result, Err(Error::ShuttingDown)));
            assert!(pipeline.get_status(job_id).unwrap().abandoned);
        }
    }
    assert_eq!(pipeline.get_queue_stats().active_tasks, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn embed_calls_never_exceed_capacity(
        jobs in 1usize..5,
        batches_per_job in 1usize..5,
        capacity in 1usize..4,
    ) {
        let config = ProcessingConfig {
            max_concurrent_embed_calls: capacity,
            batch_size: 2,
            ..fast_config()
        };
        let (pipeline, embedder, store) = build(
            config,
            TestEmbedder::new(Duration::from_millis(2)),
            TestStore::new(),
        );

        let statuses = tokio_test::block_on(async {
            let ids: Vec<_> = (0..jobs)
                .map(|j| pipeline.submit(request(&format!("d{}", j), batches_per_job * 2), None).unwrap())
                .collect();
            let mut statuses = Vec::new();
            for id in ids {
                statuses.push(pipeline.wait(id).await.unwrap().status);
            }
            statuses
        });

        prop_assert!(statuses.iter().all(|s| *s == JobStatus::Completed));
        prop_assert!(embedder.gauge.peak() <= capacity);
        prop_assert_eq!(store.inner.len("project_p1"), jobs * batches_per_job * 2);
    }
}
