//! Ingestion runner
//!
//! Run with: cargo run -p rag-ingest -- --project demo notes.txt report.txt

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use rag_ingest::processing::ProgressEventKind;
use rag_ingest::providers::{
    EmbeddingProvider, HashEmbedder, LocalVectorStore, OllamaEmbedder, QdrantStore,
    VectorStoreProvider,
};
use rag_ingest::{
    completion_callback, BackendProvider, EmbeddingPipeline, IngestRequest, JobStatus,
    PipelineConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rag-ingest", version, about = "Embed text documents into a vector store")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project id; vectors go to collection `project_<id>`
    #[arg(short, long, default_value = "default")]
    project: String,

    /// Document id (single input only); defaults to the file stem
    #[arg(long)]
    document_id: Option<String>,

    /// Override processing.batch_size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Text files to ingest; blank lines separate chunks
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

/// Split text into paragraph chunks on blank lines
fn paragraphs(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

fn document_id_for(path: &Path, explicit: Option<&str>) -> String {
    match explicit {
        Some(id) => id.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
    }
}

async fn build_providers(
    config: &PipelineConfig,
) -> anyhow::Result<(Arc<dyn EmbeddingProvider>, Arc<dyn VectorStoreProvider>)> {
    match config.backend {
        BackendProvider::Local => {
            tracing::info!("Using local backend (hash embedder, in-memory store)");
            let embedder: Arc<dyn EmbeddingProvider> =
                Arc::new(HashEmbedder::new(config.embeddings.dimensions));
            let store: Arc<dyn VectorStoreProvider> = Arc::new(LocalVectorStore::new());
            Ok((embedder, store))
        }
        BackendProvider::Remote => {
            let embedder = OllamaEmbedder::new(&config.embeddings)?;
            let store = QdrantStore::new(&config.vector_db)?;

            tracing::info!("Checking Ollama at {}...", config.embeddings.base_url);
            if !embedder.health_check().await? {
                tracing::warn!("Ollama not available at {}", config.embeddings.base_url);
                tracing::warn!("  Start it with: ollama serve");
                tracing::warn!("  Pull the model: ollama pull {}", config.embeddings.model);
            }
            tracing::info!("Checking Qdrant at {}...", config.vector_db.url);
            if !store.health_check().await? {
                tracing::warn!("Qdrant not available at {}", config.vector_db.url);
            }

            let embedder: Arc<dyn EmbeddingProvider> = Arc::new(embedder);
            let store: Arc<dyn VectorStoreProvider> = Arc::new(store);
            Ok((embedder, store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rag_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.processing.batch_size = batch_size;
    }
    config.validate()?;

    if args.document_id.is_some() && args.files.len() > 1 {
        anyhow::bail!("--document-id can only be used with a single input file");
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Backend: {:?}", config.backend);
    tracing::info!("  - Embedding model: {}", config.embeddings.model);
    tracing::info!("  - Batch size: {}", config.processing.batch_size);
    tracing::info!("  - Failure policy: {:?}", config.processing.failure_policy);

    let (embedder, store) = build_providers(&config).await?;
    let pipeline = EmbeddingPipeline::new(config.processing.clone(), embedder, store)?;

    let mut events = pipeline.subscribe();
    let progress_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ProgressEventKind::BatchSucceeded { completed_batches, progress, .. } = event.kind
            {
                tracing::debug!(
                    "Document {}: {} batches done ({}%)",
                    event.document_id,
                    completed_batches,
                    progress
                );
            }
        }
    });

    let mut job_ids = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let request = IngestRequest {
            document_id: document_id_for(path, args.document_id.as_deref()),
            project_id: args.project.clone(),
            filename,
            chunks: paragraphs(&text),
        };

        let on_complete = completion_callback(|outcome| async move {
            tracing::info!(
                "[{}] Finished with status {:?} ({} retries)",
                outcome.job.filename,
                outcome.status(),
                outcome.job.retry_count
            );
            Ok(())
        });

        job_ids.push(pipeline.submit(request, Some(on_complete))?);
    }

    let results = join_all(job_ids.iter().map(|id| pipeline.wait(*id))).await;

    let mut failed = 0;
    for result in results {
        let job = result?;
        match job.status {
            JobStatus::Completed if job.failed_batch_indices.is_empty() => {
                println!(
                    "OK      {} ({} batches, {} retries)",
                    job.filename, job.total_batches, job.retry_count
                );
            }
            JobStatus::Completed => {
                println!(
                    "PARTIAL {} ({} of {} batches failed)",
                    job.filename,
                    job.failed_batch_indices.len(),
                    job.total_batches
                );
            }
            _ => {
                failed += 1;
                println!(
                    "FAILED  {}: {}",
                    job.filename,
                    job.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.get_queue_stats())?);

    pipeline.shutdown().await;
    progress_log.abort();

    if failed > 0 {
        anyhow::bail!("{} of {} documents failed", failed, job_ids.len());
    }
    Ok(())
}
