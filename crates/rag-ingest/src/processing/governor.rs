//! Concurrency governor: global resource pools shared by every job
//!
//! Per-document limits alone do not bound downstream load: five documents
//! each allowed four concurrent batches still put twenty calls on the vector
//! store at once. The embedding and write pools are therefore global, while
//! the document pool only bounds how many jobs are in the processing state.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};

/// The three bounded pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Documents in the processing state
    Documents,
    /// Embedding provider calls
    Embeddings,
    /// Vector store writes
    Writes,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pool::Documents => "documents",
            Pool::Embeddings => "embeddings",
            Pool::Writes => "writes",
        }
    }
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_flight: usize,
    /// Highest in-flight count observed since the governor was created
    pub peak: usize,
}

/// Point-in-time view of all pools
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GovernorStats {
    pub documents: PoolStats,
    pub embeddings: PoolStats,
    pub writes: PoolStats,
}

struct ResourcePool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ResourcePool {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
        }
    }
}

/// Reserved units of a pool; dropping the permit releases them
pub struct PoolPermit {
    pool: Arc<ResourcePool>,
    units: usize,
    _permit: OwnedSemaphorePermit,
}

impl PoolPermit {
    pub fn units(&self) -> usize {
        self.units
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(self.units, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit").field("units", &self.units).finish()
    }
}

/// Owner of the document, embedding and write pools
///
/// Constructed once and shared via `Arc`; independent governors can be
/// created freely (e.g. with small capacities in tests).
pub struct ConcurrencyGovernor {
    documents: Arc<ResourcePool>,
    embeddings: Arc<ResourcePool>,
    writes: Arc<ResourcePool>,
}

impl ConcurrencyGovernor {
    /// Create a governor with explicit capacities
    pub fn new(max_documents: usize, max_embed_calls: usize, max_writes: usize) -> Self {
        tracing::info!(
            "Concurrency limits: {} documents, {} embedding calls, {} vector writes",
            max_documents,
            max_embed_calls,
            max_writes
        );
        Self {
            documents: ResourcePool::new(max_documents),
            embeddings: ResourcePool::new(max_embed_calls),
            writes: ResourcePool::new(max_writes),
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(
            config.max_concurrent_documents,
            config.max_concurrent_embed_calls,
            config.max_concurrent_writes,
        )
    }

    fn pool(&self, pool: Pool) -> &Arc<ResourcePool> {
        match pool {
            Pool::Documents => &self.documents,
            Pool::Embeddings => &self.embeddings,
            Pool::Writes => &self.writes,
        }
    }

    /// Wait for one free unit of `pool` and reserve it
    pub async fn acquire(&self, pool: Pool) -> Result<PoolPermit> {
        self.acquire_many(pool, 1).await
    }

    /// Wait until `units` of `pool` are free and reserve them together
    ///
    /// Waiters are woken in FIFO order. Requests larger than the pool
    /// capacity can never be satisfied and fail immediately.
    pub async fn acquire_many(&self, pool: Pool, units: usize) -> Result<PoolPermit> {
        let target = self.pool(pool);
        if units > target.capacity {
            return Err(Error::config(format!(
                "requested {} units from pool '{}' with capacity {}",
                units,
                pool.as_str(),
                target.capacity
            )));
        }
        let count = u32::try_from(units)
            .map_err(|_| Error::config(format!("too many units requested: {}", units)))?;

        let permit = Arc::clone(&target.semaphore)
            .acquire_many_owned(count)
            .await
            .map_err(|_| Error::PoolClosed(pool.as_str()))?;

        let now = target.in_flight.fetch_add(units, Ordering::SeqCst) + units;
        target.peak.fetch_max(now, Ordering::SeqCst);

        Ok(PoolPermit {
            pool: Arc::clone(target),
            units,
            _permit: permit,
        })
    }

    /// Return reserved units to their pool
    pub fn release(&self, permit: PoolPermit) {
        drop(permit);
    }

    pub fn stats(&self, pool: Pool) -> PoolStats {
        self.pool(pool).stats()
    }

    pub fn snapshot(&self) -> GovernorStats {
        GovernorStats {
            documents: self.documents.stats(),
            embeddings: self.embeddings.stats(),
            writes: self.writes.stats(),
        }
    }

    /// Close every pool; current and future waiters get `Error::PoolClosed`
    pub fn close(&self) {
        self.documents.semaphore.close();
        self.embeddings.semaphore.close();
        self.writes.semaphore.close();
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}
