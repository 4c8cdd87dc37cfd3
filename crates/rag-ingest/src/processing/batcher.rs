//! Splits a document's chunk list into offset-tagged batches

use uuid::Uuid;

use crate::error::{Error, Result};

/// A contiguous slice of a job's chunks, embedded and written together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub job_id: Uuid,
    /// Position of this batch within the job
    pub batch_index: usize,
    /// Index of the first chunk in the original list
    pub start_offset: usize,
    pub chunks: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Stable chunk id for the chunk at `local_index` within this batch
    pub fn chunk_id(&self, local_index: usize) -> usize {
        self.start_offset + local_index
    }
}

/// Number of batches `split` produces for `chunk_count` chunks
pub fn batch_count(chunk_count: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    chunk_count.div_ceil(batch_size)
}

/// Split `chunks` into batches of at most `batch_size`, preserving order
///
/// Deterministic: identical input always yields identical boundaries, which
/// keeps `chunk_id`s stable when a whole document is re-ingested.
pub fn split(job_id: Uuid, chunks: Vec<String>, batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(Error::config("batch_size must be at least 1"));
    }

    let mut batches = Vec::with_capacity(batch_count(chunks.len(), batch_size));
    let mut remaining = chunks.into_iter().peekable();
    let mut start_offset = 0;

    while remaining.peek().is_some() {
        let slice: Vec<String> = remaining.by_ref().take(batch_size).collect();
        let len = slice.len();
        batches.push(Batch {
            job_id,
            batch_index: batches.len(),
            start_offset,
            chunks: slice,
        });
        start_offset += len;
    }

    Ok(batches)
}
