//! Bulk mutation plans and their outcome reports

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ordered set of ids partitioned into fixed-size chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    ids: Vec<String>,
    chunk_size: usize,
}

impl BatchPlan {
    /// Plan a deletion of `ids` in chunks of `chunk_size`.
    ///
    /// The ids form a set: repeats are dropped, keeping the first
    /// occurrence, so one document never gets two tombstones.
    pub fn new(ids: Vec<String>, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::invalid_argument("Bulk chunk size must be at least 1"));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        let ids = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        Ok(Self { ids, chunk_size })
    }

    /// Ids per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of ids targeted
    pub fn total(&self) -> usize {
        self.ids.len()
    }

    /// Whether no ids were given
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of chunks, i.e. `ceil(total / chunk_size)`
    pub fn chunk_count(&self) -> usize {
        self.ids.len().div_ceil(self.chunk_size)
    }

    /// Chunks in submission order
    pub fn chunks(&self) -> impl Iterator<Item = &[String]> + '_ {
        self.ids.chunks(self.chunk_size)
    }
}

/// Outcome class of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Every surviving document was deleted
    Committed,
    /// Some documents were deleted, some failed
    Partial,
    /// Every surviving document failed, or the request itself failed
    Failed,
    /// No document in the chunk still existed
    Empty,
}

impl ChunkStatus {
    /// Stable label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Committed => "committed",
            ChunkStatus::Partial => "partial",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Empty => "empty",
        }
    }
}

/// A document the store refused to mutate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFailure {
    /// Document id
    pub id: String,
    /// Store error code, e.g. `conflict`
    pub error: String,
    /// Store-provided reason
    #[serde(default)]
    pub reason: String,
}

/// Per-chunk accounting
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkReport {
    /// Zero-based chunk position
    pub index: usize,
    /// Ids in the chunk
    pub requested: usize,
    /// Ids that no longer existed
    pub skipped: Vec<String>,
    /// Ids whose tombstone was committed
    pub deleted: Vec<String>,
    /// Ids the store rejected
    pub failures: Vec<DocumentFailure>,
}

impl ChunkReport {
    /// Empty report for chunk `index`
    pub fn new(index: usize, requested: usize) -> Self {
        Self {
            index,
            requested,
            ..Self::default()
        }
    }

    /// Mark every id in `ids` as failed with the same cause
    pub fn fail_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>, error: &str, reason: &str) {
        self.failures.extend(ids.into_iter().map(|id| DocumentFailure {
            id: id.to_string(),
            error: error.to_string(),
            reason: reason.to_string(),
        }));
    }

    /// Outcome class of the chunk
    pub fn status(&self) -> ChunkStatus {
        match (self.deleted.len(), self.failures.len()) {
            (0, 0) => ChunkStatus::Empty,
            (_, 0) => ChunkStatus::Committed,
            (0, _) => ChunkStatus::Failed,
            _ => ChunkStatus::Partial,
        }
    }
}

/// Aggregate outcome of a bulk deletion
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchReport {
    /// Ids per chunk
    pub chunk_size: usize,
    /// Distinct ids targeted
    pub total: usize,
    /// Chunk reports in submission order
    pub chunks: Vec<ChunkReport>,
}

impl BatchReport {
    /// Ids deleted across all chunks
    pub fn deleted_count(&self) -> usize {
        self.chunks.iter().map(|c| c.deleted.len()).sum()
    }

    /// Ids that were already gone
    pub fn skipped_count(&self) -> usize {
        self.chunks.iter().map(|c| c.skipped.len()).sum()
    }

    /// Ids that could not be deleted
    pub fn failed_count(&self) -> usize {
        self.chunks.iter().map(|c| c.failures.len()).sum()
    }

    /// Ids that were not deleted because the store refused them
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.chunks
            .iter()
            .flat_map(|c| c.failures.iter().map(|f| f.id.as_str()))
    }

    /// Number of chunks with the given status
    pub fn count_status(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|c| c.status() == status).count()
    }

    /// True when no document failed
    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }

    /// Turn any per-document failure into `PartialBatchFailure`
    pub fn ensure_complete(self) -> Result<Self> {
        let failed = self.failed_count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(Error::PartialBatchFailure {
                failed,
                total: self.total,
            })
        }
    }
}
