//! Bulk Batch Planner
//!
//! Deletes a large id set chunk by chunk. Each chunk costs two round trips:
//! one `_all_docs` lookup for current revisions and one `_bulk_docs` request
//! carrying a tombstone per surviving document. Chunks run sequentially and
//! independently; a failed chunk never affects documents committed by
//! another one.

use crate::storage::backend::DatabaseBackend;
use crate::system::metrics;
use crate::types::{BatchPlan, BatchReport, ChunkReport, ChunkStatus, StoredDocument};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Error code recorded for documents of a chunk whose request failed as a whole
pub const REQUEST_FAILED: &str = "request_failed";

/// Execute `plan` against `db`
pub async fn execute(db: &dyn DatabaseBackend, plan: &BatchPlan) -> BatchReport {
    let mut report = BatchReport {
        chunk_size: plan.chunk_size(),
        total: plan.total(),
        chunks: Vec::with_capacity(plan.chunk_count()),
    };

    for (index, chunk) in plan.chunks().enumerate() {
        let outcome = delete_chunk(db, index, chunk).await;
        let status = outcome.status();
        metrics::record_chunk(status);
        match status {
            ChunkStatus::Failed => warn!(
                database = db.name(),
                chunk = index,
                failed = outcome.failures.len(),
                "bulk delete chunk failed"
            ),
            _ => debug!(
                database = db.name(),
                chunk = index,
                status = status.as_str(),
                deleted = outcome.deleted.len(),
                skipped = outcome.skipped.len(),
                "bulk delete chunk finished"
            ),
        }
        report.chunks.push(outcome);
    }

    info!(
        database = db.name(),
        total = report.total,
        deleted = report.deleted_count(),
        skipped = report.skipped_count(),
        failed = report.failed_count(),
        chunks = report.chunks.len(),
        "bulk delete finished"
    );
    report
}

async fn delete_chunk(db: &dyn DatabaseBackend, index: usize, ids: &[String]) -> ChunkReport {
    let mut report = ChunkReport::new(index, ids.len());

    let lookups = match db.fetch_revisions(ids).await {
        Ok(lookups) => lookups,
        Err(e) => {
            report.fail_all(ids.iter().map(String::as_str), REQUEST_FAILED, &e.to_string());
            return report;
        }
    };

    let mut tombstones = Vec::with_capacity(lookups.len());
    let mut pending = Vec::with_capacity(lookups.len());
    for lookup in lookups {
        match lookup.live_revision() {
            Some(rev) => {
                tombstones.push(StoredDocument::tombstone(lookup.id.clone(), rev).to_body());
                pending.push(lookup.id);
            }
            None => report.skipped.push(lookup.id),
        }
    }
    if tombstones.is_empty() {
        return report;
    }

    let results = match db.bulk_docs(&tombstones).await {
        Ok(results) => results,
        Err(e) => {
            report.fail_all(pending.iter().map(String::as_str), REQUEST_FAILED, &e.to_string());
            return report;
        }
    };

    let mut answered = HashSet::with_capacity(results.len());
    for result in results {
        answered.insert(result.id.clone());
        match result.error {
            None => report.deleted.push(result.id),
            Some(error) => report.fail_all(
                [result.id.as_str()],
                &error,
                result.reason.as_deref().unwrap_or_default(),
            ),
        }
    }
    let unanswered: Vec<&str> = pending
        .iter()
        .map(String::as_str)
        .filter(|id| !answered.contains(*id))
        .collect();
    report.fail_all(unanswered, "missing_result", "store returned no outcome for this document");
    report
}
