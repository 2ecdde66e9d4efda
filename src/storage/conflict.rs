//! Conflict Resolver
//!
//! Deletes under [`StaleRevisionPolicy::RefreshOnce`] have at-least-once
//! semantics: the current revision is fetched right before the delete and
//! substituted for the caller's revision when they differ. A delete can
//! therefore remove a version the caller never saw. [`StaleRevisionPolicy::Strict`]
//! passes the caller's revision through unchanged.
//!
//! Updates never go through the resolver; their conflicts always reach the
//! caller.

use crate::core::{Error, Result, StaleRevisionPolicy};
use crate::storage::backend::DatabaseBackend;
use crate::system::metrics;
use tracing::debug;

/// What a delete actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The document was deleted
    Deleted {
        /// Tombstone revision
        revision: String,
        /// Whether the caller's revision was stale and got replaced
        refreshed: bool,
    },
    /// The document did not exist (or was already deleted)
    AlreadyDeleted,
}

impl DeleteOutcome {
    /// True when the caller's revision was replaced by a fresher one
    pub fn was_refreshed(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted { refreshed: true, .. })
    }
}

/// Applies the configured stale-revision policy to deletes
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: StaleRevisionPolicy,
}

impl ConflictResolver {
    /// Resolver applying `policy`
    pub fn new(policy: StaleRevisionPolicy) -> Self {
        Self { policy }
    }

    /// Configured stale-revision policy
    pub fn policy(&self) -> StaleRevisionPolicy {
        self.policy
    }

    /// Delete `id`, resolving a stale `revision` according to the policy
    pub async fn delete(
        &self,
        db: &dyn DatabaseBackend,
        id: &str,
        revision: &str,
    ) -> Result<DeleteOutcome> {
        if revision.is_empty() {
            return Err(Error::invalid_argument(format!(
                "Delete of {} requires a revision",
                id
            )));
        }

        let (revision, refreshed) = match self.policy {
            StaleRevisionPolicy::Strict => (revision.to_string(), false),
            StaleRevisionPolicy::RefreshOnce => match db.head_document(id).await? {
                None => {
                    debug!(%id, "delete target already gone");
                    return Ok(DeleteOutcome::AlreadyDeleted);
                }
                Some(current) if current != revision => {
                    debug!(%id, stale = %revision, %current, "substituting current revision for delete");
                    metrics::record_revision_refresh();
                    (current, true)
                }
                Some(current) => (current, false),
            },
        };

        match db.delete_document(id, &revision).await {
            Ok(written) => Ok(DeleteOutcome::Deleted {
                revision: written.rev,
                refreshed,
            }),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::AlreadyDeleted),
            Err(e) => Err(e),
        }
    }
}
