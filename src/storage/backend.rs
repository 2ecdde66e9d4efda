//! Wire seam between the connector logic and a concrete document store
//!
//! The connector talks to the store only through [`StoreConnector`] and
//! [`DatabaseBackend`]. The HTTP implementation lives in `storage::couch`,
//! the in-process one in `storage::memory`.

use crate::core::{Error, Result};
use crate::types::{ViewQuerySpec, ViewResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Server-level access: reachability and per-database handles
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Lightweight request proving the store answers
    async fn ping(&self) -> Result<()>;

    /// Handle scoped to one database.
    ///
    /// Creating a handle performs no I/O; the database may not exist yet.
    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend>;
}

/// Raw operations against one database
///
/// Bodies are exchanged as JSON in the store's own shape (`_id`, `_rev`,
/// `_attachments`, `_deleted`). Every method maps store failures onto the
/// crate error taxonomy.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Database name
    fn name(&self) -> &str;

    /// Whether the database exists
    async fn exists(&self) -> Result<bool>;

    /// Create the database; `Ok(false)` if it already existed
    async fn create(&self) -> Result<bool>;

    /// Document count and update sequence
    async fn info(&self) -> Result<DatabaseInfo>;

    /// Current revision of `id`, `None` if absent or deleted
    async fn head_document(&self, id: &str) -> Result<Option<String>>;

    /// Fetch a document body, optionally at a historic revision
    async fn get_document(&self, id: &str, revision: Option<&str>) -> Result<Value>;

    /// Write a body under a caller-chosen id
    async fn put_document(&self, id: &str, body: &Value) -> Result<WriteResult>;

    /// Write a body and let the store assign the id
    async fn post_document(&self, body: &Value) -> Result<WriteResult>;

    /// Delete `id` at `revision`
    async fn delete_document(&self, id: &str, revision: &str) -> Result<WriteResult>;

    /// Submit several bodies in one request; outcomes are per document
    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>>;

    /// Current revision for each id, in input order
    async fn fetch_revisions(&self, ids: &[String]) -> Result<Vec<RevisionLookup>>;

    /// Run a view; missing design document or view is `NotFound`
    async fn query_view(&self, spec: &ViewQuerySpec) -> Result<ViewResult>;

    /// List documents ordered by id, with bodies
    async fn all_docs(&self, limit: Option<u64>, skip: Option<u64>) -> Result<ViewResult>;

    /// Read an attachment
    async fn get_attachment(
        &self,
        id: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<AttachmentStream>;

    /// Write an attachment at `revision`
    async fn put_attachment(
        &self,
        id: &str,
        revision: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<WriteResult>;

    /// Remove an attachment at `revision`
    async fn delete_attachment(&self, id: &str, revision: &str, name: &str) -> Result<WriteResult>;
}

/// Acknowledgement of a single-document write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Document id
    pub id: String,
    /// New revision
    pub rev: String,
}

/// Per-document outcome of a bulk request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    /// Document id
    pub id: String,
    /// New revision on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Store error code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkResult {
    /// Successful write of `id` at `rev`
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
            reason: None,
        }
    }

    /// Rejected write of `id`
    pub fn failed(id: impl Into<String>, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    /// Whether the write was committed
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Revision state of one id as reported by `_all_docs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionLookup {
    /// Document id
    pub id: String,
    /// Current revision; for deleted documents the tombstone revision
    pub revision: Option<String>,
    /// Whether the current revision is a tombstone
    pub deleted: bool,
}

impl RevisionLookup {
    /// Revision of a document that still exists
    pub fn live_revision(&self) -> Option<&str> {
        if self.deleted {
            None
        } else {
            self.revision.as_deref()
        }
    }
}

/// Database metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name
    pub db_name: String,
    /// Live documents
    #[serde(default)]
    pub doc_count: u64,
    /// Tombstones
    #[serde(default)]
    pub doc_del_count: u64,
    /// Opaque sequence; a number in older stores, a string in newer ones
    #[serde(default)]
    pub update_seq: Value,
}

/// Streamed attachment content
pub struct AttachmentStream {
    /// MIME type announced by the store
    pub content_type: String,
    /// Length announced by the store, when known
    pub length: Option<u64>,
    stream: BoxStream<'static, Result<Bytes>>,
}

impl AttachmentStream {
    /// Wrap a byte stream
    pub fn new(
        content_type: impl Into<String>,
        length: Option<u64>,
        stream: BoxStream<'static, Result<Bytes>>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            length,
            stream,
        }
    }

    /// Single-chunk stream over bytes already in memory
    pub fn from_bytes(content_type: impl Into<String>, content: Bytes) -> Self {
        let length = Some(content.len() as u64);
        Self::new(content_type, length, stream::once(async move { Ok(content) }).boxed())
    }

    /// Take the raw byte stream
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        self.stream
    }

    /// Collect the whole attachment
    pub async fn into_bytes(self) -> Result<Bytes> {
        let expected = self.length;
        let collected = self
            .stream
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        if let Some(expected) = expected {
            if collected.len() as u64 != expected {
                return Err(Error::protocol(format!(
                    "Attachment truncated: expected {} bytes, got {}",
                    expected,
                    collected.len()
                )));
            }
        }
        Ok(collected.freeze())
    }
}

impl fmt::Debug for AttachmentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentStream")
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attachment_stream_collects_chunks() {
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let att = AttachmentStream::new("text/plain", Some(11), stream::iter(chunks).boxed());
        assert_eq!(att.into_bytes().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_attachment_stream_detects_truncation() {
        let att = AttachmentStream::new(
            "text/plain",
            Some(20),
            stream::iter(vec![Ok(Bytes::from_static(b"short"))]).boxed(),
        );
        assert!(matches!(att.into_bytes().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_attachment_stream_propagates_errors() {
        let chunks = vec![Ok(Bytes::from_static(b"a")), Err(Error::unavailable("reset"))];
        let att = AttachmentStream::new("text/plain", None, stream::iter(chunks).boxed());
        assert!(att.into_bytes().await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_bulk_result_parsing() {
        let rows: Vec<BulkResult> = serde_json::from_str(
            r#"[{"ok":true,"id":"a","rev":"2-x"},{"id":"b","error":"conflict","reason":"Document update conflict."}]"#,
        )
        .unwrap();
        assert!(rows[0].is_ok());
        assert!(!rows[1].is_ok());
        assert_eq!(rows[1].error.as_deref(), Some("conflict"));
    }

    #[test]
    fn test_live_revision() {
        let live = RevisionLookup { id: "a".into(), revision: Some("1-a".into()), deleted: false };
        let dead = RevisionLookup { id: "b".into(), revision: Some("2-b".into()), deleted: true };
        assert_eq!(live.live_revision(), Some("1-a"));
        assert_eq!(dead.live_revision(), None);
    }
}
