//! Type definitions for the storage connector
//!
//! This module contains the data model exchanged with the CMIS layer,
//! organized by category.

/// Stored documents, field maps and attachment stubs
pub mod document;
/// View query descriptions and result rows
pub mod query;
/// Bulk mutation plans and reports
pub mod batch;

// Re-export commonly used types for convenience
pub use document::{AttachmentStub, DocumentIdentity, Fields, StoredDocument};
pub use query::{QueryResultRow, ViewQuerySpec, ViewQuerySpecBuilder, ViewResult};
pub use batch::{BatchPlan, BatchReport, ChunkReport, ChunkStatus, DocumentFailure};
