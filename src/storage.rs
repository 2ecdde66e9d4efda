//! Storage connector layer
//!
//! Everything between the CMIS repository code and the revisioned document
//! store: the pooled per-database clients, endpoint discovery, probing,
//! conflict handling, chunked bulk deletes, view queries and attachments.
//!
//! The store itself sits behind [`StoreConnector`] / [`DatabaseBackend`].
//! [`CouchConnector`] speaks HTTP to a CouchDB-compatible server;
//! [`MemoryConnector`] keeps everything in process for tests and tooling.

pub mod backend;
pub mod batch;
pub mod client;
pub mod conflict;
pub mod couch;
pub mod endpoint;
pub mod memory;
pub mod policy;
pub mod pool;
pub mod probe;
pub mod provision;
pub mod view;

pub use backend::{
    AttachmentStream, BulkResult, DatabaseBackend, DatabaseInfo, RevisionLookup, StoreConnector,
    WriteResult,
};
pub use client::RepositoryHandle;
pub use conflict::{ConflictResolver, DeleteOutcome};
pub use couch::CouchConnector;
pub use endpoint::{DeploymentContext, EndpointSource, ResolvedEndpoint};
pub use memory::MemoryConnector;
pub use policy::{FailurePolicy, Phase};
pub use pool::{ClientPool, ConnectorFactory};
pub use probe::{ConnectionProber, ProbeOutcome, ProbeReport};
pub use provision::{ProvisionReport, Provisioner};
