//! Document Store Client
//!
//! A [`RepositoryHandle`] is the per-database client the CMIS layer works
//! with. It holds no document state; every call goes to the store and
//! consistency for a single document is left to the store's revision check.

use crate::core::{Error, Result, StoreConfig};
use crate::storage::backend::{AttachmentStream, DatabaseBackend, DatabaseInfo};
use crate::storage::batch;
use crate::storage::conflict::{ConflictResolver, DeleteOutcome};
use crate::storage::policy::{FailurePolicy, Phase};
use crate::storage::view;
use crate::system::metrics::Timer;
use crate::types::document::non_empty;
use crate::types::query::DESIGN_PREFIX;
use crate::types::{
    AttachmentStub, BatchPlan, BatchReport, DocumentIdentity, Fields, StoredDocument, ViewQuerySpec,
    ViewResult,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Client for one repository database
pub struct RepositoryHandle {
    repository_id: String,
    db: Arc<dyn DatabaseBackend>,
    resolver: ConflictResolver,
    policy: FailurePolicy,
    bulk_chunk_size: usize,
}

impl fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("repository_id", &self.repository_id)
            .field("database", &self.db.name())
            .field("policy", &self.resolver.policy())
            .field("bulk_chunk_size", &self.bulk_chunk_size)
            .finish()
    }
}

impl RepositoryHandle {
    /// Create a handle; only the pool does this outside of tests
    pub fn new(
        repository_id: impl Into<String>,
        db: Arc<dyn DatabaseBackend>,
        config: &StoreConfig,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            db,
            resolver: ConflictResolver::new(config.stale_revision_policy),
            policy,
            bulk_chunk_size: config.bulk_chunk_size,
        }
    }

    /// Repository this handle serves
    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    /// Current operational phase
    pub fn phase(&self) -> Phase {
        self.policy.phase()
    }

    /// Swallow failures the current phase tolerates.
    ///
    /// During bootstrap NotFound and StoreUnavailable become `Ok(None)`;
    /// in steady state every error is returned unchanged.
    pub fn absorb<T>(&self, result: Result<T>) -> Result<Option<T>> {
        self.policy.absorb(result)
    }

    // ---- database ----------------------------------------------------

    /// Create the backing database unless it exists; `true` if created
    pub async fn ensure_database(&self) -> Result<bool> {
        let created = Timer::start("ensure_database").finish(self.db.create().await)?;
        if created {
            info!(database = self.db.name(), "created database");
        }
        Ok(created)
    }

    /// Whether the backing database exists
    pub async fn database_exists(&self) -> Result<bool> {
        Timer::start("database_exists").finish(self.db.exists().await)
    }

    /// Counts and update sequence of the backing database
    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        Timer::start("database_info").finish(self.db.info().await)
    }

    // ---- documents ---------------------------------------------------

    /// Create a document; the store assigns the id
    pub async fn create(&self, fields: Fields) -> Result<StoredDocument> {
        self.create_document(StoredDocument::new(fields)).await
    }

    /// Create a document under a caller-chosen id; an existing id is a Conflict
    pub async fn create_with_id(&self, id: &str, fields: Fields) -> Result<StoredDocument> {
        if id.is_empty() {
            return Err(Error::invalid_argument("create_with_id requires a non-empty id"));
        }
        self.create_document(StoredDocument::with_id(id, fields)).await
    }

    /// Create a fully built document, inline attachments included
    pub async fn create_document(&self, mut document: StoredDocument) -> Result<StoredDocument> {
        if document.revision().is_some() {
            return Err(Error::invalid_argument(format!(
                "New document {} must not carry a revision",
                document.id().unwrap_or("<unassigned>")
            )));
        }
        let body = document.to_body();
        let result = match document.id() {
            Some(id) => self.db.put_document(id, &body).await,
            None => self.db.post_document(&body).await,
        };
        let written = Timer::start("create").finish(result)?;
        debug!(database = self.db.name(), id = %written.id, rev = %written.rev, "created document");

        document.id = Some(written.id);
        document.revision = Some(written.rev);
        settle_attachments(&mut document);
        Ok(document)
    }

    /// Create from a domain type
    pub async fn create_typed<T>(&self, value: &T) -> Result<StoredDocument>
    where
        T: Serialize + DocumentIdentity,
    {
        self.create_document(StoredDocument::from_typed(value)?).await
    }

    /// Fetch the current version of `id`
    pub async fn get(&self, id: &str) -> Result<StoredDocument> {
        require_id(id)?;
        let body = Timer::start("get").finish(self.db.get_document(id, None).await)?;
        StoredDocument::from_body(body)
    }

    /// Fetch `id`, mapping NotFound to `None`
    pub async fn find(&self, id: &str) -> Result<Option<StoredDocument>> {
        match self.get(id).await {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch `id` into a domain type
    pub async fn get_as<T>(&self, id: &str) -> Result<T>
    where
        T: DeserializeOwned + DocumentIdentity,
    {
        self.get(id).await?.into_typed()
    }

    /// Fetch a specific, possibly historic, revision of `id`
    pub async fn get_revision(&self, id: &str, revision: &str) -> Result<StoredDocument> {
        require_id(id)?;
        require_revision(id, revision)?;
        let body = Timer::start("get_revision").finish(self.db.get_document(id, Some(revision)).await)?;
        StoredDocument::from_body(body)
    }

    /// Whether a live document with `id` exists
    pub async fn exists(&self, id: &str) -> Result<bool> {
        require_id(id)?;
        Ok(Timer::start("exists")
            .finish(self.db.head_document(id).await)?
            .is_some())
    }

    /// Current revision of `id`, `None` if absent
    pub async fn current_revision(&self, id: &str) -> Result<Option<String>> {
        require_id(id)?;
        Timer::start("current_revision").finish(self.db.head_document(id).await)
    }

    /// Write a new version of `document`.
    ///
    /// The revision must be the one the caller last observed; a stale one
    /// comes back as Conflict and is never retried here.
    pub async fn update(&self, mut document: StoredDocument) -> Result<StoredDocument> {
        let id = document.require_id()?.to_string();
        let previous = document.require_revision()?.to_string();

        let body = document.to_body();
        let written = Timer::start("update").finish(self.db.put_document(&id, &body).await)?;
        if written.rev == previous {
            return Err(Error::protocol(format!(
                "Store acknowledged update of {} without a new revision",
                id
            )));
        }
        debug!(database = self.db.name(), %id, from = %previous, to = %written.rev, "updated document");

        document.id = Some(written.id);
        document.revision = Some(written.rev);
        settle_attachments(&mut document);
        Ok(document)
    }

    /// Update from a domain type; its revision is advanced in place
    pub async fn update_typed<T>(&self, value: &mut T) -> Result<()>
    where
        T: Serialize + DocumentIdentity,
    {
        let updated = self.update(StoredDocument::from_typed(value)?).await?;
        if let Some(rev) = updated.revision {
            value.set_document_revision(rev);
        }
        Ok(())
    }

    /// Delete `id` under the configured stale-revision policy.
    ///
    /// A missing document counts as deleted.
    pub async fn delete(&self, id: &str, revision: &str) -> Result<DeleteOutcome> {
        require_id(id)?;
        require_revision(id, revision)?;
        let outcome = Timer::start("delete").finish(self.resolver.delete(self.db.as_ref(), id, revision).await)?;
        debug!(database = self.db.name(), %id, ?outcome, "deleted document");
        Ok(outcome)
    }

    /// Delete a document previously read
    pub async fn delete_document(&self, document: &StoredDocument) -> Result<DeleteOutcome> {
        self.delete(document.require_id()?, document.require_revision()?).await
    }

    /// Delete many ids with the configured chunk size
    pub async fn bulk_delete(&self, ids: Vec<String>) -> Result<BatchReport> {
        self.bulk_delete_chunked(ids, self.bulk_chunk_size).await
    }

    /// Delete many ids in chunks of `chunk_size`.
    ///
    /// Per-document failures are reported, not raised; call
    /// [`BatchReport::ensure_complete`] to turn them into an error.
    pub async fn bulk_delete_chunked(&self, ids: Vec<String>, chunk_size: usize) -> Result<BatchReport> {
        let plan = BatchPlan::new(ids, chunk_size)?;
        let report = batch::execute(self.db.as_ref(), &plan).await;
        Timer::start("bulk_delete").finish(Ok(report))
    }

    /// List documents ordered by id
    pub async fn all_docs(&self, limit: Option<u64>, skip: Option<u64>) -> Result<Vec<StoredDocument>> {
        let result = Timer::start("all_docs").finish(self.db.all_docs(limit, skip).await)?;
        view::rows_to_documents(result.rows)
    }

    // ---- views -------------------------------------------------------

    /// Run a view query
    pub async fn query_view(&self, spec: &ViewQuerySpec) -> Result<ViewResult> {
        Timer::start("query_view").finish(view::query(self.db.as_ref(), spec).await)
    }

    /// Run a view query and map each row's body into `T`
    pub async fn query_view_as<T>(&self, spec: &ViewQuerySpec) -> Result<Vec<T>>
    where
        T: DeserializeOwned + DocumentIdentity,
    {
        Timer::start("query_view").finish(view::query_typed(self.db.as_ref(), spec).await)
    }

    /// Fetch a design document by name, with or without prefix
    pub async fn get_design_document(&self, name: &str) -> Result<StoredDocument> {
        self.get(&design_id(name)).await
    }

    /// Create or update one view in a design document, keeping the others
    pub async fn put_view(
        &self,
        design_doc: &str,
        view_name: &str,
        map: &str,
        reduce: Option<&str>,
    ) -> Result<StoredDocument> {
        let id = design_id(design_doc);
        let mut definition = json!({ "map": map });
        if let Some(reduce) = reduce {
            definition["reduce"] = Value::String(reduce.to_string());
        }

        match self.find(&id).await? {
            Some(mut design) => {
                let mut views = design
                    .get("views")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                if views.get(view_name) == Some(&definition) {
                    return Ok(design);
                }
                views.insert(view_name.to_string(), definition);
                design.set("views", Value::Object(views));
                self.update(design).await
            }
            None => {
                let mut fields = Fields::new();
                fields.insert("language".to_string(), json!("javascript"));
                fields.insert("views".to_string(), json!({ view_name: definition }));
                self.create_document(StoredDocument::with_id(id, fields)).await
            }
        }
    }

    // ---- attachments -------------------------------------------------

    /// Stream an attachment, optionally at a given revision
    pub async fn get_attachment(
        &self,
        id: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<AttachmentStream> {
        require_id(id)?;
        require_attachment_name(name)?;
        let revision = non_empty(revision);
        Timer::start("get_attachment").finish(self.db.get_attachment(id, name, revision).await)
    }

    /// Read an attachment fully into memory
    pub async fn get_attachment_bytes(&self, id: &str, name: &str, revision: Option<&str>) -> Result<Bytes> {
        self.get_attachment(id, name, revision).await?.into_bytes().await
    }

    /// Add or replace an attachment; returns the document's new revision
    pub async fn put_attachment(
        &self,
        id: &str,
        revision: &str,
        name: &str,
        content: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<String> {
        require_id(id)?;
        require_revision(id, revision)?;
        require_attachment_name(name)?;
        let written = Timer::start("put_attachment").finish(
            self.db
                .put_attachment(id, revision, name, content.into(), content_type)
                .await,
        )?;
        Ok(written.rev)
    }

    /// Remove an attachment; returns the document's new revision
    pub async fn delete_attachment(&self, id: &str, revision: &str, name: &str) -> Result<String> {
        require_id(id)?;
        require_revision(id, revision)?;
        require_attachment_name(name)?;
        let written = Timer::start("delete_attachment")
            .finish(self.db.delete_attachment(id, revision, name).await)?;
        Ok(written.rev)
    }

    // ---- phase-aware reads -------------------------------------------
    //
    // Same calls routed through the failure policy: while the pool is
    // bootstrapping, NotFound and StoreUnavailable come back as `None`.
    // Once ready, every error is returned unchanged.

    /// [`get`](Self::get) under the failure policy
    pub async fn get_tolerant(&self, id: &str) -> Result<Option<StoredDocument>> {
        self.absorb(self.get(id).await)
    }

    /// [`get_design_document`](Self::get_design_document) under the failure policy
    pub async fn get_design_document_tolerant(&self, name: &str) -> Result<Option<StoredDocument>> {
        self.absorb(self.get_design_document(name).await)
    }

    /// [`current_revision`](Self::current_revision) under the failure policy
    pub async fn current_revision_tolerant(&self, id: &str) -> Result<Option<String>> {
        Ok(self.absorb(self.current_revision(id).await)?.flatten())
    }

    /// [`query_view`](Self::query_view) under the failure policy
    pub async fn query_view_tolerant(&self, spec: &ViewQuerySpec) -> Result<Option<ViewResult>> {
        self.absorb(self.query_view(spec).await)
    }

    /// [`query_view_as`](Self::query_view_as) under the failure policy
    pub async fn query_view_as_tolerant<T>(&self, spec: &ViewQuerySpec) -> Result<Option<Vec<T>>>
    where
        T: DeserializeOwned + DocumentIdentity,
    {
        self.absorb(self.query_view_as(spec).await)
    }

    /// [`get_attachment`](Self::get_attachment) under the failure policy
    pub async fn get_attachment_tolerant(
        &self,
        id: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<Option<AttachmentStream>> {
        self.absorb(self.get_attachment(id, name, revision).await)
    }

    /// [`create`](Self::create) under the failure policy; a write the store
    /// could not take during bootstrap yields `None`
    pub async fn create_tolerant(&self, fields: Fields) -> Result<Option<StoredDocument>> {
        self.absorb(self.create(fields).await)
    }

    /// [`ensure_database`](Self::ensure_database) under the failure policy
    pub async fn ensure_database_tolerant(&self) -> Result<Option<bool>> {
        self.absorb(self.ensure_database().await)
    }
}

fn require_id(id: &str) -> Result<()> {
    if id.is_empty() {
        Err(Error::invalid_argument("Document id must not be empty"))
    } else {
        Ok(())
    }
}

fn require_revision(id: &str, revision: &str) -> Result<()> {
    if revision.is_empty() {
        Err(Error::invalid_argument(format!("Document {} requires a revision", id)))
    } else {
        Ok(())
    }
}

fn require_attachment_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Error::invalid_argument("Attachment name must not be empty"))
    } else {
        Ok(())
    }
}

fn design_id(name: &str) -> String {
    if name.starts_with(DESIGN_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", DESIGN_PREFIX, name)
    }
}

/// After a write, inline attachment data is on the store; keep metadata only
fn settle_attachments(document: &mut StoredDocument) {
    for stub in document.attachments.values_mut() {
        settle(stub);
    }
}

fn settle(stub: &mut AttachmentStub) {
    if stub.data.take().is_some() {
        stub.stub = true;
    }
}
