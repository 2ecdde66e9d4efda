//! In-process document store with revision tracking
//!
//! Behaves like the HTTP store as far as the connector can observe: every
//! write produces a fresh `N-<hex>` revision, stale revisions are rejected
//! with a conflict, deletions leave tombstones and bulk requests report
//! per-document outcomes. Views are Rust closures registered per design
//! document and view name; the map source stored in the design document is
//! kept but never executed.
//!
//! Fault injection hooks make the store unreachable, fail selected bulk
//! requests or reject individual ids inside bulk requests.

use crate::core::{Error, Result};
use crate::storage::backend::{
    AttachmentStream, BulkResult, DatabaseBackend, DatabaseInfo, RevisionLookup, StoreConnector,
    WriteResult,
};
use crate::types::document::{AttachmentStub, Fields, ATTACHMENTS_FIELD, DELETED_FIELD, ID_FIELD, REV_FIELD};
use crate::types::query::DESIGN_PREFIX;
use crate::types::{QueryResultRow, ViewQuerySpec, ViewResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;

/// Size of the chunks attachment reads are streamed in
const ATTACHMENT_CHUNK: usize = 8 * 1024;

/// Map function: receives the rendered document body, returns emitted `(key, value)` pairs
pub type MapFn = Arc<dyn Fn(&Value) -> Vec<(Value, Value)> + Send + Sync>;

/// In-memory [`StoreConnector`]
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    views: DashMap<(String, String), MapFn>,
    unreachable: AtomicBool,
    failing_pings: AtomicUsize,
    ping_attempts: AtomicUsize,
    bulk_requests: AtomicUsize,
    failing_bulk_requests: DashSet<usize>,
    rejected_ids: DashSet<String>,
}

impl MemoryState {
    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(AtomicOrdering::Acquire) {
            Err(Error::unavailable("connection refused (memory store marked unreachable)"))
        } else {
            Ok(())
        }
    }
}

impl MemoryConnector {
    /// Empty store with no databases
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector with the given databases already created
    pub fn with_databases<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let connector = Self::new();
        for name in names {
            connector.add_database(name);
        }
        connector
    }

    /// Create a database if it does not exist
    pub fn add_database(&self, name: impl Into<String>) {
        self.state
            .databases
            .entry(name.into())
            .or_insert_with(|| Arc::new(MemoryDatabase::default()));
    }

    /// Whether database `name` exists
    pub fn has_database(&self, name: &str) -> bool {
        self.state.databases.contains_key(name)
    }

    /// Register the map function backing `design_doc`/`view` in every database.
    ///
    /// The view must still be defined in the database's design document to
    /// be queryable.
    pub fn register_view<F>(&self, design_doc: &str, view: &str, map: F)
    where
        F: Fn(&Value) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        let design_doc = design_doc.strip_prefix(DESIGN_PREFIX).unwrap_or(design_doc);
        self.state
            .views
            .insert((design_doc.to_string(), view.to_string()), Arc::new(map));
    }

    /// Make every request fail with `StoreUnavailable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, AtomicOrdering::Release);
    }

    /// Fail the next `count` pings
    pub fn fail_next_pings(&self, count: usize) {
        self.state.failing_pings.store(count, AtomicOrdering::Release);
    }

    /// Fail the bulk request with the given 1-based ordinal as a whole
    pub fn fail_bulk_request(&self, ordinal: usize) {
        self.state.failing_bulk_requests.insert(ordinal);
    }

    /// Reject `id` individually whenever it appears in a bulk request
    pub fn reject_in_bulk(&self, id: impl Into<String>) {
        self.state.rejected_ids.insert(id.into());
    }

    /// Pings received so far
    pub fn ping_attempts(&self) -> usize {
        self.state.ping_attempts.load(AtomicOrdering::Acquire)
    }

    /// Bulk requests received so far, including failed ones
    pub fn bulk_requests(&self) -> usize {
        self.state.bulk_requests.load(AtomicOrdering::Acquire)
    }

    /// Live documents in a database, design documents included
    pub fn document_count(&self, database: &str) -> usize {
        self.state
            .databases
            .get(database)
            .map(|db| db.docs.read().values().filter(|e| !e.deleted).count())
            .unwrap_or(0)
    }

    fn handle(&self, name: &str) -> MemoryDatabaseHandle {
        MemoryDatabaseHandle {
            name: name.to_string(),
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn ping(&self) -> Result<()> {
        self.state.ping_attempts.fetch_add(1, AtomicOrdering::AcqRel);
        self.state.check_reachable()?;
        let remaining = self.state.failing_pings.load(AtomicOrdering::Acquire);
        if remaining > 0 {
            self.state.failing_pings.store(remaining - 1, AtomicOrdering::Release);
            return Err(Error::unavailable("connection refused (injected ping failure)"));
        }
        Ok(())
    }

    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend> {
        Arc::new(self.handle(name))
    }
}

#[derive(Default)]
struct MemoryDatabase {
    docs: RwLock<BTreeMap<String, DocEntry>>,
    update_seq: AtomicU64,
}

#[derive(Clone)]
struct DocEntry {
    seq: u64,
    rev: String,
    fields: Fields,
    attachments: BTreeMap<String, Blob>,
    deleted: bool,
    history: HashMap<String, Fields>,
}

#[derive(Clone)]
struct Blob {
    content_type: String,
    data: Bytes,
    digest: String,
    revpos: u64,
}

impl Blob {
    fn new(content_type: String, data: Bytes, revpos: u64) -> Self {
        let digest = format!("blake3-{}", hex::encode(&blake3::hash(&data).as_bytes()[..16]));
        Self {
            content_type,
            data,
            digest,
            revpos,
        }
    }

    fn stub(&self) -> Value {
        json!({
            "content_type": self.content_type,
            "revpos": self.revpos,
            "digest": self.digest,
            "length": self.data.len(),
            "stub": true,
        })
    }
}

impl DocEntry {
    /// Successor of `previous` with new content and a fresh revision
    fn next(
        previous: Option<&DocEntry>,
        fields: Fields,
        attachments: BTreeMap<String, Blob>,
        deleted: bool,
    ) -> Result<DocEntry> {
        let seq = previous.map(|e| e.seq).unwrap_or(0) + 1;
        let mut hasher = blake3::Hasher::new();
        if let Some(prev) = previous {
            hasher.update(prev.rev.as_bytes());
        }
        hasher.update(serde_json::to_string(&fields)?.as_bytes());
        for (name, blob) in &attachments {
            hasher.update(name.as_bytes());
            hasher.update(blob.digest.as_bytes());
        }
        hasher.update(&[deleted as u8]);
        let rev = format!("{}-{}", seq, hex::encode(&hasher.finalize().as_bytes()[..16]));

        let mut history = previous.map(|e| e.history.clone()).unwrap_or_default();
        if let Some(prev) = previous.filter(|e| !e.deleted) {
            history.insert(prev.rev.clone(), prev.fields.clone());
        }

        Ok(DocEntry {
            seq,
            rev,
            fields,
            attachments,
            deleted,
            history,
        })
    }

    fn render(&self, id: &str) -> Value {
        render_body(id, &self.rev, &self.fields, &self.attachments)
    }
}

fn render_body(id: &str, rev: &str, fields: &Fields, attachments: &BTreeMap<String, Blob>) -> Value {
    let mut body = Map::with_capacity(fields.len() + 3);
    body.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    body.insert(REV_FIELD.to_string(), Value::String(rev.to_string()));
    for (key, value) in fields {
        body.insert(key.clone(), value.clone());
    }
    if !attachments.is_empty() {
        let table: Map<String, Value> = attachments
            .iter()
            .map(|(name, blob)| (name.clone(), blob.stub()))
            .collect();
        body.insert(ATTACHMENTS_FIELD.to_string(), Value::Object(table));
    }
    Value::Object(body)
}

impl MemoryDatabase {
    /// Apply a full-body write under the store's revision rules
    fn write(&self, id: &str, body: &Value) -> Result<WriteResult> {
        let mut fields = body
            .as_object()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("Document body must be a JSON object"))?;
        fields.remove(ID_FIELD);
        let rev = match fields.remove(REV_FIELD) {
            Some(Value::String(rev)) if !rev.is_empty() => Some(rev),
            _ => None,
        };
        let deleted = fields
            .remove(DELETED_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let incoming = fields.remove(ATTACHMENTS_FIELD);

        let mut docs = self.docs.write();
        let current = docs.get(id);
        check_revision(id, current, rev.as_deref())?;

        let seq = current.map(|e| e.seq).unwrap_or(0) + 1;
        let attachments = if deleted {
            BTreeMap::new()
        } else {
            merge_attachments(id, current, incoming, seq)?
        };
        let entry = DocEntry::next(current, fields, attachments, deleted)?;
        let result = WriteResult {
            id: id.to_string(),
            rev: entry.rev.clone(),
        };
        docs.insert(id.to_string(), entry);
        self.update_seq.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(result)
    }

    /// Live entry or NotFound
    fn live<'a>(docs: &'a BTreeMap<String, DocEntry>, id: &str) -> Result<&'a DocEntry> {
        match docs.get(id) {
            Some(entry) if !entry.deleted => Ok(entry),
            Some(_) => Err(Error::not_found(format!("{}: deleted", id))),
            None => Err(Error::not_found(format!("{}: missing", id))),
        }
    }

    /// Replace the attachment table of a live document at `revision`
    fn edit_attachments<F>(&self, id: &str, revision: &str, edit: F) -> Result<WriteResult>
    where
        F: FnOnce(&mut BTreeMap<String, Blob>, u64) -> Result<()>,
    {
        let mut docs = self.docs.write();
        let current = Self::live(&docs, id)?;
        if current.rev != revision {
            return Err(Error::conflict(id));
        }
        let mut attachments = current.attachments.clone();
        edit(&mut attachments, current.seq + 1)?;
        let entry = DocEntry::next(Some(current), current.fields.clone(), attachments, false)?;
        let result = WriteResult {
            id: id.to_string(),
            rev: entry.rev.clone(),
        };
        docs.insert(id.to_string(), entry);
        self.update_seq.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(result)
    }
}

fn check_revision(id: &str, current: Option<&DocEntry>, supplied: Option<&str>) -> Result<()> {
    let accepted = match current {
        Some(entry) if !entry.deleted => supplied == Some(entry.rev.as_str()),
        Some(entry) => supplied.map_or(true, |rev| rev == entry.rev),
        None => supplied.is_none(),
    };
    if accepted {
        Ok(())
    } else {
        Err(Error::conflict(id))
    }
}

/// Attachments omitted from an update are dropped; stubs keep existing blobs
fn merge_attachments(
    id: &str,
    current: Option<&DocEntry>,
    incoming: Option<Value>,
    seq: u64,
) -> Result<BTreeMap<String, Blob>> {
    let table = match incoming {
        Some(Value::Object(table)) => table,
        Some(Value::Null) | None => return Ok(BTreeMap::new()),
        Some(_) => return Err(Error::invalid_argument("'_attachments' must be an object")),
    };

    let mut merged = BTreeMap::new();
    for (name, value) in table {
        let stub: AttachmentStub = serde_json::from_value(value)
            .map_err(|e| Error::invalid_argument(format!("Attachment {}: {}", name, e)))?;
        let blob = match stub.decoded()? {
            Some(data) => Blob::new(stub.content_type, Bytes::from(data), seq),
            None => current
                .and_then(|entry| entry.attachments.get(&name))
                .cloned()
                .ok_or_else(|| {
                    Error::invalid_argument(format!("{}: stub for unknown attachment {}", id, name))
                })?,
        };
        merged.insert(name, blob);
    }
    Ok(merged)
}

/// Rank of a JSON type in view key collation
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// View key ordering: null < false < true < numbers < strings < arrays < objects
fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| collate(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| collate(lv, rv)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Emitted row before shaping into the response
struct Emitted {
    key: Value,
    id: String,
    value: Value,
}

fn reduce_values(function: &str, values: &[&Value]) -> Result<Value> {
    match function {
        "_count" => Ok(Value::from(values.len() as u64)),
        "_sum" => {
            if values.iter().all(|v| v.is_i64()) {
                Ok(Value::from(values.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
            } else {
                Ok(json!(values.iter().filter_map(|v| v.as_f64()).sum::<f64>()))
            }
        }
        other => Err(Error::protocol(format!(
            "Reduce function '{}' is not supported by the memory store",
            other
        ))),
    }
}

fn page<T>(rows: Vec<T>, skip: Option<u64>, limit: Option<u64>) -> Vec<T> {
    let skip = skip.unwrap_or(0) as usize;
    let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    rows.into_iter().skip(skip).take(limit).collect()
}

/// [`DatabaseBackend`] over one named in-memory database
pub struct MemoryDatabaseHandle {
    name: String,
    state: Arc<MemoryState>,
}

impl MemoryDatabaseHandle {
    fn db(&self) -> Result<Arc<MemoryDatabase>> {
        self.state.check_reachable()?;
        self.state
            .databases
            .get(&self.name)
            .map(|db| db.value().clone())
            .ok_or_else(|| Error::not_found(format!("Database {} does not exist", self.name)))
    }

    fn run_view(&self, db: &MemoryDatabase, spec: &ViewQuerySpec) -> Result<ViewResult> {
        let docs = db.docs.read();
        let design_id = spec.design_id();
        let design = MemoryDatabase::live(&docs, &design_id)
            .map_err(|_| Error::not_found(format!("{}: missing design document", design_id)))?;
        let definition = design
            .fields
            .get("views")
            .and_then(|views| views.get(spec.view()))
            .ok_or_else(|| Error::not_found(format!("{}: missing_named_view", spec.path())))?;
        let map = self
            .state
            .views
            .get(&(spec.design_doc().to_string(), spec.view().to_string()))
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                Error::protocol(format!("No map function registered for {}", spec.path()))
            })?;
        let reduce_fn = definition.get("reduce").and_then(Value::as_str);

        let mut emitted = Vec::new();
        for (id, entry) in docs.iter() {
            if entry.deleted || id.starts_with(DESIGN_PREFIX) {
                continue;
            }
            for (key, value) in map(&entry.render(id)) {
                emitted.push(Emitted {
                    key,
                    id: id.clone(),
                    value,
                });
            }
        }
        emitted.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        let total_rows = emitted.len() as u64;

        let reduce = match (spec.reduce(), reduce_fn) {
            (Some(true), None) => {
                return Err(Error::InvalidQuery(format!(
                    "{}: reduce requested on a map-only view",
                    spec.path()
                )))
            }
            (Some(false), _) | (None, None) => None,
            (_, Some(function)) => Some(function),
        };
        if spec.include_docs() && reduce.is_some() {
            return Err(Error::InvalidQuery(format!(
                "{}: include_docs is invalid for reduce",
                spec.path()
            )));
        }

        let mut selected: Vec<Emitted> = if let Some(key) = spec.key() {
            emitted
                .into_iter()
                .filter(|row| collate(&row.key, key) == Ordering::Equal)
                .collect()
        } else if let Some(keys) = spec.keys() {
            let mut out = Vec::new();
            for key in keys {
                out.extend(
                    emitted
                        .iter()
                        .filter(|row| collate(&row.key, key) == Ordering::Equal)
                        .map(|row| Emitted {
                            key: row.key.clone(),
                            id: row.id.clone(),
                            value: row.value.clone(),
                        }),
                );
            }
            out
        } else {
            emitted
        };

        if spec.descending() {
            selected.reverse();
        }
        let (lower, upper) = if spec.descending() {
            (spec.end_key(), spec.start_key())
        } else {
            (spec.start_key(), spec.end_key())
        };
        selected.retain(|row| {
            lower.map_or(true, |l| collate(&row.key, l) != Ordering::Less)
                && upper.map_or(true, |u| collate(&row.key, u) != Ordering::Greater)
        });

        if let Some(function) = reduce {
            let mut rows = Vec::new();
            if spec.group() {
                let mut start = 0;
                while start < selected.len() {
                    let mut end = start + 1;
                    while end < selected.len()
                        && collate(&selected[end].key, &selected[start].key) == Ordering::Equal
                    {
                        end += 1;
                    }
                    let values: Vec<&Value> = selected[start..end].iter().map(|r| &r.value).collect();
                    rows.push(QueryResultRow {
                        id: None,
                        key: selected[start].key.clone(),
                        value: reduce_values(function, &values)?,
                        doc: None,
                    });
                    start = end;
                }
            } else if !selected.is_empty() {
                let values: Vec<&Value> = selected.iter().map(|r| &r.value).collect();
                rows.push(QueryResultRow {
                    id: None,
                    key: Value::Null,
                    value: reduce_values(function, &values)?,
                    doc: None,
                });
            }
            return Ok(ViewResult {
                total_rows: None,
                offset: None,
                rows: page(rows, spec.skip(), spec.limit()),
            });
        }

        let rows = page(selected, spec.skip(), spec.limit())
            .into_iter()
            .map(|row| {
                let doc = if spec.include_docs() {
                    docs.get(&row.id).map(|entry| entry.render(&row.id))
                } else {
                    None
                };
                QueryResultRow {
                    id: Some(row.id),
                    key: row.key,
                    value: row.value,
                    doc,
                }
            })
            .collect();

        Ok(ViewResult {
            total_rows: Some(total_rows),
            offset: Some(spec.skip().unwrap_or(0)),
            rows,
        })
    }
}

#[async_trait]
impl DatabaseBackend for MemoryDatabaseHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool> {
        self.state.check_reachable()?;
        Ok(self.state.databases.contains_key(&self.name))
    }

    async fn create(&self) -> Result<bool> {
        self.state.check_reachable()?;
        let mut created = false;
        self.state
            .databases
            .entry(self.name.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(MemoryDatabase::default())
            });
        Ok(created)
    }

    async fn info(&self) -> Result<DatabaseInfo> {
        let db = self.db()?;
        let docs = db.docs.read();
        let deleted = docs.values().filter(|e| e.deleted).count() as u64;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            doc_count: docs.len() as u64 - deleted,
            doc_del_count: deleted,
            update_seq: Value::from(db.update_seq.load(AtomicOrdering::Acquire)),
        })
    }

    async fn head_document(&self, id: &str) -> Result<Option<String>> {
        let db = self.db()?;
        let docs = db.docs.read();
        Ok(docs.get(id).filter(|e| !e.deleted).map(|e| e.rev.clone()))
    }

    async fn get_document(&self, id: &str, revision: Option<&str>) -> Result<Value> {
        let db = self.db()?;
        let docs = db.docs.read();
        match revision {
            None => Ok(MemoryDatabase::live(&docs, id)?.render(id)),
            Some(rev) => {
                let entry = docs
                    .get(id)
                    .ok_or_else(|| Error::not_found(format!("{}: missing", id)))?;
                if entry.rev == rev && !entry.deleted {
                    Ok(entry.render(id))
                } else {
                    entry
                        .history
                        .get(rev)
                        .map(|fields| render_body(id, rev, fields, &BTreeMap::new()))
                        .ok_or_else(|| Error::not_found(format!("{} at revision {}", id, rev)))
                }
            }
        }
    }

    async fn put_document(&self, id: &str, body: &Value) -> Result<WriteResult> {
        if id.is_empty() {
            return Err(Error::invalid_argument("Document id must not be empty"));
        }
        self.db()?.write(id, body)
    }

    async fn post_document(&self, body: &Value) -> Result<WriteResult> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.db()?.write(&id, body)
    }

    async fn delete_document(&self, id: &str, revision: &str) -> Result<WriteResult> {
        let db = self.db()?;
        MemoryDatabase::live(&db.docs.read(), id)?;
        db.write(id, &json!({ REV_FIELD: revision, DELETED_FIELD: true }))
    }

    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>> {
        self.state.check_reachable()?;
        let ordinal = self.state.bulk_requests.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        if self.state.failing_bulk_requests.contains(&ordinal) {
            return Err(Error::unavailable(format!(
                "injected failure on bulk request {}",
                ordinal
            )));
        }
        let db = self.db()?;
        debug!(database = %self.name, ordinal, docs = docs.len(), "memory bulk request");

        let results = docs
            .iter()
            .map(|body| {
                let id = body
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                if self.state.rejected_ids.contains(&id) {
                    return BulkResult::failed(id, "forbidden", "rejected by fault injection");
                }
                match db.write(&id, body) {
                    Ok(written) => BulkResult::ok(written.id, written.rev),
                    Err(Error::Conflict { .. }) => {
                        BulkResult::failed(id, "conflict", "Document update conflict.")
                    }
                    Err(e) => BulkResult::failed(id, "error", e.to_string()),
                }
            })
            .collect();
        Ok(results)
    }

    async fn fetch_revisions(&self, ids: &[String]) -> Result<Vec<RevisionLookup>> {
        let db = self.db()?;
        let docs = db.docs.read();
        Ok(ids
            .iter()
            .map(|id| match docs.get(id) {
                Some(entry) => RevisionLookup {
                    id: id.clone(),
                    revision: Some(entry.rev.clone()),
                    deleted: entry.deleted,
                },
                None => RevisionLookup {
                    id: id.clone(),
                    revision: None,
                    deleted: false,
                },
            })
            .collect())
    }

    async fn query_view(&self, spec: &ViewQuerySpec) -> Result<ViewResult> {
        let db = self.db()?;
        self.run_view(&db, spec)
    }

    async fn all_docs(&self, limit: Option<u64>, skip: Option<u64>) -> Result<ViewResult> {
        let db = self.db()?;
        let docs = db.docs.read();
        let live: Vec<(&String, &DocEntry)> = docs.iter().filter(|(_, e)| !e.deleted).collect();
        let total_rows = live.len() as u64;
        let rows = page(live, skip, limit)
            .into_iter()
            .map(|(id, entry)| QueryResultRow {
                id: Some(id.clone()),
                key: Value::String(id.clone()),
                value: json!({ "rev": entry.rev }),
                doc: Some(entry.render(id)),
            })
            .collect();
        Ok(ViewResult {
            total_rows: Some(total_rows),
            offset: Some(skip.unwrap_or(0)),
            rows,
        })
    }

    async fn get_attachment(
        &self,
        id: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<AttachmentStream> {
        let db = self.db()?;
        let docs = db.docs.read();
        let entry = MemoryDatabase::live(&docs, id)?;
        if let Some(rev) = revision {
            if rev != entry.rev {
                return Err(Error::not_found(format!("{}/{} at revision {}", id, name, rev)));
            }
        }
        let blob = entry
            .attachments
            .get(name)
            .ok_or_else(|| Error::not_found(format!("{}/{}", id, name)))?;

        let data = blob.data.clone();
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(ATTACHMENT_CHUNK)
            .map(|start| Ok(data.slice(start..(start + ATTACHMENT_CHUNK).min(data.len()))))
            .collect();
        Ok(AttachmentStream::new(
            blob.content_type.clone(),
            Some(data.len() as u64),
            stream::iter(chunks).boxed(),
        ))
    }

    async fn put_attachment(
        &self,
        id: &str,
        revision: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<WriteResult> {
        let db = self.db()?;
        db.edit_attachments(id, revision, |attachments, seq| {
            attachments.insert(name.to_string(), Blob::new(content_type.to_string(), content, seq));
            Ok(())
        })
    }

    async fn delete_attachment(&self, id: &str, revision: &str, name: &str) -> Result<WriteResult> {
        let db = self.db()?;
        db.edit_attachments(id, revision, |attachments, _| {
            attachments
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("{}/{}", id, name)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> (MemoryConnector, Arc<dyn DatabaseBackend>) {
        let connector = MemoryConnector::with_databases(["repo"]);
        let db = connector.database("repo");
        (connector, db)
    }

    #[tokio::test]
    async fn test_revisions_change_and_stale_writes_conflict() {
        let (_, db) = connector();
        let first = db.put_document("a", &json!({"n": 1})).await.unwrap();
        assert!(first.rev.starts_with("1-"));

        let second = db
            .put_document("a", &json!({"_rev": first.rev, "n": 2}))
            .await
            .unwrap();
        assert!(second.rev.starts_with("2-"));
        assert_ne!(first.rev, second.rev);

        let stale = db.put_document("a", &json!({"_rev": first.rev, "n": 3})).await;
        assert!(matches!(stale, Err(Error::Conflict { ref id }) if id == "a"));

        let duplicate = db.put_document("a", &json!({"n": 9})).await;
        assert!(duplicate.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_historic_revision_readable() {
        let (_, db) = connector();
        let first = db.put_document("a", &json!({"n": 1})).await.unwrap();
        db.put_document("a", &json!({"_rev": first.rev, "n": 2})).await.unwrap();

        let old = db.get_document("a", Some(&first.rev)).await.unwrap();
        assert_eq!(old["n"], json!(1));
        assert!(db.get_document("a", Some("9-nope")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tombstones() {
        let (_, db) = connector();
        let w = db.put_document("a", &json!({})).await.unwrap();
        db.delete_document("a", &w.rev).await.unwrap();

        assert!(db.get_document("a", None).await.unwrap_err().is_not_found());
        assert_eq!(db.head_document("a").await.unwrap(), None);
        let lookup = db.fetch_revisions(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(lookup[0].deleted);
        assert!(lookup[0].revision.as_deref().unwrap().starts_with("2-"));
        assert_eq!(lookup[1].revision, None);

        // recreate over a tombstone without a revision
        let again = db.put_document("a", &json!({"n": 1})).await.unwrap();
        assert!(again.rev.starts_with("3-"));
    }

    #[tokio::test]
    async fn test_attachment_stubs_survive_updates() {
        let (_, db) = connector();
        let w = db.put_document("a", &json!({})).await.unwrap();
        let w = db
            .put_attachment("a", &w.rev, "content", Bytes::from_static(b"abc"), "text/plain")
            .await
            .unwrap();

        let body = db.get_document("a", None).await.unwrap();
        assert_eq!(body["_attachments"]["content"]["length"], json!(3));
        assert_eq!(body["_attachments"]["content"]["stub"], json!(true));

        // updating with the stub keeps the blob
        let mut update = body.clone();
        update["title"] = json!("x");
        let w2 = db.put_document("a", &update).await.unwrap();
        assert_ne!(w.rev, w2.rev);
        let content = db.get_attachment("a", "content", None).await.unwrap();
        assert_eq!(content.into_bytes().await.unwrap(), Bytes::from_static(b"abc"));

        // omitting the table drops it
        db.put_document("a", &json!({"_rev": w2.rev})).await.unwrap();
        assert!(db.get_attachment("a", "content", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_large_attachment_streams_in_chunks() {
        let (_, db) = connector();
        let w = db.put_document("a", &json!({})).await.unwrap();
        let blob = Bytes::from(vec![7u8; ATTACHMENT_CHUNK * 2 + 10]);
        db.put_attachment("a", &w.rev, "big", blob.clone(), "application/octet-stream")
            .await
            .unwrap();

        let chunks: Vec<Result<Bytes>> = db
            .get_attachment("a", "big", None)
            .await
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, blob.len());
    }

    #[tokio::test]
    async fn test_bulk_fault_injection() {
        let (connector, db) = connector();
        connector.reject_in_bulk("b");
        let results = db
            .bulk_docs(&[json!({"_id": "a"}), json!({"_id": "b"})])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].error.as_deref(), Some("forbidden"));

        connector.fail_bulk_request(2);
        assert!(db.bulk_docs(&[json!({"_id": "c"})]).await.is_err());
        assert_eq!(connector.bulk_requests(), 2);
        assert_eq!(connector.document_count("repo"), 1);
    }

    #[tokio::test]
    async fn test_view_key_range_and_reduce() {
        let (connector, db) = connector();
        connector.register_view("_repo", "byType", |doc| {
            vec![(doc["type"].clone(), json!(1))]
        });
        db.put_document(
            "_design/_repo",
            &json!({"views": {"byType": {"map": "function(doc){}", "reduce": "_count"}}}),
        )
        .await
        .unwrap();
        for (id, kind) in [("d1", "folder"), ("d2", "document"), ("d3", "folder"), ("d4", "item")] {
            db.put_document(id, &json!({"type": kind})).await.unwrap();
        }

        let exact = ViewQuerySpec::builder("_repo", "byType")
            .key("folder")
            .reduce(false)
            .build()
            .unwrap();
        let result = db.query_view(&exact).await.unwrap();
        let ids: Vec<_> = result.rows.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["d1", "d3"]);
        assert_eq!(result.total_rows, Some(4));

        let range = ViewQuerySpec::builder("_repo", "byType")
            .start_key("f")
            .end_key("g")
            .reduce(false)
            .build()
            .unwrap();
        assert_eq!(db.query_view(&range).await.unwrap().len(), 2);

        let desc = ViewQuerySpec::builder("_repo", "byType")
            .start_key("g")
            .end_key("d")
            .descending(true)
            .reduce(false)
            .build()
            .unwrap();
        let keys: Vec<_> = db.query_view(&desc).await.unwrap().rows.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![json!("folder"), json!("folder"), json!("document")]);

        let grouped = ViewQuerySpec::builder("_repo", "byType").group(true).build().unwrap();
        let rows = db.query_view(&grouped).await.unwrap().rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].key, json!("folder"));
        assert_eq!(rows[1].value, json!(2));
    }

    #[tokio::test]
    async fn test_missing_view_is_not_found() {
        let (_, db) = connector();
        let spec = ViewQuerySpec::builder("_repo", "children").build().unwrap();
        assert!(db.query_view(&spec).await.unwrap_err().is_not_found());

        db.put_document("_design/_repo", &json!({"views": {}})).await.unwrap();
        assert!(db.query_view(&spec).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_and_missing_database() {
        let (connector, _) = connector();
        let missing = connector.database("nope");
        assert!(!missing.exists().await.unwrap());
        assert!(missing.get_document("a", None).await.unwrap_err().is_not_found());
        assert!(missing.create().await.unwrap());
        assert!(!missing.create().await.unwrap());

        connector.set_unreachable(true);
        assert!(connector.ping().await.unwrap_err().is_retryable());
        assert!(missing.exists().await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_collation_order() {
        let mut keys = vec![json!("b"), json!([1]), json!(2), json!(null), json!(true), json!("a"), json!(false), json!({"a": 1})];
        keys.sort_by(collate);
        assert_eq!(
            keys,
            vec![json!(null), json!(false), json!(true), json!(2), json!("a"), json!("b"), json!([1]), json!({"a": 1})]
        );
    }
}
