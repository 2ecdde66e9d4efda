//! Stored documents and their identity handling
//!
//! A [`StoredDocument`] is the unit of persistence: an id, an opaque revision
//! token, an ordered field map and optional named attachments. Documents are
//! ephemeral; the connector never caches them between calls.

use crate::core::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Ordered mapping of field name to JSON value
pub type Fields = Map<String, Value>;

/// Store-level identity field
pub const ID_FIELD: &str = "_id";
/// Store-level revision field
pub const REV_FIELD: &str = "_rev";
/// Store-level attachment table
pub const ATTACHMENTS_FIELD: &str = "_attachments";
/// Store-level tombstone marker
pub const DELETED_FIELD: &str = "_deleted";

/// Identity field name used by older callers
pub const LEGACY_ID_FIELD: &str = "id";

/// Metadata for one named attachment, optionally carrying inline data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStub {
    /// MIME type of the blob
    pub content_type: String,

    /// Size in bytes
    #[serde(default)]
    pub length: u64,

    /// Store-computed digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Revision position at which the blob was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,

    /// True when the store returned metadata only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,

    /// Base64 content for inline writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AttachmentStub {
    /// Build an inline attachment from raw bytes
    pub fn inline(content_type: impl Into<String>, content: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            length: content.len() as u64,
            digest: None,
            revpos: None,
            stub: false,
            data: Some(BASE64.encode(content)),
        }
    }

    /// Decode inline data, if any
    pub fn decoded(&self) -> Result<Option<Vec<u8>>> {
        match &self.data {
            Some(data) => BASE64
                .decode(data)
                .map(Some)
                .map_err(|e| Error::protocol(format!("Invalid inline attachment data: {}", e))),
            None => Ok(None),
        }
    }
}

/// Access to the id/revision pair of a domain object.
///
/// Generic deserialization does not reliably populate identity that a type
/// exposes through accessors, so mapping code calls these explicitly after
/// deserializing (see [`reconcile_identity`]).
pub trait DocumentIdentity {
    /// Current id, if any
    fn document_id(&self) -> Option<&str>;
    /// Current revision, if any
    fn document_revision(&self) -> Option<&str>;
    /// Replace the id
    fn set_document_id(&mut self, id: String);
    /// Replace the revision
    fn set_document_revision(&mut self, revision: String);
}

/// Backfill envelope identity into `target` where the body left it empty.
///
/// Body-level id/revision win when present and non-empty.
pub fn reconcile_identity<T: DocumentIdentity>(
    target: &mut T,
    envelope_id: Option<&str>,
    envelope_revision: Option<&str>,
) {
    if non_empty(target.document_id()).is_none() {
        if let Some(id) = non_empty(envelope_id) {
            target.set_document_id(id.to_string());
        }
    }
    if non_empty(target.document_revision()).is_none() {
        if let Some(rev) = non_empty(envelope_revision) {
            target.set_document_revision(rev.to_string());
        }
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// The unit of persistence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDocument {
    /// Store-assigned or caller-supplied id
    pub id: Option<String>,

    /// Revision current as of the read that produced this value
    pub revision: Option<String>,

    /// Field values, excluding store-level underscore fields
    pub fields: Fields,

    /// Named attachments
    pub attachments: BTreeMap<String, AttachmentStub>,

    /// Tombstone marker
    pub deleted: bool,
}

impl StoredDocument {
    /// New document without identity; the store assigns the id on create
    pub fn new(fields: Fields) -> Self {
        Self::from_fields(fields)
    }

    /// New document with a caller-supplied id
    pub fn with_id(id: impl Into<String>, fields: Fields) -> Self {
        let mut doc = Self::from_fields(fields);
        doc.id = Some(id.into());
        doc
    }

    /// Deletion marker for `id` at `revision`
    pub fn tombstone(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            revision: Some(revision.into()),
            fields: Fields::new(),
            attachments: BTreeMap::new(),
            deleted: true,
        }
    }

    /// Split a raw field map into identity, attachments and plain fields.
    ///
    /// `_id` is preferred; the legacy `id` name is accepted as identity but
    /// stays in the field map untouched. The revision is only ever read
    /// from `_rev`, so a plain `revision` field is ordinary data.
    pub fn from_fields(mut fields: Fields) -> Self {
        let id = take_string(&mut fields, ID_FIELD)
            .or_else(|| fields.get(LEGACY_ID_FIELD).and_then(as_non_empty_str));
        let revision = take_string(&mut fields, REV_FIELD);
        let attachments = fields
            .remove(ATTACHMENTS_FIELD)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let deleted = fields
            .remove(DELETED_FIELD)
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        Self {
            id,
            revision,
            fields,
            attachments,
            deleted,
        }
    }

    /// Parse a raw store body
    pub fn from_body(body: Value) -> Result<Self> {
        match body {
            Value::Object(fields) => Ok(Self::from_fields(fields)),
            other => Err(Error::protocol(format!(
                "Expected a JSON object document, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Render the document as the store expects it on the wire
    pub fn to_body(&self) -> Value {
        let mut body = Fields::with_capacity(self.fields.len() + 4);
        if let Some(id) = non_empty(self.id.as_deref()) {
            body.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        }
        if let Some(rev) = non_empty(self.revision.as_deref()) {
            body.insert(REV_FIELD.to_string(), Value::String(rev.to_string()));
        }
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        if !self.attachments.is_empty() {
            if let Ok(table) = serde_json::to_value(&self.attachments) {
                body.insert(ATTACHMENTS_FIELD.to_string(), table);
            }
        }
        if self.deleted {
            body.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    /// Id, if non-empty
    pub fn id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    /// Revision, if non-empty
    pub fn revision(&self) -> Option<&str> {
        non_empty(self.revision.as_deref())
    }

    /// Id or an InvalidArgument error
    pub fn require_id(&self) -> Result<&str> {
        self.id()
            .ok_or_else(|| Error::invalid_argument("Document has neither '_id' nor 'id'"))
    }

    /// Revision or an InvalidArgument error
    pub fn require_revision(&self) -> Result<&str> {
        self.revision().ok_or_else(|| {
            Error::invalid_argument(format!(
                "Document {} has no revision",
                self.id().unwrap_or("<unassigned>")
            ))
        })
    }

    /// Read a field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field, returning the previous value
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    /// Attach inline content to be written with the next create/update
    pub fn attach(&mut self, name: impl Into<String>, content_type: &str, content: &[u8]) {
        self.attachments
            .insert(name.into(), AttachmentStub::inline(content_type, content));
    }

    /// Convert into a domain type, backfilling identity the body did not carry
    pub fn into_typed<T>(self) -> Result<T>
    where
        T: DeserializeOwned + DocumentIdentity,
    {
        let id = self.id.clone();
        let revision = self.revision.clone();
        let mut typed: T = serde_json::from_value(self.to_body())?;
        reconcile_identity(&mut typed, id.as_deref(), revision.as_deref());
        Ok(typed)
    }

    /// Build a document from a domain type
    pub fn from_typed<T>(value: &T) -> Result<Self>
    where
        T: Serialize + DocumentIdentity,
    {
        let mut doc = Self::from_body(serde_json::to_value(value)?)?;
        if doc.id().is_none() {
            doc.id = non_empty(value.document_id()).map(String::from);
        }
        if doc.revision().is_none() {
            doc.revision = non_empty(value.document_revision()).map(String::from);
        }
        Ok(doc)
    }
}

impl DocumentIdentity for StoredDocument {
    fn document_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn document_revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    fn set_document_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn set_document_revision(&mut self, revision: String) {
        self.revision = Some(revision);
    }
}

impl<'de> Deserialize<'de> for StoredDocument {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let body = Value::deserialize(deserializer)?;
        StoredDocument::from_body(body).map_err(serde::de::Error::custom)
    }
}

fn take_string(fields: &mut Fields, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn as_non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(String::from)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
