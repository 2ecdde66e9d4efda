//! View query descriptions and result rows

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix every design document id carries
pub const DESIGN_PREFIX: &str = "_design/";

/// Immutable description of one view query.
///
/// Built through [`ViewQuerySpec::builder`]; the builder validates option
/// combinations the store would reject anyway.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewQuerySpec {
    design_doc: String,
    view: String,
    key: Option<Value>,
    keys: Option<Vec<Value>>,
    start_key: Option<Value>,
    end_key: Option<Value>,
    limit: Option<u64>,
    skip: Option<u64>,
    include_docs: bool,
    reduce: Option<bool>,
    group: bool,
    descending: bool,
}

impl ViewQuerySpec {
    /// Start a query against `design_doc` / `view`.
    ///
    /// The design document may be given with or without its `_design/` prefix.
    pub fn builder(design_doc: impl Into<String>, view: impl Into<String>) -> ViewQuerySpecBuilder {
        ViewQuerySpecBuilder::new(design_doc, view)
    }

    /// Design document name without prefix
    pub fn design_doc(&self) -> &str {
        &self.design_doc
    }

    /// View name
    pub fn view(&self) -> &str {
        &self.view
    }

    /// Exact-match key, if any
    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Multi-key filter, if any
    pub fn keys(&self) -> Option<&[Value]> {
        self.keys.as_deref()
    }

    /// Inclusive lower bound
    pub fn start_key(&self) -> Option<&Value> {
        self.start_key.as_ref()
    }

    /// Inclusive upper bound
    pub fn end_key(&self) -> Option<&Value> {
        self.end_key.as_ref()
    }

    /// Row limit
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Rows to skip
    pub fn skip(&self) -> Option<u64> {
        self.skip
    }

    /// Whether full bodies are requested
    pub fn include_docs(&self) -> bool {
        self.include_docs
    }

    /// Explicit reduce flag; `None` leaves the store default
    pub fn reduce(&self) -> Option<bool> {
        self.reduce
    }

    /// Group flag
    pub fn group(&self) -> bool {
        self.group
    }

    /// Descending order flag
    pub fn descending(&self) -> bool {
        self.descending
    }

    /// Design document id including the prefix
    pub fn design_id(&self) -> String {
        format!("{}{}", DESIGN_PREFIX, self.design_doc)
    }

    /// Store-relative path of the view, e.g. `_design/_repo/_view/children`
    pub fn path(&self) -> String {
        format!("{}/_view/{}", self.design_id(), self.view)
    }

    /// Copy of this query that always returns full document bodies.
    ///
    /// Typed mapping needs the bodies, so reduce is switched off as well.
    pub fn with_documents(&self) -> Self {
        let mut spec = self.clone();
        spec.include_docs = true;
        spec.reduce = Some(false);
        spec.group = false;
        spec
    }

    /// Store-native request body.
    ///
    /// Every option is sent in the POST body, so key filters are always
    /// evaluated by the store.
    pub fn to_request_body(&self) -> Value {
        let mut body = Map::new();
        if let Some(key) = &self.key {
            body.insert("key".to_string(), key.clone());
        }
        if let Some(keys) = &self.keys {
            body.insert("keys".to_string(), Value::Array(keys.clone()));
        }
        if let Some(start) = &self.start_key {
            body.insert("startkey".to_string(), start.clone());
        }
        if let Some(end) = &self.end_key {
            body.insert("endkey".to_string(), end.clone());
        }
        if let Some(limit) = self.limit {
            body.insert("limit".to_string(), Value::from(limit));
        }
        if let Some(skip) = self.skip {
            body.insert("skip".to_string(), Value::from(skip));
        }
        if self.include_docs {
            body.insert("include_docs".to_string(), Value::Bool(true));
        }
        if let Some(reduce) = self.reduce {
            body.insert("reduce".to_string(), Value::Bool(reduce));
        }
        if self.group {
            body.insert("group".to_string(), Value::Bool(true));
        }
        if self.descending {
            body.insert("descending".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

/// Builder for [`ViewQuerySpec`]
#[derive(Debug, Clone)]
pub struct ViewQuerySpecBuilder {
    spec: ViewQuerySpec,
}

impl ViewQuerySpecBuilder {
    fn new(design_doc: impl Into<String>, view: impl Into<String>) -> Self {
        let design_doc = design_doc.into();
        let design_doc = design_doc
            .strip_prefix(DESIGN_PREFIX)
            .map(String::from)
            .unwrap_or(design_doc);
        Self {
            spec: ViewQuerySpec {
                design_doc,
                view: view.into(),
                ..ViewQuerySpec::default()
            },
        }
    }

    /// Exact-match key filter
    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.spec.key = Some(key.into());
        self
    }

    /// Multi-key filter
    pub fn keys<I, V>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.spec.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Range lower bound
    pub fn start_key(mut self, key: impl Into<Value>) -> Self {
        self.spec.start_key = Some(key.into());
        self
    }

    /// Range upper bound
    pub fn end_key(mut self, key: impl Into<Value>) -> Self {
        self.spec.end_key = Some(key.into());
        self
    }

    /// Maximum number of rows
    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    /// Rows to skip before returning
    pub fn skip(mut self, skip: u64) -> Self {
        self.spec.skip = Some(skip);
        self
    }

    /// Return full document bodies
    pub fn include_docs(mut self, include: bool) -> Self {
        self.spec.include_docs = include;
        self
    }

    /// Force the reduce function on or off
    pub fn reduce(mut self, reduce: bool) -> Self {
        self.spec.reduce = Some(reduce);
        self
    }

    /// Group reduced rows by key
    pub fn group(mut self, group: bool) -> Self {
        self.spec.group = group;
        self
    }

    /// Walk the index in reverse
    pub fn descending(mut self, descending: bool) -> Self {
        self.spec.descending = descending;
        self
    }

    /// Validate and freeze the query
    pub fn build(self) -> Result<ViewQuerySpec> {
        let spec = self.spec;
        if spec.design_doc.is_empty() {
            return Err(Error::invalid_argument("View query needs a design document"));
        }
        if spec.view.is_empty() {
            return Err(Error::invalid_argument("View query needs a view name"));
        }
        if spec.key.is_some() && spec.keys.is_some() {
            return Err(Error::invalid_argument("'key' and 'keys' are mutually exclusive"));
        }
        if spec.group && spec.reduce == Some(false) {
            return Err(Error::invalid_argument("'group' requires reduce"));
        }
        if spec.include_docs && spec.reduce == Some(true) {
            return Err(Error::invalid_argument("'include_docs' is invalid for reduce queries"));
        }
        Ok(spec)
    }
}

/// One row of a view result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultRow {
    /// Envelope id; absent for reduced rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Emitted key
    #[serde(default)]
    pub key: Value,

    /// Emitted value
    #[serde(default)]
    pub value: Value,

    /// Full body when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl QueryResultRow {
    /// Envelope revision: the body's `_rev`, else a `rev` carried in the value
    pub fn envelope_revision(&self) -> Option<&str> {
        self.doc
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .filter(|rev| !rev.is_empty())
            .or_else(|| self.value.get("rev").and_then(Value::as_str))
            .filter(|rev| !rev.is_empty())
    }
}

/// A complete view response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewResult {
    /// Rows in the view before filtering; absent for reduced results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,

    /// Position of the first returned row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Returned rows
    #[serde(default)]
    pub rows: Vec<QueryResultRow>,
}

impl ViewResult {
    /// Number of returned rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
