//! View Query Builder and row mapping
//!
//! Queries are sent as one POST per view with every option in the body, so
//! key filtering always happens in the store. Typed mapping requests full
//! document bodies and reconciles identity in two steps: generic
//! deserialization first, then envelope id/revision backfilled where the
//! body did not provide them.

use crate::core::Result;
use crate::storage::backend::DatabaseBackend;
use crate::types::document::reconcile_identity;
use crate::types::{DocumentIdentity, QueryResultRow, StoredDocument, ViewQuerySpec, ViewResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Run `spec` as given
pub async fn query(db: &dyn DatabaseBackend, spec: &ViewQuerySpec) -> Result<ViewResult> {
    let result = db.query_view(spec).await?;
    debug!(
        database = db.name(),
        view = %spec.path(),
        rows = result.rows.len(),
        "view query"
    );
    Ok(result)
}

/// Run `spec` with full bodies and map every row into `T`
pub async fn query_typed<T>(db: &dyn DatabaseBackend, spec: &ViewQuerySpec) -> Result<Vec<T>>
where
    T: DeserializeOwned + DocumentIdentity,
{
    let result = query(db, &spec.with_documents()).await?;
    map_rows(result.rows)
}

/// Map rows carrying a body into `T`; rows without a body are skipped
pub fn map_rows<T>(rows: Vec<QueryResultRow>) -> Result<Vec<T>>
where
    T: DeserializeOwned + DocumentIdentity,
{
    let mut mapped = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(typed) = map_row(row)? {
            mapped.push(typed);
        }
    }
    Ok(mapped)
}

/// Map one row into `T`, `None` when the row has no body
pub fn map_row<T>(row: QueryResultRow) -> Result<Option<T>>
where
    T: DeserializeOwned + DocumentIdentity,
{
    let revision = row.envelope_revision().map(String::from);
    let body = match row.doc {
        Some(Value::Null) | None => return Ok(None),
        Some(body) => body,
    };
    let mut typed: T = serde_json::from_value(body)?;
    reconcile_identity(&mut typed, row.id.as_deref(), revision.as_deref());
    Ok(Some(typed))
}

/// Rows with bodies as generic documents
pub fn rows_to_documents(rows: Vec<QueryResultRow>) -> Result<Vec<StoredDocument>> {
    map_rows(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    /// Exposes identity only through accessors, like most domain objects
    #[derive(Debug, Default, Deserialize)]
    struct Content {
        #[serde(skip)]
        object_id: String,
        #[serde(skip)]
        change_token: String,
        name: String,
    }

    impl DocumentIdentity for Content {
        fn document_id(&self) -> Option<&str> {
            Some(&self.object_id)
        }
        fn document_revision(&self) -> Option<&str> {
            Some(&self.change_token)
        }
        fn set_document_id(&mut self, id: String) {
            self.object_id = id;
        }
        fn set_document_revision(&mut self, revision: String) {
            self.change_token = revision;
        }
    }

    /// Carries identity in the body under the store's names
    #[derive(Debug, Deserialize)]
    struct Raw {
        #[serde(rename = "_id")]
        id: String,
        #[serde(rename = "_rev", default)]
        rev: String,
    }

    impl DocumentIdentity for Raw {
        fn document_id(&self) -> Option<&str> {
            Some(&self.id)
        }
        fn document_revision(&self) -> Option<&str> {
            Some(&self.rev)
        }
        fn set_document_id(&mut self, id: String) {
            self.id = id;
        }
        fn set_document_revision(&mut self, revision: String) {
            self.rev = revision;
        }
    }

    fn row(value: Value) -> QueryResultRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_envelope_backfills_accessor_identity() {
        let rows = vec![row(json!({
            "id": "obj-1",
            "key": "parent",
            "value": null,
            "doc": {"_id": "obj-1", "_rev": "7-abc", "name": "report.pdf"}
        }))];
        let mapped: Vec<Content> = map_rows(rows).unwrap();
        assert_eq!(mapped[0].object_id, "obj-1");
        assert_eq!(mapped[0].change_token, "7-abc");
        assert_eq!(mapped[0].name, "report.pdf");
    }

    #[test]
    fn test_body_identity_wins() {
        let rows = vec![row(json!({
            "id": "envelope-id",
            "key": 1,
            "value": {"rev": "1-envelope"},
            "doc": {"_id": "body-id", "_rev": "2-body"}
        }))];
        let mapped: Vec<Raw> = map_rows(rows).unwrap();
        assert_eq!(mapped[0].id, "body-id");
        assert_eq!(mapped[0].rev, "2-body");
    }

    #[test]
    fn test_empty_body_revision_backfilled_from_value() {
        let rows = vec![row(json!({
            "id": "a",
            "key": "a",
            "value": {"rev": "3-v"},
            "doc": {"_id": "a", "_rev": ""}
        }))];
        let mapped: Vec<Raw> = map_rows(rows).unwrap();
        assert_eq!(mapped[0].rev, "3-v");
    }

    #[test]
    fn test_rows_without_body_skipped() {
        let rows = vec![
            row(json!({"id": "a", "key": "a", "value": 1})),
            row(json!({"id": "b", "key": "b", "value": 1, "doc": null})),
            row(json!({"id": "c", "key": "c", "value": 1, "doc": {"_id": "c", "_rev": "1-c", "x": 1}})),
        ];
        let docs = rows_to_documents(rows).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), Some("c"));
        assert_eq!(docs[0].get("x"), Some(&json!(1)));
    }
}
