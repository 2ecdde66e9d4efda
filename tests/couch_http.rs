//! Wire format of the HTTP backend against a mock store

use bytes::Bytes;
use cmis_store::core::{Config, Error, StoreConfig};
use cmis_store::storage::policy::PhaseFlag;
use cmis_store::storage::{
    ClientPool, CouchConnector, DeleteOutcome, DeploymentContext, EndpointSource, FailurePolicy,
    Phase, RepositoryHandle, ResolvedEndpoint, StoreConnector,
};
use cmis_store::types::{Fields, StoredDocument, ViewQuerySpec};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, body_partial_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.auth_enabled = true;
    config.username = Some("admin".to_string());
    config.password = Some("secret".to_string());
    config
}

fn handle(server: &MockServer) -> RepositoryHandle {
    let config = store_config();
    let endpoint = ResolvedEndpoint::parse(&server.uri(), EndpointSource::Explicit).unwrap();
    let connector = CouchConnector::new(&endpoint, &config).unwrap();
    RepositoryHandle::new(
        "bedroom",
        connector.database("bedroom"),
        &config,
        FailurePolicy::new(PhaseFlag::new(Phase::Ready)),
    )
}

fn conflict() -> ResponseTemplate {
    ResponseTemplate::new(409).set_body_json(json!({
        "error": "conflict",
        "reason": "Document update conflict."
    }))
}

#[tokio::test]
async fn pool_connects_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"couchdb": "Welcome"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.store = store_config();
    config.store.url_override = Some(server.uri());
    let pool = ClientPool::with_factory(config, DeploymentContext::default(), Arc::new(CouchConnector::connect));

    let handle = pool.get_handle("bedroom_closet").await.unwrap();
    assert_eq!(handle.repository_id(), "bedroom_closet");
    assert_eq!(pool.endpoint().await.unwrap().source(), EndpointSource::Explicit);
}

#[tokio::test]
async fn stale_update_maps_to_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/bedroom/doc-1"))
        .and(body_partial_json(json!({"_id": "doc-1", "_rev": "1-a", "name": "b"})))
        .respond_with(conflict())
        .mount(&server)
        .await;

    let mut fields = Fields::new();
    fields.insert("name".to_string(), json!("b"));
    let mut doc = StoredDocument::with_id("doc-1", fields);
    doc.revision = Some("1-a".to_string());

    match handle(&server).update(doc).await {
        Err(Error::Conflict { id }) => assert_eq!(id, "doc-1"),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn create_returns_store_assigned_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bedroom"))
        .and(body_json(json!({"name": "a"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ok": true, "id": "9f8e", "rev": "1-abc"
        })))
        .mount(&server)
        .await;

    let mut fields = Fields::new();
    fields.insert("name".to_string(), json!("a"));
    let created = handle(&server).create(fields).await.unwrap();
    assert_eq!(created.id(), Some("9f8e"));
    assert_eq!(created.revision(), Some("1-abc"));
}

#[tokio::test]
async fn view_key_is_sent_in_request_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bedroom/_design/_repo/_view/children"))
        .and(body_partial_json(json!({"key": "folder-1", "include_docs": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_rows": 5,
            "offset": 1,
            "rows": [
                {"id": "a", "key": "folder-1", "value": null,
                 "doc": {"_id": "a", "_rev": "2-x", "name": "first"}},
                {"id": "b", "key": "folder-1", "value": null,
                 "doc": {"_id": "b", "_rev": "1-y", "name": "second"}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let spec = ViewQuerySpec::builder("_repo", "children").key("folder-1").build().unwrap();
    let docs: Vec<StoredDocument> = handle(&server).query_view_as(&spec).await.unwrap();

    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].id(), Some("a"));
    assert_eq!(docs[0].revision(), Some("2-x"));
    assert_eq!(docs[1].get("name"), Some(&json!("second")));
}

#[tokio::test]
async fn view_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bedroom/_design/_repo/_view/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "not_found", "reason": "missing_named_view"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bedroom/_design/_repo/_view/children"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "query_parse_error", "reason": "Invalid value for integer: \"x\""
        })))
        .mount(&server)
        .await;

    let handle = handle(&server);
    let missing = ViewQuerySpec::builder("_repo", "missing").build().unwrap();
    assert!(handle.query_view(&missing).await.unwrap_err().is_not_found());

    let malformed = ViewQuerySpec::builder("_repo", "children").build().unwrap();
    assert!(matches!(
        handle.query_view(&malformed).await,
        Err(Error::InvalidQuery(_))
    ));
}

#[tokio::test]
async fn bulk_delete_sends_tombstones_for_live_documents() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bedroom/_all_docs"))
        .and(body_json(json!({"keys": ["a", "b", "c"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_rows": 2,
            "rows": [
                {"id": "a", "key": "a", "value": {"rev": "1-a"}},
                {"key": "b", "error": "not_found"},
                {"id": "c", "key": "c", "value": {"rev": "2-c"}}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bedroom/_bulk_docs"))
        .and(body_json(json!({"docs": [
            {"_id": "a", "_rev": "1-a", "_deleted": true},
            {"_id": "c", "_rev": "2-c", "_deleted": true}
        ]})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            {"ok": true, "id": "a", "rev": "2-a"},
            {"id": "c", "error": "conflict", "reason": "Document update conflict."}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let report = handle(&server).bulk_delete(ids).await.unwrap();

    assert_eq!(report.deleted_count(), 1);
    assert_eq!(report.skipped_count(), 1);
    assert_eq!(report.failed_ids().collect::<Vec<_>>(), vec!["c"]);
}

#[tokio::test]
async fn stale_delete_uses_revision_from_etag() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/bedroom/doc-1"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"3-abc\""))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/bedroom/doc-1"))
        .and(query_param("rev", "3-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true, "id": "doc-1", "rev": "4-def"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = handle(&server).delete("doc-1", "1-old").await.unwrap();
    assert_eq!(
        outcome,
        DeleteOutcome::Deleted {
            revision: "4-def".to_string(),
            refreshed: true
        }
    );
}

#[tokio::test]
async fn delete_of_missing_document_is_already_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/bedroom/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let outcome = handle(&server).delete("gone", "2-x").await.unwrap();
    assert_eq!(outcome, DeleteOutcome::AlreadyDeleted);
}

#[tokio::test]
async fn ensure_database_tolerates_existing() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/bedroom"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "error": "file_exists",
            "reason": "The database could not be created, the file already exists."
        })))
        .mount(&server)
        .await;

    assert!(!handle(&server).ensure_database().await.unwrap());
}

#[tokio::test]
async fn attachments_stream_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bedroom/doc-1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"%PDF-1.7".to_vec(), "application/pdf"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bedroom/doc-1/notes"))
        .and(query_param("rev", "1-a"))
        .and(header("content-type", "text/plain"))
        .and(body_string("hi"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ok": true, "id": "doc-1", "rev": "2-b"
        })))
        .mount(&server)
        .await;

    let handle = handle(&server);
    let stream = handle.get_attachment("doc-1", "content", None).await.unwrap();
    assert_eq!(stream.content_type, "application/pdf");
    assert_eq!(stream.into_bytes().await.unwrap(), Bytes::from_static(b"%PDF-1.7"));

    let rev = handle
        .put_attachment("doc-1", "1-a", "notes", Bytes::from_static(b"hi"), "text/plain")
        .await
        .unwrap();
    assert_eq!(rev, "2-b");
}

#[tokio::test]
async fn server_errors_are_store_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bedroom/doc-1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = handle(&server).get("doc-1").await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
}

/// Serves one response whose body trickles in a byte at a time
async fn trickling_server(body: &'static [u8], pause: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        for byte in body {
            tokio::time::sleep(pause).await;
            socket.write_all(&[*byte]).await.unwrap();
            socket.flush().await.unwrap();
        }
    });
    format!("http://{}", address)
}

#[tokio::test]
async fn slow_attachment_outlives_socket_timeout_while_bytes_arrive() {
    let url = trickling_server(b"abcdef", Duration::from_millis(150)).await;
    let mut config = store_config();
    config.socket_timeout = Duration::from_millis(400);
    let endpoint = ResolvedEndpoint::parse(&url, EndpointSource::Explicit).unwrap();
    let connector = CouchConnector::new(&endpoint, &config).unwrap();
    let handle = RepositoryHandle::new(
        "bedroom",
        connector.database("bedroom"),
        &config,
        FailurePolicy::new(PhaseFlag::new(Phase::Ready)),
    );

    let started = Instant::now();
    let bytes = handle.get_attachment_bytes("doc-1", "content", None).await.unwrap();
    assert_eq!(bytes, Bytes::from_static(b"abcdef"));
    assert!(started.elapsed() > config.socket_timeout);
}
