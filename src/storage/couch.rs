//! HTTP backend for CouchDB-compatible stores
//!
//! One pooled `reqwest::Client` per connector. Connection and socket
//! timeouts are fixed when the connector is built; there is no per-call
//! override. Basic credentials are attached to every request when auth is
//! enabled.

use crate::core::{Error, Result, StoreConfig};
use crate::storage::backend::{
    AttachmentStream, BulkResult, DatabaseBackend, DatabaseInfo, RevisionLookup, StoreConnector,
    WriteResult,
};
use crate::storage::endpoint::ResolvedEndpoint;
use crate::types::query::DESIGN_PREFIX;
use crate::types::{ViewQuerySpec, ViewResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Shared HTTP state of one connector and all its database handles
struct HttpCore {
    client: Client,
    base: String,
    credentials: Option<(String, Option<String>)>,
}

/// Error body returned by the store
#[derive(Debug, Default, Deserialize)]
struct StoreErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

impl HttpCore {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, pass.as_ref()),
            None => request,
        }
    }

    /// Send and map non-success statuses onto the error taxonomy.
    ///
    /// `context` names the resource (a document id for writes, so conflicts
    /// carry it); `view` selects InvalidQuery for 400 responses.
    async fn send(&self, request: RequestBuilder, context: &str, view: bool) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: StoreErrorBody = response.json().await.unwrap_or_default();
        let reason = match (body.error.is_empty(), body.reason.is_empty()) {
            (true, _) => body.reason,
            (false, true) => body.error,
            (false, false) => format!("{} ({})", body.error, body.reason),
        };
        debug!(status = status.as_u16(), %context, %reason, "store rejected request");
        Err(Error::from_status(status.as_u16(), context, &reason, view))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
        view: bool,
    ) -> Result<T> {
        Ok(self.send(request, context, view).await?.json().await?)
    }
}

/// [`StoreConnector`] over HTTP
#[derive(Clone)]
pub struct CouchConnector {
    core: Arc<HttpCore>,
}

impl CouchConnector {
    /// Build the pooled client for `endpoint`
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Resolved base address of the store
    /// * `config` - Timeouts, pool size and credentials
    pub fn new(endpoint: &ResolvedEndpoint, config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connection_timeout)
            .read_timeout(config.socket_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(concat!("cmis-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        let credentials = if config.auth_enabled {
            Some((config.username.clone().unwrap_or_default(), config.password.clone()))
        } else {
            None
        };

        Ok(Self {
            core: Arc::new(HttpCore {
                client,
                base: endpoint.as_str().to_string(),
                credentials,
            }),
        })
    }

    /// Connector factory suitable for `ClientPool`
    pub fn connect(endpoint: &ResolvedEndpoint, config: &StoreConfig) -> Result<Arc<dyn StoreConnector>> {
        Ok(Arc::new(Self::new(endpoint, config)?))
    }
}

#[async_trait]
impl StoreConnector for CouchConnector {
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/", self.core.base);
        self.core
            .send(self.core.request(Method::GET, &url), "server", false)
            .await?;
        Ok(())
    }

    fn database(&self, name: &str) -> Arc<dyn DatabaseBackend> {
        Arc::new(CouchDatabase {
            core: self.core.clone(),
            url: format!("{}/{}", self.core.base, urlencoding::encode(name)),
            name: name.to_string(),
        })
    }
}

/// Encode a document id for use in a path, keeping the design prefix literal
fn doc_path(id: &str) -> String {
    match id.strip_prefix(DESIGN_PREFIX) {
        Some(rest) => format!("{}{}", DESIGN_PREFIX, urlencoding::encode(rest)),
        None => urlencoding::encode(id).into_owned(),
    }
}

/// Path of a view relative to the database
fn view_path(spec: &ViewQuerySpec) -> String {
    format!(
        "{}{}/_view/{}",
        DESIGN_PREFIX,
        urlencoding::encode(spec.design_doc()),
        urlencoding::encode(spec.view())
    )
}

#[derive(Debug, Deserialize)]
struct AllDocsValue {
    rev: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    key: String,
    #[serde(default)]
    value: Option<AllDocsValue>,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

/// [`DatabaseBackend`] for one database over HTTP
struct CouchDatabase {
    core: Arc<HttpCore>,
    url: String,
    name: String,
}

impl CouchDatabase {
    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}", self.url, doc_path(id))
    }

    fn attachment_url(&self, id: &str, name: &str) -> String {
        format!("{}/{}", self.doc_url(id), urlencoding::encode(name))
    }
}

#[async_trait]
impl DatabaseBackend for CouchDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool> {
        let response = self.core.request(Method::HEAD, &self.url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::from_status(status.as_u16(), &self.name, "", false)),
        }
    }

    async fn create(&self) -> Result<bool> {
        let request = self.core.request(Method::PUT, &self.url);
        match self.core.send(request, &self.name, false).await {
            Ok(_) => Ok(true),
            // 412: the database already exists
            Err(Error::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn info(&self) -> Result<DatabaseInfo> {
        self.core
            .send_json(self.core.request(Method::GET, &self.url), &self.name, false)
            .await
    }

    async fn head_document(&self, id: &str) -> Result<Option<String>> {
        let response = self.core.request(Method::HEAD, &self.doc_url(id)).send().await?;
        match response.status() {
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| Error::protocol(format!("{}: HEAD response without ETag", id)))?;
                Ok(Some(etag))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::from_status(status.as_u16(), id, "", false)),
        }
    }

    async fn get_document(&self, id: &str, revision: Option<&str>) -> Result<Value> {
        let mut request = self.core.request(Method::GET, &self.doc_url(id));
        if let Some(rev) = revision {
            request = request.query(&[("rev", rev)]);
        }
        self.core.send_json(request, id, false).await
    }

    async fn put_document(&self, id: &str, body: &Value) -> Result<WriteResult> {
        let request = self.core.request(Method::PUT, &self.doc_url(id)).json(body);
        self.core.send_json(request, id, false).await
    }

    async fn post_document(&self, body: &Value) -> Result<WriteResult> {
        let request = self.core.request(Method::POST, &self.url).json(body);
        self.core.send_json(request, &self.name, false).await
    }

    async fn delete_document(&self, id: &str, revision: &str) -> Result<WriteResult> {
        let request = self
            .core
            .request(Method::DELETE, &self.doc_url(id))
            .query(&[("rev", revision)]);
        self.core.send_json(request, id, false).await
    }

    async fn bulk_docs(&self, docs: &[Value]) -> Result<Vec<BulkResult>> {
        let url = format!("{}/_bulk_docs", self.url);
        let request = self
            .core
            .request(Method::POST, &url)
            .json(&json!({ "docs": docs }));
        self.core.send_json(request, "_bulk_docs", false).await
    }

    async fn fetch_revisions(&self, ids: &[String]) -> Result<Vec<RevisionLookup>> {
        let url = format!("{}/_all_docs", self.url);
        let request = self
            .core
            .request(Method::POST, &url)
            .json(&json!({ "keys": ids }));
        let response: AllDocsResponse = self.core.send_json(request, "_all_docs", false).await?;
        Ok(response
            .rows
            .into_iter()
            .map(|row| match row.value {
                Some(value) => RevisionLookup {
                    id: row.key,
                    revision: Some(value.rev),
                    deleted: value.deleted,
                },
                None => RevisionLookup {
                    id: row.key,
                    revision: None,
                    deleted: false,
                },
            })
            .collect())
    }

    async fn query_view(&self, spec: &ViewQuerySpec) -> Result<ViewResult> {
        let url = format!("{}/{}", self.url, view_path(spec));
        let request = self
            .core
            .request(Method::POST, &url)
            .json(&spec.to_request_body());
        self.core.send_json(request, &spec.path(), true).await
    }

    async fn all_docs(&self, limit: Option<u64>, skip: Option<u64>) -> Result<ViewResult> {
        let url = format!("{}/_all_docs", self.url);
        let mut request = self
            .core
            .request(Method::GET, &url)
            .query(&[("include_docs", "true")]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(skip) = skip {
            request = request.query(&[("skip", skip)]);
        }
        self.core.send_json(request, "_all_docs", false).await
    }

    async fn get_attachment(
        &self,
        id: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Result<AttachmentStream> {
        let mut request = self.core.request(Method::GET, &self.attachment_url(id, name));
        if let Some(rev) = revision {
            request = request.query(&[("rev", rev)]);
        }
        let response = self
            .core
            .send(request, &format!("{}/{}", id, name), false)
            .await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let length = response.content_length();
        let stream = response.bytes_stream().map_err(Error::from).boxed();
        Ok(AttachmentStream::new(content_type, length, stream))
    }

    async fn put_attachment(
        &self,
        id: &str,
        revision: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<WriteResult> {
        let request = self
            .core
            .request(Method::PUT, &self.attachment_url(id, name))
            .query(&[("rev", revision)])
            .header(CONTENT_TYPE, content_type)
            .body(content);
        self.core.send_json(request, id, false).await
    }

    async fn delete_attachment(&self, id: &str, revision: &str, name: &str) -> Result<WriteResult> {
        let request = self
            .core
            .request(Method::DELETE, &self.attachment_url(id, name))
            .query(&[("rev", revision)]);
        self.core.send_json(request, id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_path_encoding() {
        assert_eq!(doc_path("plain"), "plain");
        assert_eq!(doc_path("a/b c"), "a%2Fb%20c");
        assert_eq!(doc_path("_design/_repo"), "_design/_repo");
        assert_eq!(doc_path("_design/my view"), "_design/my%20view");
    }

    #[test]
    fn test_view_path() {
        let spec = ViewQuerySpec::builder("_design/_repo", "children").build().unwrap();
        assert_eq!(view_path(&spec), "_design/_repo/_view/children");
    }
}
