//! Bootstrap provisioning
//!
//! Brings a fresh store into the shape the repository layer expects:
//! every pooled database exists and carries the `_design/_repo` design
//! document, the configuration database has its `configuration` view, and
//! one configuration document exists. Runs while the pool is still in the
//! bootstrap phase, so absent data and transient outages on reads are
//! tolerated rather than fatal.

use crate::core::Result;
use crate::storage::client::RepositoryHandle;
use crate::storage::pool::ClientPool;
use crate::types::{Fields, StoredDocument, ViewQuerySpec};
use serde_json::json;
use tracing::{info, warn};

/// Design document every repository database carries
pub const REPO_DESIGN_DOC: &str = "_repo";

/// View listing configuration documents
pub const CONFIGURATION_VIEW: &str = "configuration";

/// Map source for [`CONFIGURATION_VIEW`]
pub const CONFIGURATION_MAP: &str =
    "function(doc) { if (doc.type == 'configuration')  emit(doc._id, doc) }";

/// What a provisioning run changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Databases that did not exist before
    pub databases_created: Vec<String>,
    /// Databases that got a new `_design/_repo`
    pub design_documents_created: Vec<String>,
    /// Whether a default configuration document was written
    pub configuration_created: bool,
}

/// Provisions the databases of one pool
pub struct Provisioner<'a> {
    pool: &'a ClientPool,
}

impl<'a> Provisioner<'a> {
    /// Provisioner for `pool`
    pub fn new(pool: &'a ClientPool) -> Self {
        Self { pool }
    }

    /// Provision every pooled database.
    ///
    /// Does not flip the pool to steady state; the caller does that with
    /// [`ClientPool::mark_ready`] once it is done bootstrapping.
    pub async fn run(&self) -> Result<ProvisionReport> {
        self.pool.initialize().await?;
        let mut report = ProvisionReport::default();

        for id in self.pool.repository_ids() {
            let handle = self.pool.get_handle(&id).await?;
            if handle.ensure_database_tolerant().await? == Some(true) {
                report.databases_created.push(id.clone());
            }
            if self.ensure_design_document(&handle).await? {
                report.design_documents_created.push(id.clone());
            }
        }

        let config = self.pool.config_handle().await?;
        config
            .put_view(REPO_DESIGN_DOC, CONFIGURATION_VIEW, CONFIGURATION_MAP, None)
            .await?;
        report.configuration_created = self.ensure_configuration(&config).await?;

        info!(
            databases_created = report.databases_created.len(),
            design_documents_created = report.design_documents_created.len(),
            configuration_created = report.configuration_created,
            "provisioning finished"
        );
        Ok(report)
    }

    async fn ensure_design_document(&self, handle: &RepositoryHandle) -> Result<bool> {
        let existing = handle.get_design_document_tolerant(REPO_DESIGN_DOC).await?;
        if existing.is_some() {
            return Ok(false);
        }
        let mut fields = Fields::new();
        fields.insert("language".to_string(), json!("javascript"));
        fields.insert("views".to_string(), json!({}));
        let design = StoredDocument::with_id(format!("_design/{}", REPO_DESIGN_DOC), fields);
        match handle.create_document(design).await {
            Ok(_) => Ok(true),
            // created concurrently by another node
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_configuration(&self, handle: &RepositoryHandle) -> Result<bool> {
        let spec = ViewQuerySpec::builder(REPO_DESIGN_DOC, CONFIGURATION_VIEW).build()?;
        let rows = handle.query_view_tolerant(&spec).await?;
        match rows {
            Some(result) if !result.is_empty() => Ok(false),
            Some(_) => {
                let mut fields = Fields::new();
                fields.insert("type".to_string(), json!("configuration"));
                fields.insert("configuration".to_string(), json!({}));
                let created = handle.create_tolerant(fields).await?;
                if created.is_none() {
                    warn!("default configuration could not be stored during bootstrap");
                }
                Ok(created.is_some())
            }
            None => {
                warn!("configuration view unavailable; skipping default configuration");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::storage::memory::MemoryConnector;
    use crate::storage::policy::Phase;
    use serde_json::Value;
    use std::sync::Arc;

    fn connector() -> MemoryConnector {
        let connector = MemoryConnector::new();
        connector.register_view(REPO_DESIGN_DOC, CONFIGURATION_VIEW, |doc: &Value| {
            if doc["type"] == "configuration" {
                vec![(doc["_id"].clone(), doc.clone())]
            } else {
                Vec::new()
            }
        });
        connector
    }

    #[tokio::test]
    async fn test_provision_fresh_store() {
        let connector = connector();
        let pool = ClientPool::with_connector(Config::default(), Arc::new(connector.clone()));

        let report = Provisioner::new(&pool).run().await.unwrap();
        assert_eq!(report.databases_created.len(), 3);
        assert_eq!(report.design_documents_created.len(), 3);
        assert!(report.configuration_created);
        assert!(connector.has_database("bedroom_closet"));
        assert_eq!(pool.phase(), Phase::Bootstrap);

        let config = pool.config_handle().await.unwrap();
        let design = config.get_design_document(REPO_DESIGN_DOC).await.unwrap();
        assert!(design.get("views").unwrap().get(CONFIGURATION_VIEW).is_some());
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let connector = connector();
        let pool = ClientPool::with_connector(Config::default(), Arc::new(connector.clone()));
        Provisioner::new(&pool).run().await.unwrap();
        let before = connector.document_count("nemaki_conf");

        let second = Provisioner::new(&pool).run().await.unwrap();
        assert_eq!(second, ProvisionReport::default());
        assert_eq!(connector.document_count("nemaki_conf"), before);
    }
}
