//! Client Pool
//!
//! Owns exactly one [`RepositoryHandle`] per database for the life of the
//! process. Initialization is the only serialization point: one caller runs
//! the connect-and-retry loop under the init lock while concurrent callers
//! wait on the same lock and then observe the finished state. Once warm,
//! handle lookups are lock-free map reads.

use crate::core::{Config, Error, Result, StoreConfig};
use crate::storage::backend::StoreConnector;
use crate::storage::client::RepositoryHandle;
use crate::storage::couch::CouchConnector;
use crate::storage::endpoint::{self, DeploymentContext, ResolvedEndpoint};
use crate::storage::policy::{FailurePolicy, Phase, PhaseFlag};
use crate::system::metrics;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Builds a connector for a resolved endpoint
pub type ConnectorFactory =
    Arc<dyn Fn(&ResolvedEndpoint, &StoreConfig) -> Result<Arc<dyn StoreConnector>> + Send + Sync>;

/// State guarded by the init lock
#[derive(Default)]
struct InitState {
    endpoint: Option<ResolvedEndpoint>,
    connector: Option<Arc<dyn StoreConnector>>,
    /// Set once retries are exhausted; initialization is not attempted again
    failure: Option<(u32, String)>,
}

/// Process-wide pool of repository handles
pub struct ClientPool {
    config: Config,
    context: DeploymentContext,
    factory: ConnectorFactory,
    handles: DashMap<String, Arc<RepositoryHandle>>,
    initialized: AtomicBool,
    init: Mutex<InitState>,
    phase: PhaseFlag,
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("initialized", &self.is_initialized())
            .field("phase", &self.phase())
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl ClientPool {
    /// Pool talking HTTP to the endpoint resolved from `config` and the
    /// current process environment
    pub fn new(config: Config) -> Self {
        let context = DeploymentContext::detect(&config.endpoint.url_env_var);
        Self::with_factory(config, context, Arc::new(CouchConnector::connect))
    }

    /// Pool with an explicit deployment context and connector factory
    pub fn with_factory(config: Config, context: DeploymentContext, factory: ConnectorFactory) -> Self {
        Self {
            config,
            context,
            factory,
            handles: DashMap::new(),
            initialized: AtomicBool::new(false),
            init: Mutex::new(InitState::default()),
            phase: PhaseFlag::new(Phase::Bootstrap),
        }
    }

    /// Pool over an already-built connector, ignoring the environment
    pub fn with_connector(config: Config, connector: Arc<dyn StoreConnector>) -> Self {
        Self::with_factory(
            config,
            DeploymentContext::default(),
            Arc::new(
                move |_: &ResolvedEndpoint, _: &StoreConfig| -> Result<Arc<dyn StoreConnector>> {
                    Ok(connector.clone())
                },
            ),
        )
    }

    /// Configuration the pool was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether initialization has succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Current operational phase
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Leave bootstrap; tolerated failures become hard errors from now on
    pub fn mark_ready(&self) {
        if self.phase.get() != Phase::Ready {
            info!("storage connector entering steady state");
            self.phase.set(Phase::Ready);
        }
    }

    /// Connect to the store and create every handle.
    ///
    /// Idempotent. Tries to reach the store up to `pool.init_max_attempts`
    /// times, `pool.init_retry_delay` apart; exhausting them is fatal and
    /// every later call reports the same failure.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let mut state = self.init.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        if let Some((attempts, reason)) = &state.failure {
            return Err(Error::Initialization {
                attempts: *attempts,
                reason: reason.clone(),
            });
        }

        let endpoint = endpoint::resolve(&self.config, &self.context)?;
        info!(endpoint = %endpoint, source = endpoint.source().as_str(), "resolved document store endpoint");
        let connector = (self.factory)(&endpoint, &self.config.store)?;

        let max_attempts = self.config.pool.init_max_attempts.max(1);
        let delay = self.config.pool.init_retry_delay;
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            metrics::record_init_attempt();
            match connector.ping().await {
                Ok(()) => {
                    info!(attempt, "connected to document store");
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "document store not reachable");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        if let Some(e) = last_error {
            let reason = e.to_string();
            error!(attempts = max_attempts, %reason, "giving up on document store");
            state.failure = Some((max_attempts, reason.clone()));
            return Err(Error::Initialization {
                attempts: max_attempts,
                reason,
            });
        }

        for name in self.config.pool.database_names() {
            let db = connector.database(&name);
            match db.exists().await {
                Ok(true) => {}
                Ok(false) => warn!(database = %name, "database does not exist yet"),
                Err(e) => warn!(database = %name, error = %e, "could not verify database"),
            }
            let policy = FailurePolicy::new(self.phase.clone());
            self.handles
                .entry(name.clone())
                .or_insert_with(|| Arc::new(RepositoryHandle::new(name, db, &self.config.store, policy)));
        }

        state.endpoint = Some(endpoint);
        state.connector = Some(connector);
        self.initialized.store(true, Ordering::Release);
        info!(handles = self.handles.len(), "client pool initialized");
        Ok(())
    }

    /// Handle for `repository_id`, initializing the pool first if needed.
    ///
    /// An id the pool does not know is NotFound, distinct from a
    /// connectivity failure.
    pub async fn get_handle(&self, repository_id: &str) -> Result<Arc<RepositoryHandle>> {
        if !self.is_initialized() {
            self.initialize().await?;
        }
        self.handles
            .get(repository_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("Unknown repository: {}", repository_id)))
    }

    /// Handle for the configuration database
    pub async fn config_handle(&self) -> Result<Arc<RepositoryHandle>> {
        let name = self.config.pool.config_database.clone();
        self.get_handle(&name).await
    }

    /// Ids of every pooled database, sorted
    pub fn repository_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of cached handles
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Endpoint chosen during initialization
    pub async fn endpoint(&self) -> Option<ResolvedEndpoint> {
        self.init.lock().await.endpoint.clone()
    }

    /// Connector created during initialization
    pub async fn connector(&self) -> Option<Arc<dyn StoreConnector>> {
        self.init.lock().await.connector.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryConnector;

    fn config() -> Config {
        let mut config = Config::default();
        config.pool.repositories = vec!["bedroom".to_string()];
        config
    }

    #[tokio::test]
    async fn test_handles_for_every_database() {
        let connector = MemoryConnector::with_databases(["nemaki_conf", "bedroom"]);
        let pool = ClientPool::with_connector(config(), Arc::new(connector));
        pool.initialize().await.unwrap();

        assert_eq!(
            pool.repository_ids(),
            vec!["bedroom", "bedroom_closet", "nemaki_conf"]
        );
        assert_eq!(pool.phase(), Phase::Bootstrap);
        assert!(pool.endpoint().await.is_some());
    }

    #[tokio::test]
    async fn test_get_handle_initializes_lazily() {
        let connector = MemoryConnector::new();
        let pool = ClientPool::with_connector(config(), Arc::new(connector.clone()));
        assert!(!pool.is_initialized());

        let handle = pool.get_handle("bedroom").await.unwrap();
        assert_eq!(handle.repository_id(), "bedroom");
        assert!(pool.is_initialized());
        assert_eq!(connector.ping_attempts(), 1);

        // same handle every time, no further pings
        let again = pool.get_handle("bedroom").await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        pool.initialize().await.unwrap();
        assert_eq!(connector.ping_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let pool = ClientPool::with_connector(config(), Arc::new(MemoryConnector::new()));
        let err = pool.get_handle("attic").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mark_ready_reaches_handles() {
        let pool = ClientPool::with_connector(config(), Arc::new(MemoryConnector::new()));
        let handle = pool.get_handle("bedroom").await.unwrap();
        assert_eq!(handle.phase(), Phase::Bootstrap);
        pool.mark_ready();
        assert_eq!(handle.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_config_error() {
        let mut config = config();
        config.store.url = "mailto:nobody".to_string();
        let pool = ClientPool::with_connector(config, Arc::new(MemoryConnector::new()));
        assert!(matches!(pool.initialize().await, Err(Error::Config(_))));
    }
}
