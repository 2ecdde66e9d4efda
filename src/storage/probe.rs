//! Connection Prober
//!
//! Cheap reachability checks used by the operator `check` command and
//! available to callers that want to test the store before doing real work.

use crate::core::{Error, Result, StoreConfig};
use crate::storage::backend::StoreConnector;
use crate::storage::endpoint::ResolvedEndpoint;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe answered
    Reachable {
        /// Time to answer
        latency: Duration,
    },
    /// Probe failed
    Unreachable {
        /// Failure description
        reason: String,
    },
}

impl ProbeOutcome {
    /// Whether the probe succeeded
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }

    fn from_result(result: Result<Duration>) -> Self {
        match result {
            Ok(latency) => ProbeOutcome::Reachable { latency },
            Err(e) => ProbeOutcome::Unreachable { reason: e.to_string() },
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Reachable { latency } => write!(f, "reachable ({} ms)", latency.as_millis()),
            ProbeOutcome::Unreachable { reason } => write!(f, "unreachable: {}", reason),
        }
    }
}

/// Socket and HTTP outcome for one endpoint
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Redacted endpoint
    pub endpoint: String,
    /// TCP connect result
    pub socket: ProbeOutcome,
    /// HTTP ping result
    pub http: ProbeOutcome,
}

impl ProbeReport {
    /// Both probes succeeded
    pub fn is_healthy(&self) -> bool {
        self.socket.is_reachable() && self.http.is_reachable()
    }
}

/// Bounded reachability checks
#[derive(Debug, Clone, Copy)]
pub struct ConnectionProber {
    timeout: Duration,
}

impl ConnectionProber {
    /// Prober bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Prober bounded by the configured connection timeout
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.connection_timeout)
    }

    /// Open and drop a TCP connection to the endpoint
    pub async fn probe_socket(&self, endpoint: &ResolvedEndpoint) -> Result<Duration> {
        let address = endpoint.socket_address();
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => {
                debug!(%address, "socket probe succeeded");
                Ok(started.elapsed())
            }
            Ok(Err(e)) => Err(Error::unavailable(format!("connect to {} failed: {}", address, e))),
            Err(_) => Err(Error::unavailable(format!(
                "connect to {} timed out after {:?}",
                address, self.timeout
            ))),
        }
    }

    /// Issue the connector's lightweight HTTP request
    pub async fn probe_http(&self, connector: &dyn StoreConnector) -> Result<Duration> {
        let started = Instant::now();
        match timeout(self.timeout, connector.ping()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::unavailable(format!(
                "store did not answer within {:?}",
                self.timeout
            ))),
        }
    }

    /// Run both probes
    pub async fn probe(&self, endpoint: &ResolvedEndpoint, connector: &dyn StoreConnector) -> ProbeReport {
        ProbeReport {
            endpoint: endpoint.to_string(),
            socket: ProbeOutcome::from_result(self.probe_socket(endpoint).await),
            http: ProbeOutcome::from_result(self.probe_http(connector).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::endpoint::EndpointSource;
    use crate::storage::memory::MemoryConnector;
    use tokio::net::TcpListener;

    fn endpoint_for(port: u16) -> ResolvedEndpoint {
        ResolvedEndpoint::parse(&format!("http://127.0.0.1:{}", port), EndpointSource::Explicit).unwrap()
    }

    #[tokio::test]
    async fn test_socket_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = ConnectionProber::new(Duration::from_secs(2));
        assert!(prober.probe_socket(&endpoint_for(port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_socket_probe_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let prober = ConnectionProber::new(Duration::from_secs(2));
        let err = prober.probe_socket(&endpoint_for(port)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_probe_through_connector() {
        let connector = MemoryConnector::new();
        let prober = ConnectionProber::new(Duration::from_secs(1));
        assert!(prober.probe_http(&connector).await.is_ok());

        connector.set_unreachable(true);
        let report = prober.probe(&endpoint_for(1), &connector).await;
        assert!(!report.http.is_reachable());
        assert!(!report.is_healthy());
        assert!(report.http.to_string().starts_with("unreachable"));
    }
}
