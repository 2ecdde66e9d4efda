//! CMIS Store - revision-aware storage connector for a CMIS repository
//!
//! Bridges the CMIS object model to a CouchDB-style document store where
//! every document carries a revision token. The connector owns one client
//! per database, discovers where the store lives, resolves stale-revision
//! deletes, splits large deletes into bounded bulk requests, and maps view
//! rows onto typed domain objects.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;
pub mod types;

// Main functional modules
pub mod storage;
pub mod system;

// Re-export commonly used items for convenience
pub use core::{Config, Error, ErrorKind, Result};
pub use storage::{ClientPool, DeleteOutcome, Phase, RepositoryHandle};
pub use types::{StoredDocument, ViewQuerySpec};

use core::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice
/// is an error rather than a panic.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| Error::config(format!("Logging already initialized: {}", e)))?;

    tracing::debug!("Initialized logging for {} v{}", NAME, VERSION);
    Ok(())
}
