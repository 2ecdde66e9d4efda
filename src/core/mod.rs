//! Core system foundations
//!
//! Error handling and configuration shared by every other module.

pub mod error;
pub mod config;

// Re-export commonly used items
pub use error::{Error, ErrorKind, Result};
pub use config::{Config, EndpointConfig, LoggingConfig, PoolConfig, StaleRevisionPolicy, StoreConfig};
