//! System utilities and monitoring
//!
//! Prometheus metrics for every store operation.

pub mod metrics;
