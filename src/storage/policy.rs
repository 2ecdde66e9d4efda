//! Failure Policy
//!
//! Whether a failure is swallowed or propagated depends on the operational
//! phase. The phase is owned by the pool and shared with every handle it
//! creates; it is never inferred from the calling task.

use crate::core::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Operational phase of the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// First-run provisioning: absence of data is expected
    Bootstrap,
    /// Normal operation: absence of expected data is an error
    Ready,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Bootstrap,
            _ => Phase::Ready,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Bootstrap => 0,
            Phase::Ready => 1,
        }
    }
}

/// Shared, cheaply cloneable phase cell
#[derive(Debug, Clone)]
pub struct PhaseFlag(Arc<AtomicU8>);

impl PhaseFlag {
    /// Flag starting in `phase`
    pub fn new(phase: Phase) -> Self {
        Self(Arc::new(AtomicU8::new(phase.as_u8())))
    }

    /// Current phase
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Switch every holder to `phase`
    pub fn set(&self, phase: Phase) {
        self.0.store(phase.as_u8(), Ordering::Release);
    }
}

impl Default for PhaseFlag {
    fn default() -> Self {
        Self::new(Phase::Bootstrap)
    }
}

/// Swallow-or-propagate decision for one handle
#[derive(Debug, Clone, Default)]
pub struct FailurePolicy {
    phase: PhaseFlag,
}

impl FailurePolicy {
    /// Policy reading its phase from `phase`
    pub fn new(phase: PhaseFlag) -> Self {
        Self { phase }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Whether `error` is tolerated in the current phase.
    ///
    /// Only NotFound and StoreUnavailable are ever tolerated, and only
    /// during bootstrap. Conflicts are always propagated.
    pub fn tolerates(&self, error: &Error) -> bool {
        self.phase() == Phase::Bootstrap
            && matches!(error.kind(), ErrorKind::NotFound | ErrorKind::StoreUnavailable)
    }

    /// Turn a tolerated failure into an absent result
    pub fn absorb<T>(&self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.tolerates(&e) => {
                warn!(error = %e, "tolerating failure during bootstrap");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
