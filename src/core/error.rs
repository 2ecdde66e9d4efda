//! Error types and handling for the storage connector
//!
//! Every operation returns an explicit `Result` whose error can be collapsed
//! into an [`ErrorKind`] so the CMIS layer can pattern-match on the class of
//! failure instead of inspecting messages.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage connector
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document, database, attachment or view definition absent
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Write rejected because the supplied revision is no longer current
    #[error("Revision conflict on document {id}")]
    Conflict {
        /// Identifier of the contested document
        id: String,
    },

    /// Caller supplied a missing or malformed id/revision/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store rejected a view request as malformed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Connectivity, timeout or server-side failure
    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store rejected our credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Some documents of a bulk mutation were not committed
    #[error("Bulk operation partially failed: {failed} of {total} documents failed")]
    PartialBatchFailure {
        /// Number of documents whose mutation failed
        failed: usize,
        /// Number of documents the operation targeted
        total: usize,
    },

    /// Pool start-up exhausted its connection attempts
    #[error("Initialization failed after {attempts} attempts: {reason}")]
    Initialization {
        /// Attempts made before giving up
        attempts: u32,
        /// Last observed failure
        reason: String,
    },

    /// The store answered with something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Id, attachment or named view/query definition absent
    NotFound,
    /// Revision mismatch on write
    Conflict,
    /// Missing id/revision or malformed request
    InvalidArgument,
    /// Connectivity, timeout or transport failure
    StoreUnavailable,
    /// Some documents in a bulk operation failed
    PartialBatchFailure,
    /// Anything the caller cannot recover from locally
    Fatal,
}

impl ErrorKind {
    /// Stable label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::PartialBatchFailure => "partial_batch_failure",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a conflict error for a document id
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a store unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Collapse this error into its taxonomy class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidArgument(_) | Error::InvalidQuery(_) => ErrorKind::InvalidArgument,
            Error::StoreUnavailable(_) | Error::Unauthorized(_) | Error::Io(_) => {
                ErrorKind::StoreUnavailable
            }
            Error::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Error::Config(_)
            | Error::Initialization { .. }
            | Error::Protocol(_)
            | Error::Serialization(_)
            | Error::Metrics(_) => ErrorKind::Fatal,
        }
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this is a revision conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Io(_))
    }

    /// Map an HTTP status returned by the store onto the taxonomy.
    ///
    /// `context` names the resource for the message; `view` selects the
    /// malformed-query variant for 400 responses from view endpoints.
    pub fn from_status(status: u16, context: &str, reason: &str, view: bool) -> Self {
        let detail = if reason.is_empty() {
            context.to_string()
        } else {
            format!("{}: {}", context, reason)
        };
        match status {
            404 => Error::NotFound(detail),
            409 | 412 => Error::Conflict { id: context.to_string() },
            400 if view => Error::InvalidQuery(detail),
            400 => Error::InvalidArgument(detail),
            401 | 403 => Error::Unauthorized(detail),
            _ => Error::StoreUnavailable(format!("HTTP {} for {}", status, detail)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::StoreUnavailable(format!("timed out: {}", err))
        } else if err.is_decode() {
            Error::Protocol(format!("undecodable response: {}", err))
        } else if let Some(status) = err.status() {
            Error::from_status(status.as_u16(), "request", &err.to_string(), false)
        } else {
            Error::StoreUnavailable(err.to_string())
        }
    }
}
