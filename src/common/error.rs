//! Error types for the control plane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Model Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // === Consensus store Errors ===
    #[error("Lock contention on {0}")]
    LockContention(String),

    // === Upstream (volume router / MDS / backend) Errors ===
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// Raised by the volume router when the backend namespace can no longer
    /// be looked up. Not fatal while destroying a filesystem.
    #[error("Master lookup failed: {0}")]
    MasterLookupFailed(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// No automatic recovery exists; an operator has to intervene.
    #[error("Fatal: {0}")]
    Fatal(String),

    // === Persistence Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[cfg(feature = "sled-backend")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Generic ===
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockContention(_) | Error::Unreachable(_) | Error::UpstreamTimeout(_)
        )
    }

    /// Errors raised by an RPC endpoint (as opposed to local model errors).
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Error::UpstreamTimeout(_)
                | Error::UpstreamError(_)
                | Error::MasterLookupFailed(_)
                | Error::NamespaceNotFound(_)
                | Error::Unreachable(_)
                | Error::Http(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::NamespaceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidParameter(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::LockContention(_) => StatusCode::CONFLICT,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamError(_) | Error::MasterLookupFailed(_) | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable name of the error kind, carried in HTTP error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::NotFound(_) => "not_found",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::InvalidParameter(_) => "invalid_parameter",
            Error::LockContention(_) => "lock_contention",
            Error::UpstreamTimeout(_) => "upstream_timeout",
            Error::UpstreamError(_) => "upstream_error",
            Error::MasterLookupFailed(_) => "master_lookup_failed",
            Error::NamespaceNotFound(_) => "namespace_not_found",
            Error::Unreachable(_) => "unreachable",
            Error::Fatal(_) => "fatal",
            Error::RocksDb(_) => "rocksdb",
            #[cfg(feature = "sled-backend")]
            Error::Sled(_) => "sled",
            Error::Serialization(_) => "serialization",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Http(_) => "http",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
            Error::Other(_) => "other",
        }
    }

    /// Rebuild an error received from a remote endpoint. Kinds that only
    /// make sense locally come back as [`Error::UpstreamError`].
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "not_found" => Error::NotFound(message),
            "precondition_failed" => Error::PreconditionFailed(message),
            "invalid_parameter" => Error::InvalidParameter(message),
            "lock_contention" => Error::LockContention(message),
            "upstream_timeout" => Error::UpstreamTimeout(message),
            "master_lookup_failed" => Error::MasterLookupFailed(message),
            "namespace_not_found" => Error::NamespaceNotFound(message),
            "unreachable" => Error::Unreachable(message),
            "fatal" => Error::Fatal(message),
            "cancelled" => Error::Cancelled,
            _ => Error::UpstreamError(message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::UpstreamTimeout(e.to_string())
        } else if e.is_connect() {
            Error::Unreachable(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
