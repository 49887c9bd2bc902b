//! Error types for prompt-sync

use thiserror::Error;

/// Errors surfaced by the relational store and its DAOs.
///
/// Engine-specific failures (constraint violations, busy database, ...) are
/// always folded into `OperationFailed` so callers never match on rusqlite
/// error shapes.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database operation '{operation}' failed: {message}")]
    OperationFailed {
        operation: &'static str,
        message: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Setting '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("The sentinel category cannot be deleted")]
    SentinelCategory,
}

impl StoreError {
    pub(crate) fn operation(operation: &'static str, err: impl std::fmt::Display) -> Self {
        tracing::error!(operation, error = %err, "database operation failed");
        StoreError::OperationFailed {
            operation,
            message: err.to_string(),
        }
    }
}

/// Errors from the legacy flat key-value store
#[derive(Error, Debug)]
pub enum FlatStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Flat store error: {0}")]
    FlatStore(#[from] FlatStoreError),

    #[error("Failed to write migration backup: {0}")]
    Backup(#[source] std::io::Error),

    #[error("Legacy data under '{key}' is not valid: {message}")]
    LegacyData { key: String, message: String },
}

/// Failures crossing the persistence RPC boundary
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Persistence host is not available")]
    Unavailable,

    #[error("{0}")]
    Remote(String),

    #[error("Malformed response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RpcError {
    /// The host could not be reached or answered with something unreadable.
    /// `Remote` errors are answers from the store and are not included.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Unavailable | RpcError::Decode(_))
    }
}

/// Transport-level failures from a cloud backend
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Credentials rejected (HTTP {status})")]
    Credentials { status: u16 },

    #[error("Remote file not found: {0}")]
    NotFound(String),

    #[error("Transient server error (HTTP {status}): {message}")]
    Transient { status: u16, message: String },

    #[error("Request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Cloud provider is not configured")]
    NotConfigured,
}

impl CloudError {
    /// Map a non-2xx status to a typed failure
    pub fn from_status(status: u16, message: impl Into<String>, path: &str) -> Self {
        match status {
            401 | 403 => CloudError::Credentials { status },
            404 => CloudError::NotFound(path.to_string()),
            429 | 500..=599 => CloudError::Transient {
                status,
                message: message.into(),
            },
            _ => CloudError::Http {
                status,
                message: message.into(),
            },
        }
    }

    /// Whether the caller is advised to retry later
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Transient { .. } => true,
            CloudError::Request(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Flat store error: {0}")]
    FlatStore(#[from] FlatStoreError),

    #[error("Invalid sync data: {0}")]
    InvalidData(String),

    #[error("Conflict between local ({local_checksum}) and remote ({remote_checksum}) requires manual resolution")]
    ConflictUnresolved {
        local_checksum: String,
        remote_checksum: String,
    },

    #[error("Cloud sync is disabled")]
    Disabled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Auto-sync needs a running Tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type CloudResult<T> = std::result::Result<T, CloudError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;
