//! Error types and backend fault translation.
//!
//! Trellis defines a small set of common error conditions that every backend
//! adapter must translate its native faults into at the boundary. Callers
//! never see engine-specific exception types; they see this taxonomy plus
//! whatever latency internal retries added.

use thiserror::Error;

/// Common store error conditions.
///
/// Adapters translate native backend faults into these variants at the
/// contract boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or a request could not complete.
    ///
    /// Fatal to the calling operation. The contract layer does not retry
    /// this; callers may retry the whole operation.
    #[error("backend connection failed: {message}")]
    Connection { message: String },

    /// Requested key (or the table scoping an enumeration) is absent.
    ///
    /// Expected and recoverable; routinely caught by callers to choose
    /// between create and update paths. Never retried.
    #[error("key not found: {table}/{key}")]
    KeyNotFound { table: String, key: String },

    /// Table does not exist.
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Session/lease expiry or optimistic version conflict.
    ///
    /// Retried internally by adapters up to a bounded attempt budget, then
    /// surfaced as [`StoreError::Connection`].
    #[error("transient backend fault: {message}")]
    Transient { message: String },

    /// Malformed endpoint/host list or invalid tuning at initialization.
    ///
    /// Fails fast before any operation is attempted.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl StoreError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a key-not-found error.
    pub fn key_not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::KeyNotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Create a table-not-found error.
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Create a transient fault.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if this error may be retried by an adapter-internal policy.
    ///
    /// Only transient faults qualify. `KeyNotFound` is never retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Check if this error means the requested entity is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::TableNotFound { .. })
    }

    /// Collapse an exhausted transient fault into a connection error.
    ///
    /// Applied after an adapter's retry budget runs out so callers observe
    /// the documented taxonomy, not the internal retry mechanics.
    pub fn into_exhausted(self) -> Self {
        match self {
            Self::Transient { message } => Self::Connection {
                message: format!("retry budget exhausted: {message}"),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection {
            message: err.to_string(),
        }
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
