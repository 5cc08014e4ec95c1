//! Error types for the connection core.
//!
//! This module defines all error types using `thiserror`. Contention failures
//! (`LockTimeout`, `PoolSaturated`) are distinct variants carrying a snapshot of
//! the contended resource, so callers can tell "one holder is too slow" apart
//! from "too many callers for the configured capacity" without string matching.

use crate::models::{
    ConnectionTargetError, ContentionSnapshot, ExecutionType, ReadWriteMode, SaturationSnapshot,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Lock timeout: {snapshot}")]
    LockTimeout { snapshot: ContentionSnapshot },

    #[error("Pool saturated: {snapshot}")]
    PoolSaturated { snapshot: SaturationSnapshot },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("{requested} connection requested from a {mode} context")]
    ReadWriteViolation {
        requested: ExecutionType,
        mode: ReadWriteMode,
    },

    #[error("Connection {connection_id} has been disposed")]
    ConnectionDisposed { connection_id: u64 },

    #[error("Database context has been closed")]
    ContextClosed,

    #[error("Cancelled while waiting for {operation}")]
    Cancelled { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Context not found: {context_id}")]
    ContextNotFound { context_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lock holder kept the resource longer than the lock timeout.
    Contention,
    /// More concurrent callers than configured capacity.
    Saturation,
    Configuration,
    Provider,
    Usage,
    Lifecycle,
    Cancelled,
    Internal,
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a provider error without an underlying sqlx error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a context not found error.
    pub fn context_not_found(context_id: impl Into<String>) -> Self {
        Self::ContextNotFound {
            context_id: context_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LockTimeout { .. } => ErrorKind::Contention,
            Self::PoolSaturated { .. } => ErrorKind::Saturation,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::ReadWriteViolation { .. }
            | Self::InvalidInput { .. }
            | Self::ContextNotFound { .. } => ErrorKind::Usage,
            Self::ConnectionDisposed { .. } | Self::ContextClosed => ErrorKind::Lifecycle,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only contention and saturation are; provider failures are surfaced
    /// unchanged and retry policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::Saturation)
    }

    /// Contention snapshot for a lock timeout.
    pub fn contention(&self) -> Option<&ContentionSnapshot> {
        match self {
            Self::LockTimeout { snapshot } => Some(snapshot),
            _ => None,
        }
    }

    /// Saturation snapshot for a pool timeout.
    pub fn saturation(&self) -> Option<&SaturationSnapshot> {
        match self {
            Self::PoolSaturated { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

/// Provider errors are propagated unchanged; the sqlx error stays reachable via `source()`.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let message = match &err {
            sqlx::Error::Configuration(msg) => format!("invalid connection options: {}", msg),
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
                None => db_err.message().to_string(),
            },
            sqlx::Error::Io(io_err) => format!("I/O error: {}", io_err),
            sqlx::Error::Tls(tls_err) => format!("TLS error: {}", tls_err),
            sqlx::Error::Protocol(msg) => format!("protocol error: {}", msg),
            sqlx::Error::PoolTimedOut => "driver pool timed out".to_string(),
            sqlx::Error::PoolClosed => "driver pool is closed".to_string(),
            sqlx::Error::WorkerCrashed => "database worker crashed".to_string(),
            other => other.to_string(),
        };
        Self::Provider {
            message,
            source: Some(err),
        }
    }
}

impl From<ConnectionTargetError> for DbError {
    fn from(err: ConnectionTargetError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Result type alias for connection-core operations.
pub type DbResult<T> = Result<T, DbError>;
