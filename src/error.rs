//! Error types for ctxdb.

use std::sync::Arc;

use thiserror::Error;

/// Result type for ctxdb operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error produced by a driver.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for ctxdb.
///
/// Errors are cheap to clone so that a transaction can hand the same latched
/// error back from every call after its first failure.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The context was cancelled before the operation completed
    #[error("context canceled")]
    Cancelled,

    /// The context deadline passed before the operation completed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Waiting for a connection slot took longer than the pool's usage timeout
    #[error("timed out waiting for a connection slot")]
    TimedOut,

    /// The pool has been closed
    #[error("connection pool is closed")]
    PoolClosed,

    /// Attempt to check an absent connection into the pool
    #[error("connection is nil, rejecting")]
    NilConnection,

    /// A handle is missing the internal state it needs
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// The transaction has already been committed or rolled back
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// A single-row query matched nothing
    #[error("no rows in result set")]
    NoRows,

    /// The blocking call panicked on its worker thread
    #[error("blocking call panicked: {0}")]
    Panicked(String),

    /// Error reported by the wrapped driver, passed through verbatim
    #[error("{0}")]
    Driver(Arc<dyn std::error::Error + Send + Sync>),

    /// A column value could not be converted to the requested type
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid usage (e.g., bad configuration)
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
}

impl Error {
    /// Wrap a driver-specific error.
    pub fn driver<E: Into<DriverError>>(err: E) -> Self {
        Error::Driver(Arc::from(err.into()))
    }

    /// Returns true if the error came from the caller's context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Returns true if the connection that produced this error must be destroyed
    /// instead of going back to the idle buffer.
    ///
    /// `NoRows` is an ordinary query outcome and leaves the connection usable.
    pub fn poisons_connection(&self) -> bool {
        !matches!(self, Error::NoRows | Error::Decode(_))
    }

    /// Returns true if both values denote the same failure.
    ///
    /// Driver errors compare by identity, so a latched error matches only the
    /// value it was cloned from.
    pub fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Driver(a), Error::Driver(b)) => Arc::ptr_eq(a, b),
            (Error::InvalidHandle(a), Error::InvalidHandle(b)) => a == b,
            (Error::Panicked(a), Error::Panicked(b))
            | (Error::Decode(a), Error::Decode(b))
            | (Error::InvalidUsage(a), Error::InvalidUsage(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_owned());
            Error::Panicked(message)
        } else {
            Error::Panicked("blocking task was cancelled".to_owned())
        }
    }
}
