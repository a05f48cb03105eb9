//! Pool error types.

use thiserror::Error;

use crate::address::ServerAddress;
use crate::connection::ConnectionMetadata;

/// Errors returned by pool operations.
///
/// The four pool-contract failures carry the pool id and address for
/// diagnostics. [`WaitQueueFull`](PoolError::WaitQueueFull) and
/// [`WaitQueueTimeout`](PoolError::WaitQueueTimeout) are the pool's
/// backpressure signal and should be treated as transient.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool was closed before or while the request was waiting.
    #[error("attempted to acquire a connection from closed connection pool {pool_id} ({address})")]
    PoolClosed {
        /// Pool id.
        pool_id: u32,
        /// Pool address.
        address: ServerAddress,
    },

    /// The wait queue was at capacity; the request was never enqueued.
    #[error(
        "attempted to acquire a connection from connection pool {pool_id} ({address}) while the wait queue was full"
    )]
    WaitQueueFull {
        /// Pool id.
        pool_id: u32,
        /// Pool address.
        address: ServerAddress,
    },

    /// The request waited longer than the configured wait queue timeout.
    #[error("timed out while acquiring a connection from connection pool {pool_id} ({address})")]
    WaitQueueTimeout {
        /// Pool id.
        pool_id: u32,
        /// Pool address.
        address: ServerAddress,
    },

    /// A connection was released to a pool that did not issue it.
    #[error(
        "attempted to release connection {} to pool {pool_id} ({address}) which did not create it",
        .connection.id
    )]
    ForeignConnection {
        /// Pool id.
        pool_id: u32,
        /// Pool address.
        address: ServerAddress,
        /// Metadata of the rejected connection.
        connection: ConnectionMetadata,
    },

    /// Establishing a new connection failed.
    #[error("failed to establish connection to {address}: {source}")]
    Connect {
        /// Pool id.
        pool_id: u32,
        /// Pool address.
        address: ServerAddress,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed server address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl PoolError {
    /// Whether retrying the operation later may succeed.
    ///
    /// Wait queue exhaustion and connection establishment failures are
    /// transient; a closed pool or misuse is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WaitQueueFull { .. } | Self::WaitQueueTimeout { .. } | Self::Connect { .. }
        )
    }

    /// Stable identifier of the error kind.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::PoolClosed { .. } => "poolClosedError",
            Self::WaitQueueFull { .. } => "waitQueueFullError",
            Self::WaitQueueTimeout { .. } => "waitQueueTimeoutError",
            Self::ForeignConnection { .. } => "poolReleaseForeignConnectionError",
            Self::Connect { .. } => "connectionError",
            Self::Configuration(_) => "configurationError",
            Self::InvalidAddress(_) => "invalidAddressError",
        }
    }

    /// The id of the pool that raised the error, if any.
    #[must_use]
    pub fn pool_id(&self) -> Option<u32> {
        match self {
            Self::PoolClosed { pool_id, .. }
            | Self::WaitQueueFull { pool_id, .. }
            | Self::WaitQueueTimeout { pool_id, .. }
            | Self::ForeignConnection { pool_id, .. }
            | Self::Connect { pool_id, .. } => Some(*pool_id),
            Self::Configuration(_) | Self::InvalidAddress(_) => None,
        }
    }

    /// The address of the pool that raised the error, if any.
    #[must_use]
    pub fn address(&self) -> Option<&ServerAddress> {
        match self {
            Self::PoolClosed { address, .. }
            | Self::WaitQueueFull { address, .. }
            | Self::WaitQueueTimeout { address, .. }
            | Self::ForeignConnection { address, .. }
            | Self::Connect { address, .. } => Some(address),
            Self::Configuration(_) | Self::InvalidAddress(_) => None,
        }
    }
}
