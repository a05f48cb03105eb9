//! # cmap-pool
//!
//! Connection pool for a single server address, with FIFO wait-queue
//! admission, generation-based invalidation and monitoring events.
//!
//! The pool manages connection lifecycle only. The bytes exchanged with the
//! server travel over a [`Transport`] supplied by the wire-protocol layer;
//! a plain TCP transport is used when none is configured.
//!
//! ## Features
//!
//! - Bounded or unbounded pools (`max_pool_size`, 0 for unbounded)
//! - FIFO wait queue with optional capacity and timeout
//! - Lazy invalidation through [`Pool::clear`] generations
//! - Idle eviction (`max_idle_time`)
//! - `min_pool_size` population, optionally maintained in the background
//! - A monitoring event for every state transition
//! - Status and metrics snapshots
//!
//! ## Example
//!
//! ```rust,ignore
//! use cmap_pool::{Pool, PoolConfig, PoolOptions};
//! use std::time::Duration;
//!
//! // Using the builder pattern
//! let pool = Pool::builder()
//!     .address("db.internal:27017".parse()?)
//!     .max_pool_size(20)
//!     .wait_queue_timeout(Duration::from_secs(5))
//!     .build()
//!     .await?;
//!
//! // Or from connection-string options
//! let config = PoolConfig::from(PoolOptions::from_query("maxPoolSize=20&minPoolSize=2")?);
//! let pool = Pool::new(config).await?;
//!
//! // Get a connection from the pool
//! let conn = pool.acquire().await?;
//! // Use connection...
//! pool.release(conn, false)?;
//!
//! // Watch what the pool is doing
//! let mut events = pool.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}: {} connections", event.event_type(), event.pool.total_connection_count);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod pool;
mod wait_queue;

// Addressing
pub use address::ServerAddress;

// Configuration
pub use config::{PoolConfig, PoolOptions};

// Connections and transports
pub use connection::{
    Connection, ConnectionMetadata, DynTransportFactory, TcpTransport, TcpTransportFactory,
    Transport, TransportFactory,
};

// Error types
pub use error::PoolError;

// Monitoring
pub use event::{
    ALL_EVENT_TYPES, AcquisitionFailedReason, ConnectionClosedReason, DynPoolEventHandler,
    PoolEvent, PoolEventHandler, PoolEventKind, PoolMetadata,
};

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};
