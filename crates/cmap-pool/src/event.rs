//! Pool monitoring events.
//!
//! Every pool state transition produces one immutable [`PoolEvent`]. Events
//! are delivered synchronously to the [`PoolEventHandler`]s registered at
//! build time and broadcast to [`Pool::subscribe`](crate::Pool::subscribe)
//! receivers.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, mpsc};

use crate::address::ServerAddress;
use crate::config::PoolOptions;
use crate::connection::ConnectionMetadata;

/// Snapshot of pool state at the moment an event was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PoolMetadata {
    /// Pool id.
    pub id: u32,
    /// Available plus checked-out connections.
    pub total_connection_count: usize,
    /// Idle connections.
    pub available_connection_count: usize,
    /// Current generation.
    pub generation: u64,
    /// Pool address.
    pub address: ServerAddress,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum ConnectionClosedReason {
    /// Created before the most recent clear.
    Stale,
    /// Sat idle longer than `max_idle_time`.
    Idle,
    /// The pool was closed.
    PoolClosed,
    /// Released with `force`.
    Force,
    /// Any other reason, such as a failed establishment.
    Unknown,
}

impl ConnectionClosedReason {
    /// Wire name of the reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Idle => "idle",
            Self::PoolClosed => "poolClosed",
            Self::Force => "force",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum AcquisitionFailedReason {
    /// The pool was closed.
    PoolClosed,
    /// The wait queue was full.
    QueueFull,
    /// The wait queue timeout elapsed.
    Timeout,
    /// A new connection could not be established.
    ConnectionError,
}

impl AcquisitionFailedReason {
    /// Wire name of the reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolClosed => "poolClosed",
            Self::QueueFull => "queueFull",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connectionError",
        }
    }
}

impl fmt::Display for AcquisitionFailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific payload, tagged by event type.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
#[non_exhaustive]
pub enum PoolEventKind {
    /// The pool was created.
    ConnectionPoolCreated {
        /// Options the pool was created with.
        options: PoolOptions,
    },
    /// The pool was closed.
    ConnectionPoolClosed,
    /// A connection was created.
    ConnectionCreated {
        /// The new connection.
        connection: ConnectionMetadata,
    },
    /// A connection finished establishing and is ready for use.
    ConnectionReady {
        /// The ready connection.
        connection: ConnectionMetadata,
    },
    /// A connection was closed.
    ConnectionClosed {
        /// The closed connection.
        connection: ConnectionMetadata,
        /// Why it was closed.
        reason: ConnectionClosedReason,
    },
    /// A caller started acquiring a connection.
    ConnectionAcquisitionStarted,
    /// An acquisition failed.
    ConnectionAcquisitionFailed {
        /// Why it failed.
        reason: AcquisitionFailedReason,
    },
    /// A connection was handed to a caller.
    ConnectionAcquired {
        /// The acquired connection.
        connection: ConnectionMetadata,
    },
    /// A connection was returned to the pool.
    ConnectionReleased {
        /// The released connection.
        connection: ConnectionMetadata,
    },
    /// The pool generation was bumped.
    ConnectionPoolCleared,
}

/// A monitoring event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolEvent {
    /// When the event was emitted.
    pub time: SystemTime,
    /// Pool snapshot at emission time.
    pub pool: PoolMetadata,
    /// Event payload.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub kind: PoolEventKind,
}

impl PoolEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(pool: PoolMetadata, kind: PoolEventKind) -> Self {
        Self {
            time: SystemTime::now(),
            pool,
            kind,
        }
    }

    /// The event type tag.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            PoolEventKind::ConnectionPoolCreated { .. } => "connectionPoolCreated",
            PoolEventKind::ConnectionPoolClosed => "connectionPoolClosed",
            PoolEventKind::ConnectionCreated { .. } => "connectionCreated",
            PoolEventKind::ConnectionReady { .. } => "connectionReady",
            PoolEventKind::ConnectionClosed { .. } => "connectionClosed",
            PoolEventKind::ConnectionAcquisitionStarted => "connectionAcquisitionStarted",
            PoolEventKind::ConnectionAcquisitionFailed { .. } => "connectionAcquisitionFailed",
            PoolEventKind::ConnectionAcquired { .. } => "connectionAcquired",
            PoolEventKind::ConnectionReleased { .. } => "connectionReleased",
            PoolEventKind::ConnectionPoolCleared => "connectionPoolCleared",
        }
    }

    /// The connection the event concerns, if any.
    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionMetadata> {
        match &self.kind {
            PoolEventKind::ConnectionCreated { connection }
            | PoolEventKind::ConnectionReady { connection }
            | PoolEventKind::ConnectionClosed { connection, .. }
            | PoolEventKind::ConnectionAcquired { connection }
            | PoolEventKind::ConnectionReleased { connection } => Some(connection),
            _ => None,
        }
    }
}

/// All event type tags, in declaration order.
pub const ALL_EVENT_TYPES: [&str; 10] = [
    "connectionPoolCreated",
    "connectionPoolClosed",
    "connectionCreated",
    "connectionReady",
    "connectionClosed",
    "connectionAcquisitionStarted",
    "connectionAcquisitionFailed",
    "connectionAcquired",
    "connectionReleased",
    "connectionPoolCleared",
];

/// Observer of pool events.
///
/// Handlers run synchronously while the pool's internal lock is held, so
/// they must be cheap and must not call back into the pool.
pub trait PoolEventHandler: Send + Sync + 'static {
    /// Handle one event.
    fn handle(&self, event: &PoolEvent);
}

impl PoolEventHandler for mpsc::UnboundedSender<PoolEvent> {
    fn handle(&self, event: &PoolEvent) {
        // A dropped receiver just stops listening.
        let _ = self.send(event.clone());
    }
}

/// Shared, type-erased event handler.
pub type DynPoolEventHandler = Arc<dyn PoolEventHandler>;

/// Fans events out to handlers and broadcast subscribers.
pub(crate) struct EventEmitter {
    handlers: Vec<DynPoolEventHandler>,
    broadcast: broadcast::Sender<PoolEvent>,
}

impl EventEmitter {
    pub(crate) fn new(handlers: Vec<DynPoolEventHandler>, capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            handlers,
            broadcast,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.broadcast.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        tracing::trace!(event = event.event_type(), pool_id = event.pool.id, "pool event");
        for handler in &self.handlers {
            handler.handle(&event);
        }
        if self.broadcast.receiver_count() > 0 {
            // Only fails when every receiver has gone away.
            let _ = self.broadcast.send(event);
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("handlers", &self.handlers.len())
            .field("subscribers", &self.broadcast.receiver_count())
            .finish()
    }
}
