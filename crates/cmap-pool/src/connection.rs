//! Pooled connections and the transport seam beneath them.
//!
//! A [`Connection`] is the pool's record of one logical link to the server:
//! its identity, the generation it was created in and its idle bookkeeping.
//! The bytes travel over a [`Transport`] supplied by the wire-protocol layer
//! through a [`TransportFactory`]. The pool never inspects those bytes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::address::ServerAddress;

/// Byte-level link to a server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link. Called at most once per successful establishment.
    async fn connect(&mut self) -> io::Result<()>;

    /// Write a fully encoded message.
    async fn write(&mut self, payload: Bytes) -> io::Result<()>;

    /// Release all resources. Must be idempotent and must not fail.
    fn destroy(&mut self);
}

/// Creates transports for new pool connections.
pub trait TransportFactory: Send + Sync + 'static {
    /// Create an unconnected transport targeting `address`.
    fn create(&self, address: &ServerAddress) -> Box<dyn Transport>;
}

/// Shared, type-erased transport factory.
pub type DynTransportFactory = Arc<dyn TransportFactory>;

/// Plain TCP transport, used when no factory override is configured.
#[derive(Debug)]
pub struct TcpTransport {
    address: ServerAddress,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Create an unconnected TCP transport.
    #[must_use]
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> io::Result<()> {
        let stream = TcpStream::connect((self.address.host(), self.address.port())).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, payload: Bytes) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport not connected"))?;
        stream.write_all(&payload).await
    }

    fn destroy(&mut self) {
        // Dropping the stream closes the socket.
        self.stream = None;
    }
}

/// Factory for [`TcpTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, address: &ServerAddress) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(address.clone()))
    }
}

/// Transport left behind in a connection that was moved out of its holder.
struct Detached;

#[async_trait]
impl Transport for Detached {
    async fn connect(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "connection was moved"))
    }

    async fn write(&mut self, _payload: Bytes) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "connection was moved"))
    }

    fn destroy(&mut self) {}
}

/// Identity snapshot of a connection, as carried by events and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ConnectionMetadata {
    /// Pool-scoped connection id.
    pub id: u64,
    /// Generation the connection was created in.
    pub generation: u64,
    /// Id of the owning pool.
    pub pool_id: u32,
    /// Server address.
    pub address: ServerAddress,
}

/// A connection owned by a pool.
///
/// Connections are only created by the pool. While checked out a connection
/// is exclusively held by one caller; dropping it destroys the transport.
pub struct Connection {
    id: u64,
    generation: u64,
    pool_id: u32,
    /// Process-unique key of the pool instance that created this connection.
    pool_key: u64,
    address: ServerAddress,
    created_at: Instant,
    last_used: Instant,
    last_made_available: Option<Instant>,
    established: bool,
    destroyed: bool,
    transport: Box<dyn Transport>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        generation: u64,
        pool_id: u32,
        pool_key: u64,
        address: ServerAddress,
        transport: Box<dyn Transport>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            generation,
            pool_id,
            pool_key,
            address,
            created_at: now,
            last_used: now,
            last_made_available: None,
            established: false,
            destroyed: false,
            transport,
        }
    }

    /// Pool-scoped id, assigned from a counter seeded at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Generation this connection was stamped with.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Id of the pool that created this connection.
    #[must_use]
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub(crate) fn pool_key(&self) -> u64 {
        self.pool_key
    }

    /// Server address.
    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Server host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.address.host()
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Time since the connection was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Last time the connection was written to or created.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// When the connection last became idle; `None` while checked out.
    #[must_use]
    pub fn last_made_available(&self) -> Option<Instant> {
        self.last_made_available
    }

    /// Whether the transport has been connected.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Identity snapshot for events and errors.
    #[must_use]
    pub fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            id: self.id,
            generation: self.generation,
            pool_id: self.pool_id,
            address: self.address.clone(),
        }
    }

    /// Mark the connection idle.
    pub(crate) fn make_available(&mut self) {
        self.last_made_available = Some(Instant::now());
    }

    /// Mark the connection as on loan.
    pub(crate) fn mark_in_use(&mut self) {
        self.last_made_available = None;
    }

    /// Whether this connection predates the given pool generation.
    #[must_use]
    pub fn is_stale(&self, current_generation: u64) -> bool {
        self.generation != current_generation
    }

    /// Whether the connection has been idle longer than `max_idle_time`.
    ///
    /// Always false while checked out or when no limit is set.
    #[must_use]
    pub fn is_idle_expired(&self, max_idle_time: Option<Duration>, now: Instant) -> bool {
        match (max_idle_time, self.last_made_available) {
            (Some(max_idle), Some(since)) if !max_idle.is_zero() => {
                now.saturating_duration_since(since) > max_idle
            }
            _ => false,
        }
    }

    /// Connect the underlying transport.
    ///
    /// Establishment is never retried here; the error goes to whoever asked.
    pub async fn establish(&mut self) -> io::Result<()> {
        if self.established {
            return Ok(());
        }
        if self.destroyed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection was destroyed",
            ));
        }
        self.transport.connect().await?;
        self.established = true;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Write an encoded message to the server.
    pub async fn write(&mut self, payload: Bytes) -> io::Result<()> {
        if !self.established || self.destroyed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not established",
            ));
        }
        self.transport.write(payload).await?;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Release the transport. Idempotent.
    pub fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.established = false;
            self.transport.destroy();
        }
    }

    /// Move the connection out, leaving a destroyed shell with the same
    /// identity in its place.
    pub(crate) fn detach(&mut self) -> Connection {
        let shell = Connection {
            id: self.id,
            generation: self.generation,
            pool_id: self.pool_id,
            pool_key: self.pool_key,
            address: self.address.clone(),
            created_at: self.created_at,
            last_used: self.last_used,
            last_made_available: None,
            established: false,
            destroyed: true,
            transport: Box::new(Detached),
        };
        std::mem::replace(self, shell)
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("pool_id", &self.pool_id)
            .field("address", &self.address)
            .field("established", &self.established)
            .finish()
    }
}
