//! Connection pool implementation.
//!
//! All pool and wait queue state lives in one [`PoolState`] behind a single
//! mutex. The wait queue run loop, the member timeout timers and the optional
//! maintenance task are tokio tasks that hold only a weak reference to the
//! pool and take the same lock, so every state transition is serialized.
//! Network I/O (establishing a connection) always happens outside the lock.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::address::ServerAddress;
use crate::config::{PoolConfig, PoolOptions};
use crate::connection::{
    Connection, ConnectionMetadata, DynTransportFactory, TcpTransportFactory,
};
use crate::error::PoolError;
use crate::event::{
    AcquisitionFailedReason, ConnectionClosedReason, DynPoolEventHandler, EventEmitter, PoolEvent,
    PoolEventKind, PoolMetadata,
};
use crate::wait_queue::{Settlement, Tick, WaitQueue};

/// Source of process-unique pool instance keys.
static NEXT_POOL_KEY: AtomicU64 = AtomicU64::new(1);

/// A pool of connections to a single server address.
///
/// Acquisitions are admitted through a FIFO wait queue which a periodic run
/// loop serves one head request per tick: an idle connection is reused when a
/// fresh one is available, otherwise a new connection is created while the
/// pool is below `max_pool_size`. [`clear`](Pool::clear) bumps the pool
/// generation; connections from older generations are discarded lazily, the
/// next time they are considered for reuse or when they are released.
///
/// `Pool` is a cheap handle; clones share the same pool.
///
/// # Example
///
/// ```rust,ignore
/// use cmap_pool::{Pool, PoolConfig};
/// use std::time::Duration;
///
/// let pool = Pool::builder()
///     .max_pool_size(20)
///     .wait_queue_timeout(Duration::from_secs(5))
///     .build()
///     .await?;
///
/// let mut conn = pool.acquire().await?;
/// conn.write(message).await?;
/// pool.release(conn, false)?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    /// Distinguishes pool instances even when their configured ids collide.
    key: u64,
    config: PoolConfig,
    pid: u32,
    factory: DynTransportFactory,
    events: EventEmitter,
    created_at: Instant,
    state: Mutex<PoolState>,
}

struct PoolState {
    connections: ConnectionSet,
    queue: WaitQueue<PooledConnection>,
    run_loop: Option<AbortHandle>,
    maintenance: Option<AbortHandle>,
}

/// Connection bookkeeping.
struct ConnectionSet {
    generation: u64,
    closed: bool,
    /// Idle connections; reuse pops the front, release pushes the back.
    available: VecDeque<Connection>,
    /// Ids of connections on loan.
    checked_out: HashSet<u64>,
    /// Connections being established for `min_pool_size`, not yet registered.
    pending: usize,
    next_connection_id: u64,
    metrics: PoolMetricsInner,
}

impl ConnectionSet {
    fn new() -> Self {
        Self {
            generation: 0,
            closed: false,
            available: VecDeque::new(),
            checked_out: HashSet::new(),
            pending: 0,
            next_connection_id: 1,
            metrics: PoolMetricsInner::default(),
        }
    }

    fn total(&self) -> usize {
        self.available.len() + self.checked_out.len()
    }

    fn has_capacity(&self, max_pool_size: u32) -> bool {
        max_pool_size == 0 || self.total() + self.pending < max_pool_size as usize
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Connections discarded for predating a clear.
    stale_evictions: u64,
    /// Connections discarded for idling too long.
    idle_evictions: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, full queue, closed pool, connect errors).
    checkouts_failed: u64,
}

impl PoolInner {
    fn metadata(&self, set: &ConnectionSet) -> PoolMetadata {
        PoolMetadata {
            id: self.config.id,
            total_connection_count: set.total(),
            available_connection_count: set.available.len(),
            generation: set.generation,
            address: self.config.address.clone(),
        }
    }

    fn emit(&self, set: &ConnectionSet, kind: PoolEventKind) {
        self.events.emit(PoolEvent::new(self.metadata(set), kind));
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            pool_id: self.config.id,
            address: self.config.address.clone(),
        }
    }

    fn foreign_error(&self, connection: ConnectionMetadata) -> PoolError {
        PoolError::ForeignConnection {
            pool_id: self.config.id,
            address: self.config.address.clone(),
            connection,
        }
    }

    fn connect_error(&self, source: io::Error) -> PoolError {
        PoolError::Connect {
            pool_id: self.config.id,
            address: self.config.address.clone(),
            source,
        }
    }

    fn create_connection(&self, set: &mut ConnectionSet) -> Connection {
        let id = set.next_connection_id;
        set.next_connection_id += 1;

        let transport = self.factory.create(&self.config.address);
        let conn = Connection::new(
            id,
            set.generation,
            self.config.id,
            self.key,
            self.config.address.clone(),
            transport,
        );
        set.metrics.connections_created += 1;

        tracing::debug!(
            pool_id = self.config.id,
            connection_id = id,
            generation = set.generation,
            "connection created"
        );
        self.emit(
            set,
            PoolEventKind::ConnectionCreated {
                connection: conn.metadata(),
            },
        );
        conn
    }

    fn destroy_connection(
        &self,
        set: &mut ConnectionSet,
        mut conn: Connection,
        reason: ConnectionClosedReason,
    ) {
        conn.destroy();
        set.metrics.connections_closed += 1;
        match reason {
            ConnectionClosedReason::Stale => set.metrics.stale_evictions += 1,
            ConnectionClosedReason::Idle => set.metrics.idle_evictions += 1,
            _ => {}
        }

        tracing::debug!(
            pool_id = self.config.id,
            connection_id = conn.id(),
            reason = %reason,
            "connection closed"
        );
        self.emit(
            set,
            PoolEventKind::ConnectionClosed {
                connection: conn.metadata(),
                reason,
            },
        );
    }

    fn push_available(set: &mut ConnectionSet, mut conn: Connection) {
        conn.make_available();
        set.available.push_back(conn);
    }

    /// The acquisition step run by the wait queue for its head member.
    fn try_get_connection(&self, set: &mut ConnectionSet) -> Option<Connection> {
        let now = Instant::now();
        while let Some(conn) = set.available.pop_front() {
            if conn.is_stale(set.generation) {
                self.destroy_connection(set, conn, ConnectionClosedReason::Stale);
            } else if conn.is_idle_expired(self.config.max_idle_time, now) {
                self.destroy_connection(set, conn, ConnectionClosedReason::Idle);
            } else {
                return Some(conn);
            }
        }

        if set.has_capacity(self.config.max_pool_size) {
            return Some(self.create_connection(set));
        }
        None
    }

    fn check_out(self: &Arc<Self>, set: &mut ConnectionSet, mut conn: Connection) -> PooledConnection {
        conn.mark_in_use();
        set.checked_out.insert(conn.id());
        PooledConnection::new(conn, Arc::clone(self))
    }

    /// Take back a checked-out connection nobody was told about.
    fn reclaim(&self, set: &mut ConnectionSet, conn: Connection) {
        set.checked_out.remove(&conn.id());
        if set.closed {
            self.destroy_connection(set, conn, ConnectionClosedReason::PoolClosed);
        } else if conn.is_stale(set.generation) {
            self.destroy_connection(set, conn, ConnectionClosedReason::Stale);
        } else {
            Self::push_available(set, conn);
        }
    }

    fn release_connection(&self, conn: Connection, force: bool) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let set = &mut state.connections;

        if conn.pool_key() != self.key || !set.checked_out.remove(&conn.id()) {
            return Err(self.foreign_error(conn.metadata()));
        }

        let reason = if force {
            Some(ConnectionClosedReason::Force)
        } else if set.closed {
            Some(ConnectionClosedReason::PoolClosed)
        } else if conn.is_stale(set.generation) {
            Some(ConnectionClosedReason::Stale)
        } else {
            None
        };

        let metadata = conn.metadata();
        let doomed = match reason {
            Some(reason) => Some((conn, reason)),
            None => {
                Self::push_available(set, conn);
                None
            }
        };

        tracing::trace!(pool_id = self.config.id, connection_id = metadata.id, "connection released");
        self.emit(set, PoolEventKind::ConnectionReleased { connection: metadata });

        if let Some((conn, reason)) = doomed {
            self.destroy_connection(set, conn, reason);
        }
        Ok(())
    }

    /// Record a failed acquisition and hand the error back.
    fn fail_acquisition(&self, set: &mut ConnectionSet, err: PoolError) -> PoolError {
        let reason = match &err {
            PoolError::WaitQueueFull { .. } => AcquisitionFailedReason::QueueFull,
            PoolError::WaitQueueTimeout { .. } => AcquisitionFailedReason::Timeout,
            PoolError::Connect { .. } => AcquisitionFailedReason::ConnectionError,
            _ => AcquisitionFailedReason::PoolClosed,
        };
        set.metrics.checkouts_failed += 1;

        tracing::debug!(pool_id = self.config.id, reason = %reason, "connection acquisition failed");
        self.emit(set, PoolEventKind::ConnectionAcquisitionFailed { reason });
        err
    }

    /// Admit one acquisition into the wait queue, starting the run loop and
    /// arming the timeout as needed.
    ///
    /// A readmitted acquisition goes back to the head and keeps `deadline`.
    fn enter_wait_queue(
        self: &Arc<Self>,
        readmit: bool,
        deadline: Option<Instant>,
    ) -> Result<tokio::sync::oneshot::Receiver<Settlement<PooledConnection>>, PoolError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.connections.closed {
            let err = self.closed_error();
            return Err(self.fail_acquisition(&mut state.connections, err));
        }

        let admitted = if readmit {
            state.queue.enter_front()
        } else {
            state.queue.enter()
        };
        let admission = match admitted {
            Ok(admission) => admission,
            Err(err) => return Err(self.fail_acquisition(&mut state.connections, err)),
        };

        if let Some(deadline) = deadline {
            let timer = tokio::spawn(expire_at(
                Arc::downgrade(self),
                admission.member_id,
                deadline,
            ));
            state.queue.arm_timer(admission.member_id, timer.abort_handle());
        }

        if admission.start_run_loop {
            let task = tokio::spawn(run_wait_queue(
                Arc::downgrade(self),
                self.config.wait_queue_period,
            ));
            state.run_loop = Some(task.abort_handle());
        }

        Ok(admission.receiver)
    }

    /// One run loop tick. Returns whether the loop should keep running.
    fn process_wait_queue(self: &Arc<Self>) -> bool {
        let mut guard = self.state.lock();
        let PoolState {
            connections,
            queue,
            run_loop,
            ..
        } = &mut *guard;

        let tick = queue.run_once(|| {
            let conn = self.try_get_connection(connections)?;
            Some(self.check_out(connections, conn))
        });

        match tick {
            Tick::Stopped => {
                *run_loop = None;
                false
            }
            Tick::Unclaimed(pooled) => {
                self.reclaim(connections, pooled.into_connection());
                true
            }
            Tick::Requeued | Tick::Discarded | Tick::Served => true,
        }
    }

    /// Create and establish connections until `min_pool_size` is met.
    async fn populate_min_pool_size(&self) -> Result<usize, PoolError> {
        let min = self.config.min_pool_size as usize;
        let mut created = 0;

        loop {
            let mut establishing = {
                let mut state = self.state.lock();
                let set = &mut state.connections;
                if set.closed
                    || set.total() + set.pending >= min
                    || !set.has_capacity(self.config.max_pool_size)
                {
                    break;
                }
                set.pending += 1;
                Establishing {
                    pool: self,
                    conn: Some(self.create_connection(set)),
                }
            };

            let result = establishing.establish().await;

            let mut state = self.state.lock();
            let set = &mut state.connections;
            let Some(conn) = establishing.settle(set) else {
                break;
            };

            match result {
                Ok(()) => {
                    self.emit(
                        set,
                        PoolEventKind::ConnectionReady {
                            connection: conn.metadata(),
                        },
                    );
                    if set.closed {
                        self.destroy_connection(set, conn, ConnectionClosedReason::PoolClosed);
                    } else if conn.is_stale(set.generation) {
                        self.destroy_connection(set, conn, ConnectionClosedReason::Stale);
                    } else {
                        Self::push_available(set, conn);
                        created += 1;
                    }
                }
                Err(source) => {
                    self.destroy_connection(set, conn, ConnectionClosedReason::Unknown);
                    return Err(self.connect_error(source));
                }
            }
        }

        Ok(created)
    }
}

/// A connection being established outside the lock, counted as pending.
struct Establishing<'a> {
    pool: &'a PoolInner,
    conn: Option<Connection>,
}

impl Establishing<'_> {
    async fn establish(&mut self) -> io::Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.establish().await,
            None => Ok(()),
        }
    }

    /// Hand the connection over to the caller, who holds the lock.
    fn settle(mut self, set: &mut ConnectionSet) -> Option<Connection> {
        set.pending -= 1;
        self.conn.take()
    }
}

impl Drop for Establishing<'_> {
    fn drop(&mut self) {
        // Only reached when the establishing future was cancelled.
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.state.lock();
            state.connections.pending -= 1;
            self.pool
                .destroy_connection(&mut state.connections, conn, ConnectionClosedReason::Unknown);
        }
    }
}

/// Wait queue run loop: one head attempt per period while the queue is busy.
async fn run_wait_queue(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if !pool.process_wait_queue() {
            return;
        }
    }
}

/// Timeout timer for one wait queue member.
async fn expire_at(pool: Weak<PoolInner>, member_id: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let mut state = pool.state.lock();
    if state.queue.expire(member_id) {
        tracing::debug!(
            pool_id = pool.config.id,
            member_id,
            "wait queue member timed out"
        );
    }
}

/// Background `min_pool_size` maintenance.
async fn maintain(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.state.lock().connections.closed {
            return;
        }
        if let Err(e) = pool.populate_min_pool_size().await {
            tracing::warn!(
                pool_id = pool.config.id,
                error = %e,
                "background min_pool_size population failed"
            );
        }
    }
}

impl Pool {
    /// Create a new pool builder.
    ///
    /// Use the builder to configure the pool before creating it.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool with the given configuration and the default TCP
    /// transport.
    ///
    /// For more control over pool creation, use [`Pool::builder()`].
    pub async fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::builder().pool_config(config).build().await
    }

    /// Get a connection from the pool.
    ///
    /// Waits in the FIFO wait queue until an idle connection can be reused or
    /// a new one can be created, the wait queue timeout elapses, or the pool
    /// is closed. Newly created connections are established before they are
    /// returned; establishment errors are not retried.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        {
            let state = self.inner.state.lock();
            self.inner
                .emit(&state.connections, PoolEventKind::ConnectionAcquisitionStarted);
        }
        tracing::trace!(pool_id = self.inner.config.id, "acquiring connection from pool");

        let deadline = self
            .inner
            .config
            .wait_queue_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut readmit = false;

        loop {
            let receiver = self.inner.enter_wait_queue(readmit, deadline)?;

            let settlement = receiver
                .await
                .unwrap_or_else(|_| Err(self.inner.closed_error()));

            let mut conn = match settlement {
                Ok(conn) => conn,
                Err(err) => {
                    let mut state = self.inner.state.lock();
                    return Err(self.inner.fail_acquisition(&mut state.connections, err));
                }
            };

            let fresh = !conn.is_established();
            if fresh {
                if let Err(source) = conn.establish().await {
                    tracing::warn!(
                        pool_id = self.inner.config.id,
                        connection_id = conn.id(),
                        error = %source,
                        "failed to establish connection"
                    );
                    let err = self.inner.connect_error(source);
                    let mut state = self.inner.state.lock();
                    let connection = conn.into_connection();
                    state.connections.checked_out.remove(&connection.id());
                    self.inner.destroy_connection(
                        &mut state.connections,
                        connection,
                        ConnectionClosedReason::Unknown,
                    );
                    return Err(self.inner.fail_acquisition(&mut state.connections, err));
                }
            }

            let mut state = self.inner.state.lock();
            let set = &mut state.connections;

            if fresh {
                self.inner.emit(
                    set,
                    PoolEventKind::ConnectionReady {
                        connection: conn.metadata(),
                    },
                );
            }

            // The pool may have been closed or cleared while establishing.
            if set.closed || conn.is_stale(set.generation) {
                let closed = set.closed;
                let connection = conn.into_connection();
                set.checked_out.remove(&connection.id());
                let reason = if closed {
                    ConnectionClosedReason::PoolClosed
                } else {
                    ConnectionClosedReason::Stale
                };
                self.inner.destroy_connection(set, connection, reason);
                if closed {
                    let err = self.inner.closed_error();
                    return Err(self.inner.fail_acquisition(set, err));
                }
                // Back to the head of the line with the original deadline.
                readmit = true;
                continue;
            }

            conn.announced = true;
            set.metrics.checkouts_successful += 1;
            self.inner.emit(
                set,
                PoolEventKind::ConnectionAcquired {
                    connection: conn.metadata(),
                },
            );
            tracing::trace!(
                pool_id = self.inner.config.id,
                connection_id = conn.id(),
                "connection acquired"
            );
            drop(state);
            return Ok(conn);
        }
    }

    /// Try to get an idle connection without waiting.
    ///
    /// Returns `None` when no established idle connection is available or
    /// when other callers are already queued. Never creates a connection.
    ///
    /// A `None` result emits no events. On a closed pool the attempt is
    /// reported as started and then failed with reason `poolClosed`.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection>, PoolError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let set = &mut state.connections;

        if set.closed {
            self.inner
                .emit(set, PoolEventKind::ConnectionAcquisitionStarted);
            let err = self.inner.closed_error();
            return Err(self.inner.fail_acquisition(set, err));
        }
        if state.queue.len() > 0 {
            return Ok(None);
        }

        let now = Instant::now();
        while let Some(conn) = set.available.pop_front() {
            if conn.is_stale(set.generation) {
                self.inner
                    .destroy_connection(set, conn, ConnectionClosedReason::Stale);
            } else if conn.is_idle_expired(self.inner.config.max_idle_time, now) {
                self.inner
                    .destroy_connection(set, conn, ConnectionClosedReason::Idle);
            } else if !conn.is_established() {
                set.available.push_front(conn);
                return Ok(None);
            } else {
                let mut pooled = self.inner.check_out(set, conn);
                pooled.announced = true;
                set.metrics.checkouts_successful += 1;
                self.inner
                    .emit(set, PoolEventKind::ConnectionAcquisitionStarted);
                self.inner.emit(
                    set,
                    PoolEventKind::ConnectionAcquired {
                        connection: pooled.metadata(),
                    },
                );
                return Ok(Some(pooled));
            }
        }
        Ok(None)
    }

    /// Return a connection to the pool.
    ///
    /// The connection is recycled unless `force` is set, the pool is closed,
    /// or the connection predates the last [`clear`](Pool::clear), in which
    /// case it is destroyed. A connection issued by a different pool is
    /// rejected with [`PoolError::ForeignConnection`] and this pool is left
    /// untouched; the connection goes back to the pool that issued it.
    pub fn release(&self, conn: PooledConnection, force: bool) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            let err = self.inner.foreign_error(conn.metadata());
            tracing::warn!(
                pool_id = self.inner.config.id,
                foreign_pool_id = conn.pool.config.id,
                connection_id = conn.id(),
                "rejected release of foreign connection"
            );
            return Err(err);
        }

        self.inner.release_connection(conn.into_connection(), force)
    }

    /// Invalidate every existing connection by bumping the generation.
    ///
    /// Idle connections are discarded when next considered for reuse and
    /// checked-out connections when released.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let set = &mut state.connections;
        set.generation += 1;

        tracing::info!(
            pool_id = self.inner.config.id,
            generation = set.generation,
            "connection pool cleared"
        );
        self.inner.emit(set, PoolEventKind::ConnectionPoolCleared);
    }

    /// Close the pool.
    ///
    /// Pending acquisitions fail with [`PoolError::PoolClosed`], idle
    /// connections are destroyed, and checked-out connections are destroyed
    /// as they are released. Closing an already closed pool does nothing.
    pub fn close(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.connections.closed {
            return;
        }

        state.connections.closed = true;
        state.queue.destroy();
        if let Some(task) = state.maintenance.take() {
            task.abort();
        }

        let set = &mut state.connections;
        while let Some(conn) = set.available.pop_front() {
            self.inner
                .destroy_connection(set, conn, ConnectionClosedReason::PoolClosed);
        }

        tracing::info!(pool_id = self.inner.config.id, "connection pool closed");
        self.inner.emit(set, PoolEventKind::ConnectionPoolClosed);
    }

    /// Tear down background tasks, timers and idle connections without
    /// emitting events.
    ///
    /// Has no observable effect on a pool that was already closed.
    pub fn destroy(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        tracing::debug!(
            pool_id = self.inner.config.id,
            run_loop = state.queue.is_running(),
            waiting = state.queue.len(),
            "destroying connection pool"
        );
        if let Some(task) = state.run_loop.take() {
            task.abort();
        }
        if let Some(task) = state.maintenance.take() {
            task.abort();
        }
        state.queue.destroy();
        state.queue.mark_stopped();

        let set = &mut state.connections;
        set.closed = true;
        set.available.clear();
    }

    /// Create connections until `min_pool_size` is satisfied.
    ///
    /// Returns how many connections were added. Stops at the first
    /// establishment failure and returns it; retrying is up to the caller.
    pub async fn ensure_min_connections(&self) -> Result<usize, PoolError> {
        self.inner.populate_min_pool_size().await
    }

    /// Subscribe to pool events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let set = &state.connections;
        PoolStatus {
            available: set.available.len(),
            in_use: set.checked_out.len(),
            total: set.total(),
            max: self.inner.config.max_pool_size,
            waiting: state.queue.len(),
            generation: set.generation,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock();
        let inner = &state.connections.metrics;
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            stale_evictions: inner.stale_evictions,
            idle_evictions: inner.idle_evictions,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Pool snapshot as carried by events.
    #[must_use]
    pub fn metadata(&self) -> PoolMetadata {
        let state = self.inner.state.lock();
        self.inner.metadata(&state.connections)
    }

    /// Pool id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.config.id
    }

    /// Id of the process that created the pool.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().connections.generation
    }

    /// Server address.
    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.inner.config.address
    }

    /// Available plus checked-out connections.
    #[must_use]
    pub fn total_connection_count(&self) -> usize {
        self.inner.state.lock().connections.total()
    }

    /// Idle connections.
    #[must_use]
    pub fn available_connection_count(&self) -> usize {
        self.inner.state.lock().connections.available.len()
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().connections.closed
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.config.id)
            .field("address", &self.inner.config.address)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
/// let pool = Pool::builder()
///     .address("db.internal:27017".parse()?)
///     .min_pool_size(2)
///     .event_handler(Arc::new(tx))
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
    handlers: Vec<DynPoolEventHandler>,
    factory: Option<DynTransportFactory>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            handlers: Vec::new(),
            factory: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Apply wire-named options on top of the current configuration.
    #[must_use]
    pub fn options(mut self, options: &PoolOptions) -> Self {
        self.pool_config = options.apply(self.pool_config);
        self
    }

    /// Set the pool id.
    #[must_use]
    pub fn id(mut self, id: u32) -> Self {
        self.pool_config.id = id;
        self
    }

    /// Set the server address.
    #[must_use]
    pub fn address(mut self, address: ServerAddress) -> Self {
        self.pool_config.address = address;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.pool_config.min_pool_size = size;
        self
    }

    /// Set the maximum number of connections (0 for unbounded).
    #[must_use]
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.pool_config.max_pool_size = size;
        self
    }

    /// Set the idle eviction threshold.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.pool_config = self.pool_config.max_idle_time(idle);
        self
    }

    /// Set the wait queue capacity (0 for unbounded).
    #[must_use]
    pub fn wait_queue_size(mut self, size: usize) -> Self {
        self.pool_config.wait_queue_size = size;
        self
    }

    /// Set the wait queue timeout.
    #[must_use]
    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config = self.pool_config.wait_queue_timeout(timeout);
        self
    }

    /// Register an event handler. Handlers see every event, including
    /// `connectionPoolCreated`.
    #[must_use]
    pub fn event_handler(mut self, handler: DynPoolEventHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Override how connection transports are created.
    #[must_use]
    pub fn transport_factory(mut self, factory: DynTransportFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the pool.
    ///
    /// Emits `connectionPoolCreated`, then populates `min_pool_size`. A
    /// population failure is logged and left to background maintenance or
    /// [`Pool::ensure_min_connections`].
    pub async fn build(self) -> Result<Pool, PoolError> {
        let config = self.pool_config;
        config.validate()?;

        let state = PoolState {
            connections: ConnectionSet::new(),
            queue: WaitQueue::new(config.wait_queue_size, config.id, config.address.clone()),
            run_loop: None,
            maintenance: None,
        };
        let inner = Arc::new(PoolInner {
            key: NEXT_POOL_KEY.fetch_add(1, Ordering::Relaxed),
            events: EventEmitter::new(self.handlers, config.event_capacity),
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(TcpTransportFactory) as DynTransportFactory),
            pid: std::process::id(),
            created_at: Instant::now(),
            state: Mutex::new(state),
            config,
        });

        {
            let state = inner.state.lock();
            inner.emit(
                &state.connections,
                PoolEventKind::ConnectionPoolCreated {
                    options: inner.config.options(),
                },
            );
        }
        tracing::info!(
            pool_id = inner.config.id,
            address = %inner.config.address,
            min = inner.config.min_pool_size,
            max = inner.config.max_pool_size,
            "connection pool created"
        );

        let pool = Pool { inner };

        if pool.inner.config.min_pool_size > 0 {
            if let Err(e) = pool.ensure_min_connections().await {
                tracing::warn!(
                    pool_id = pool.inner.config.id,
                    error = %e,
                    "failed to populate min_pool_size"
                );
            }
        }

        if let Some(interval) = pool.inner.config.maintenance_interval {
            let task = tokio::spawn(maintain(Arc::downgrade(&pool.inner), interval));
            pool.inner.state.lock().maintenance = Some(task.abort_handle());
        }

        Ok(pool)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Total number of connections.
    pub total: usize,
    /// Maximum allowed connections (0 for unbounded).
    pub max: u32,
    /// Number of queued acquisitions.
    pub waiting: usize,
    /// Current generation.
    pub generation: u64,
}

impl PoolStatus {
    /// Calculate the utilization percentage. Always 0 for unbounded pools.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / f64::from(self.max)) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.max > 0 && self.total >= self.max as usize
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Connections discarded because they predated a clear.
    pub stale_evictions: u64,
    /// Connections discarded because they idled too long.
    pub idle_evictions: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

/// A connection retrieved from the pool.
///
/// Dereferences to [`Connection`]. Pass it to [`Pool::release`] when done;
/// dropping it releases it to its pool without `force`.
pub struct PooledConnection {
    conn: Connection,
    /// Reference to the pool for returning the connection.
    pool: Arc<PoolInner>,
    /// Whether `connectionAcquired` has been emitted for this checkout.
    announced: bool,
    /// Set once `conn` has been handed back; it is then a destroyed shell.
    returned: bool,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolInner>) -> Self {
        Self {
            conn,
            pool,
            announced: false,
            returned: false,
        }
    }

    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> ConnectionMetadata {
        self.conn.metadata()
    }

    fn into_connection(mut self) -> Connection {
        self.returned = true;
        self.conn.detach()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        let conn = self.conn.detach();

        if self.announced {
            tracing::trace!(connection_id = conn.id(), "returning connection to pool");
            if let Err(e) = self.pool.release_connection(conn, false) {
                tracing::warn!(error = %e, "failed to return connection to pool");
            }
        } else {
            // The acquiring caller went away before being handed the connection.
            let mut state = self.pool.state.lock();
            self.pool.reclaim(&mut state.connections, conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .field("pool_id", &self.pool.config.id)
            .finish()
    }
}
