//! Mock transports for pool tests.
//!
//! [`MockTransportFactory`] hands out in-memory transports that never touch
//! the network. Connect failures and latency can be scripted, and every call
//! is counted so tests can assert how the pool used its transports.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cmap_pool::{DynTransportFactory, ServerAddress, Transport, TransportFactory};

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    connects: AtomicUsize,
    writes: AtomicUsize,
    bytes_written: AtomicUsize,
    destroys: AtomicUsize,
    failures_remaining: AtomicUsize,
    fail_all: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl Counters {
    fn should_fail(&self) -> bool {
        self.fail_all.load(Ordering::SeqCst)
            || self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

/// Factory for [`MockTransport`]s. Clones share counters and scripts.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    counters: Arc<Counters>,
}

impl MockTransportFactory {
    /// Create a factory whose transports always connect.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This factory as the pool expects it.
    #[must_use]
    pub fn shared(&self) -> DynTransportFactory {
        Arc::new(self.clone())
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.counters.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every connect attempt until turned off again.
    pub fn fail_connects(&self, fail: bool) {
        self.counters.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect attempt.
    pub fn connect_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.counters.connect_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Transports created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Writes so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.counters.bytes_written.load(Ordering::SeqCst)
    }

    /// Transports destroyed so far.
    #[must_use]
    pub fn destroyed(&self) -> usize {
        self.counters.destroys.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, address: &ServerAddress) -> Box<dyn Transport> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockTransport {
            counters: Arc::clone(&self.counters),
            address: address.clone(),
            connected: false,
            destroyed: false,
        })
    }
}

/// In-memory transport handed out by [`MockTransportFactory`].
#[derive(Debug)]
pub struct MockTransport {
    counters: Arc<Counters>,
    address: ServerAddress,
    connected: bool,
    destroyed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> io::Result<()> {
        let delay = self.counters.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }

        if self.counters.should_fail() {
            tracing::debug!(address = %self.address, "mock connect failing");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("mock connection to {} refused", self.address),
            ));
        }

        self.connected = true;
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, payload: Bytes) -> io::Result<()> {
        if !self.connected || self.destroyed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "mock transport not connected",
            ));
        }
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.counters
            .bytes_written
            .fetch_add(payload.len(), Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.connected = false;
            self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }
}
