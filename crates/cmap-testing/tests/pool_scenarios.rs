//! Pool behaviour against mock transports.
//!
//! All tests run on a paused clock, so timeouts and run loop ticks are
//! deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cmap_pool::{
    AcquisitionFailedReason, ConnectionClosedReason, Pool, PoolBuilder, PoolConfig, PoolError,
    PoolEventKind,
};
use cmap_testing::{EventRecorder, MockTransportFactory, init_tracing};
use parking_lot::Mutex;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(1);

async fn build(builder: PoolBuilder) -> (Pool, MockTransportFactory, Arc<EventRecorder>) {
    init_tracing();
    let factory = MockTransportFactory::new();
    let recorder = EventRecorder::new();
    let pool = builder
        .transport_factory(factory.shared())
        .event_handler(recorder.clone())
        .build()
        .await
        .unwrap();
    (pool, factory, recorder)
}

fn closed_reasons(recorder: &EventRecorder) -> Vec<ConnectionClosedReason> {
    recorder
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            PoolEventKind::ConnectionClosed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

fn failed_reasons(recorder: &EventRecorder) -> Vec<AcquisitionFailedReason> {
    recorder
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            PoolEventKind::ConnectionAcquisitionFailed { reason } => Some(reason),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Reuse and backpressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_acquire_waits_then_reuses() {
    let (pool, factory, recorder) = build(Pool::builder().max_pool_size(1)).await;

    let first = pool.acquire().await.unwrap();
    assert_eq!(
        recorder.event_types(),
        [
            "connectionPoolCreated",
            "connectionAcquisitionStarted",
            "connectionCreated",
            "connectionReady",
            "connectionAcquired",
        ]
    );

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionAcquisitionStarted", 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    pool.release(first, false).unwrap();
    let second = waiter.await.unwrap().unwrap();

    assert_eq!(second.id(), 1);
    assert_eq!(factory.created(), 1);
    assert_eq!(recorder.count("connectionCreated"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_wait_queue_rejects_immediately() {
    let (pool, _factory, recorder) =
        build(Pool::builder().max_pool_size(1).wait_queue_size(1)).await;
    let held = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionAcquisitionStarted", 2, WAIT).await);
    assert_eq!(pool.status().waiting, 1);

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::WaitQueueFull { .. }));
    assert!(err.is_transient());
    assert_eq!(started.elapsed(), Duration::ZERO);

    // The rejected request never took a slot.
    assert_eq!(pool.status().waiting, 1);
    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::QueueFull]);

    drop(held);
    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_queue_timeout() {
    let (pool, _factory, recorder) = build(
        Pool::builder()
            .max_pool_size(1)
            .wait_queue_timeout(Duration::from_millis(50)),
    )
    .await;
    let _held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::WaitQueueTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(60), "elapsed {elapsed:?}");

    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::Timeout]);
    assert_eq!(pool.status().waiting, 0);
    assert_eq!(pool.metrics().checkouts_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_order() {
    let (pool, _factory, recorder) = build(Pool::builder().max_pool_size(1)).await;
    let held = pool.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(conn, false).unwrap();
        }));
        assert!(recorder.wait_for("connectionAcquisitionStarted", i + 2, WAIT).await);
    }

    pool.release(held, false).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
    assert_eq!(pool.total_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_pool_keeps_creating() {
    let (pool, factory, recorder) = build(Pool::builder().max_pool_size(0)).await;

    let mut held = Vec::new();
    for _ in 0..150 {
        held.push(pool.acquire().await.unwrap());
    }

    let status = pool.status();
    assert_eq!(status.total, 150);
    assert_eq!(status.in_use, 150);
    assert_eq!(status.waiting, 0);
    assert_eq!(factory.created(), 150);
    assert!(failed_reasons(&recorder).is_empty());

    for conn in held.drain(..) {
        pool.release(conn, false).unwrap();
    }
    assert_eq!(pool.available_connection_count(), 150);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_acquire_does_not_leak() {
    let (pool, _factory, _recorder) = build(Pool::builder().max_pool_size(1)).await;
    let held = pool.acquire().await.unwrap();

    let attempt = tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
    assert!(attempt.is_err());

    pool.release(held, false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = pool.status();
    assert_eq!(status.waiting, 0);
    assert_eq!(status.available, 1);
    assert_eq!(status.in_use, 0);
    assert_eq!(pool.acquire().await.unwrap().id(), 1);
}

// =============================================================================
// Generations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_clear_evicts_lazily() {
    let (pool, _factory, recorder) = build(Pool::builder()).await;

    let checked_out = pool.acquire().await.unwrap();
    let idle = pool.acquire().await.unwrap();
    pool.release(idle, false).unwrap();

    pool.clear();
    assert_eq!(pool.generation(), 1);
    // Nothing is destroyed up front.
    assert_eq!(pool.available_connection_count(), 1);
    assert!(closed_reasons(&recorder).is_empty());

    pool.release(checked_out, false).unwrap();
    assert_eq!(closed_reasons(&recorder), [ConnectionClosedReason::Stale]);
    assert_eq!(pool.available_connection_count(), 1);

    let fresh = pool.acquire().await.unwrap();
    assert_eq!(fresh.id(), 3);
    assert_eq!(fresh.generation(), 1);
    assert_eq!(
        closed_reasons(&recorder),
        [ConnectionClosedReason::Stale, ConnectionClosedReason::Stale]
    );
    assert_eq!(pool.metrics().stale_evictions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_during_establishment_keeps_place_in_line() {
    let (pool, factory, recorder) = build(
        Pool::builder()
            .max_pool_size(1)
            .wait_queue_timeout(Duration::from_millis(150)),
    )
    .await;
    factory.connect_delay(Duration::from_millis(80));

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionCreated", 1, WAIT).await);
    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionAcquisitionStarted", 2, WAIT).await);

    // Invalidates the connection the first caller is still establishing.
    pool.clear();

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.id(), 2);
    assert_eq!(first.generation(), 1);

    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::WaitQueueTimeout { .. }));
    assert_eq!(closed_reasons(&recorder), [ConnectionClosedReason::Stale]);
    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn test_readmission_keeps_original_deadline() {
    let (pool, factory, recorder) =
        build(Pool::builder().wait_queue_timeout(Duration::from_millis(100))).await;
    factory.connect_delay(Duration::from_millis(120));

    let started = Instant::now();
    let attempt = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionCreated", 1, WAIT).await);
    pool.clear();

    let err = attempt.await.unwrap().unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, PoolError::WaitQueueTimeout { .. }));
    // Fails as soon as the stale connection is discarded, not a full timeout later.
    assert!(elapsed < Duration::from_millis(140), "elapsed {elapsed:?}");
    assert_eq!(closed_reasons(&recorder), [ConnectionClosedReason::Stale]);
    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::Timeout]);
    assert_eq!(factory.created(), 1);
    assert_eq!(pool.status().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_release_to_foreign_pool() {
    let (pool1, _f1, recorder1) = build(Pool::builder().id(7)).await;
    let (pool2, _f2, _recorder2) = build(Pool::builder().id(7)).await;

    let conn = pool2.acquire().await.unwrap();
    let events_before = recorder1.events().len();

    let err = pool1.release(conn, false).unwrap_err();
    assert!(matches!(
        err,
        PoolError::ForeignConnection { pool_id: 7, ref connection, .. } if connection.id == 1
    ));
    assert_eq!(err.error_type(), "poolReleaseForeignConnectionError");

    assert_eq!(recorder1.events().len(), events_before);
    assert_eq!(pool1.total_connection_count(), 0);
    assert_eq!(pool2.available_connection_count(), 1);
}

// =============================================================================
// Close and destroy
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_fails_waiters_and_is_idempotent() {
    let (pool, factory, recorder) = build(Pool::builder().max_pool_size(1)).await;
    let held = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionAcquisitionStarted", 2, WAIT).await);

    pool.close();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed { .. }));
    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::PoolClosed]);

    pool.release(held, false).unwrap();
    assert_eq!(closed_reasons(&recorder), [ConnectionClosedReason::PoolClosed]);
    assert_eq!(factory.destroyed(), 1);

    let events = recorder.events().len();
    pool.close();
    pool.destroy();
    assert_eq!(recorder.events().len(), events);
    assert_eq!(recorder.count("connectionPoolClosed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_tears_down_silently() {
    let (pool, factory, recorder) = build(Pool::builder().min_pool_size(2)).await;
    let events = recorder.events().len();

    pool.destroy();
    assert!(pool.is_closed());
    assert_eq!(pool.total_connection_count(), 0);
    assert_eq!(factory.destroyed(), 2);
    assert_eq!(recorder.events().len(), events);
}

// =============================================================================
// Establishment, idle time, min pool size
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_establishment_is_not_retried() {
    let (pool, factory, recorder) = build(Pool::builder()).await;
    factory.fail_next_connects(1);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Connect { .. }));
    assert_eq!(factory.created(), 1);
    assert_eq!(
        closed_reasons(&recorder),
        [ConnectionClosedReason::Unknown]
    );
    assert_eq!(
        failed_reasons(&recorder),
        [AcquisitionFailedReason::ConnectionError]
    );
    assert_eq!(pool.total_connection_count(), 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), 2);
    assert_eq!(factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_evicted() {
    let (pool, _factory, recorder) =
        build(Pool::builder().max_idle_time(Duration::from_millis(100))).await;

    let conn = pool.acquire().await.unwrap();
    pool.release(conn, false).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), 1);
    pool.release(conn, false).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), 2);
    assert_eq!(closed_reasons(&recorder), [ConnectionClosedReason::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_background_maintenance_restores_min_pool_size() {
    let config = PoolConfig::new()
        .min_pool_size(2)
        .maintenance_interval(Duration::from_millis(100));
    let (pool, factory, _recorder) = build(Pool::builder().pool_config(config)).await;
    assert_eq!(pool.available_connection_count(), 2);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a, true).unwrap();
    pool.release(b, true).unwrap();
    assert_eq!(pool.total_connection_count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.available_connection_count(), 2);
    assert_eq!(factory.created(), 4);

    pool.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.created(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_write_goes_through_transport() {
    let (pool, factory, _recorder) = build(Pool::builder()).await;

    let mut conn = pool.acquire().await.unwrap();
    conn.write(Bytes::from_static(b"hello")).await.unwrap();
    pool.release(conn, false).unwrap();

    assert_eq!(factory.writes(), 1);
    assert_eq!(factory.bytes_written(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_try_acquire_does_not_jump_the_queue() {
    let (pool, _factory, recorder) = build(Pool::builder().max_pool_size(2)).await;
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    assert!(recorder.wait_for("connectionAcquisitionStarted", 3, WAIT).await);

    pool.release(a, false).unwrap();
    assert!(pool.try_acquire().unwrap().is_none());

    let served = waiter.await.unwrap().unwrap();
    assert_eq!(served.id(), 1);
    drop(b);
    assert_eq!(pool.try_acquire().unwrap().unwrap().id(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_try_acquire_on_closed_pool_reports_failure() {
    let (pool, _factory, recorder) = build(Pool::builder()).await;

    assert!(pool.try_acquire().unwrap().is_none());
    assert_eq!(recorder.count("connectionAcquisitionStarted"), 0);

    pool.close();
    let err = pool.try_acquire().unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed { .. }));
    assert_eq!(recorder.count("connectionAcquisitionStarted"), 1);
    assert_eq!(failed_reasons(&recorder), [AcquisitionFailedReason::PoolClosed]);
    assert_eq!(pool.metrics().checkouts_failed, 1);
}
