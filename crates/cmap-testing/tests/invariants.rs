//! Property tests for pool bookkeeping under random operation sequences.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use cmap_pool::{Pool, PoolError, PooledConnection};
use cmap_testing::MockTransportFactory;
use proptest::collection::vec;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release { index: usize, force: bool },
    Clear,
    Wait(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        3 => (any::<usize>(), any::<bool>()).prop_map(|(index, force)| Op::Release { index, force }),
        1 => Just(Op::Clear),
        1 => (0u64..50).prop_map(Op::Wait),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

async fn pool(max: u32) -> Pool {
    let factory = MockTransportFactory::new();
    Pool::builder()
        .max_pool_size(max)
        .wait_queue_timeout(Duration::from_millis(30))
        .transport_factory(factory.shared())
        .build()
        .await
        .unwrap()
}

/// Apply one operation, returning an error only for unexpected failures.
async fn apply(
    pool: &Pool,
    held: &mut Vec<PooledConnection>,
    op: Op,
) -> Result<(), TestCaseError> {
    match op {
        Op::Acquire => match pool.acquire().await {
            Ok(conn) => {
                prop_assert!(!conn.is_stale(pool.generation()));
                held.push(conn);
            }
            Err(e) => {
                prop_assert!(matches!(e, PoolError::WaitQueueTimeout { .. }), "{e}");
                prop_assert_eq!(pool.status().in_use, pool.config().max_pool_size as usize);
            }
        },
        Op::Release { index, force } => {
            if !held.is_empty() {
                let conn = held.swap_remove(index % held.len());
                pool.release(conn, force).unwrap();
            }
        }
        Op::Clear => pool.clear(),
        Op::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_connection_counts_stay_consistent(
        max in 1u32..5,
        ops in vec(op_strategy(), 1..40),
    ) {
        runtime().block_on(async {
            let pool = pool(max).await;
            let mut held = Vec::new();

            for op in ops {
                apply(&pool, &mut held, op).await?;

                let status = pool.status();
                prop_assert_eq!(status.total, status.available + status.in_use);
                prop_assert!(status.total <= max as usize);
                prop_assert_eq!(status.in_use, held.len());
                prop_assert_eq!(status.waiting, 0);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_close_leaves_only_checked_out_connections(
        max in 1u32..5,
        ops in vec(op_strategy(), 1..30),
    ) {
        runtime().block_on(async {
            let pool = pool(max).await;
            let mut held = Vec::new();

            for op in ops {
                apply(&pool, &mut held, op).await?;
            }

            pool.close();
            let status = pool.status();
            prop_assert_eq!(status.available, 0);
            prop_assert_eq!(status.total, held.len());

            for conn in held.drain(..) {
                pool.release(conn, false).unwrap();
            }
            prop_assert_eq!(pool.total_connection_count(), 0);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
