use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use regflow_core::Priority;
use regflow_memory::MemoryPressure;
use regflow_scheduler::{AllocationStrategy, PermitAllocator, PermitConfig, PermitError};

fn pool(total: usize, limit: f64, strategy: AllocationStrategy) -> PermitAllocator {
    PermitAllocator::new(PermitConfig {
        total_permits: total,
        memory_limit_mb: limit,
        strategy,
        acquire_timeout: Duration::from_secs(30),
        ..PermitConfig::default()
    })
}

async fn wait_for_queue(pool: &PermitAllocator, len: usize) {
    while pool.queued() != len {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn eleventh_permit_times_out() {
    let pool = pool(10, 1000.0, AllocationStrategy::Fairness);
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(pool.acquire(1.0, Priority::Normal).await.unwrap());
    }

    let err = pool
        .acquire_with_timeout(1.0, Priority::Normal, Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PermitError::Timeout { .. }), "{err:?}");

    let stats = pool.stats();
    assert_eq!(stats.active, 10);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.usage.timeouts, 1);

    pool.release(held[0].id);
    assert!(pool
        .acquire_with_timeout(1.0, Priority::Normal, Duration::from_millis(1))
        .await
        .is_ok());
}

async fn grant_order(
    strategy: AllocationStrategy,
    requests: Vec<(&'static str, f64, Priority)>,
) -> Vec<&'static str> {
    let pool = pool(1, 100.0, strategy);
    let blocker = pool.try_acquire(1.0, Priority::Normal).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (i, (name, memory, priority)) in requests.into_iter().enumerate() {
        let task_pool = pool.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let permit = task_pool.acquire(memory, priority).await.unwrap();
            order.lock().push(name);
            task_pool.release(permit.id);
        }));
        wait_for_queue(&pool, i + 1).await;
    }

    pool.release(blocker.id);
    for handle in handles {
        handle.await.unwrap();
    }
    let granted = order.lock().clone();
    granted
}

#[tokio::test]
async fn fairness_grants_in_arrival_order() {
    let order = grant_order(
        AllocationStrategy::Fairness,
        vec![
            ("a", 30.0, Priority::Low),
            ("b", 10.0, Priority::Critical),
            ("c", 20.0, Priority::Normal),
        ],
    )
    .await;
    assert_eq!(order, ["a", "b", "c"]);
}

#[tokio::test]
async fn priority_grants_highest_first_then_arrival() {
    let order = grant_order(
        AllocationStrategy::Priority,
        vec![
            ("low", 1.0, Priority::Low),
            ("high", 1.0, Priority::High),
            ("normal-1", 1.0, Priority::Normal),
            ("normal-2", 1.0, Priority::Normal),
        ],
    )
    .await;
    assert_eq!(order, ["high", "normal-1", "normal-2", "low"]);
}

#[tokio::test]
async fn memory_optimized_grants_smallest_first() {
    let order = grant_order(
        AllocationStrategy::MemoryOptimized,
        vec![
            ("large", 30.0, Priority::High),
            ("small", 10.0, Priority::Low),
            ("medium", 20.0, Priority::Normal),
        ],
    )
    .await;
    assert_eq!(order, ["small", "medium", "large"]);
}

#[tokio::test]
async fn blocked_head_is_not_skipped() {
    let pool = pool(10, 100.0, AllocationStrategy::Fairness);
    let big = pool.try_acquire(60.0, Priority::Normal).unwrap();

    let large = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire(50.0, Priority::Normal).await }
    });
    wait_for_queue(&pool, 1).await;
    let small = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire(10.0, Priority::Normal).await }
    });
    wait_for_queue(&pool, 2).await;

    // 10mb would fit, but it is queued behind the 50mb request.
    assert_eq!(pool.active_count(), 1);
    assert!(pool.try_acquire(1.0, Priority::Critical).is_none());

    pool.release(big.id);
    let large = large.await.unwrap().unwrap();
    let small = small.await.unwrap().unwrap();
    assert_eq!(large.estimated_memory_mb, 50.0);
    assert_eq!(small.estimated_memory_mb, 10.0);
    assert!((pool.committed_mb() - 60.0).abs() < 1e-9);
}

#[tokio::test]
async fn dropped_waiter_leaves_nothing_behind() {
    let pool = pool(1, 100.0, AllocationStrategy::Fairness);
    let held = pool.try_acquire(1.0, Priority::Normal).unwrap();

    let outer = tokio::time::timeout(
        Duration::from_millis(5),
        pool.acquire_with_timeout(1.0, Priority::Normal, Duration::from_secs(60)),
    )
    .await;
    assert!(outer.is_err());
    assert_eq!(pool.queued(), 0);

    pool.release(held.id);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn growing_capacity_admits_waiters() {
    let pool = pool(10, 1000.0, AllocationStrategy::Fairness);
    pool.adjust_for_pressure(MemoryPressure::Critical);
    for _ in 0..5 {
        pool.try_acquire(1.0, Priority::Normal).unwrap();
    }

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire(1.0, Priority::Normal).await }
    });
    wait_for_queue(&pool, 1).await;

    pool.adjust_for_pressure(MemoryPressure::Normal);
    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(pool.active_count(), 6);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(f64),
    Release(usize),
    Pressure(MemoryPressure),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0.0f64..60.0).prop_map(Op::Acquire),
        3 => (0usize..16).prop_map(Op::Release),
        1 => prop_oneof![
            Just(MemoryPressure::Normal),
            Just(MemoryPressure::Moderate),
            Just(MemoryPressure::High),
            Just(MemoryPressure::Critical),
        ]
        .prop_map(Op::Pressure),
    ]
}

proptest! {
    #[test]
    fn committed_memory_never_exceeds_limit(
        total in 1usize..16,
        limit in 10.0f64..200.0,
        ops in prop::collection::vec(op(), 0..120),
    ) {
        let pool = pool(total, limit, AllocationStrategy::Fairness);
        let mut held = Vec::new();
        for op in ops {
            match op {
                Op::Acquire(mb) => {
                    if let Some(permit) = pool.try_acquire(mb, Priority::Normal) {
                        held.push(permit);
                    }
                }
                Op::Release(i) => {
                    if !held.is_empty() {
                        let permit = held.swap_remove(i % held.len());
                        prop_assert!(pool.release(permit.id));
                    }
                }
                Op::Pressure(pressure) => {
                    pool.adjust_for_pressure(pressure);
                }
            }
            let stats = pool.stats();
            prop_assert!(stats.committed_mb <= limit + 1e-6);
            prop_assert_eq!(stats.active, held.len());
            prop_assert_eq!(stats.available + stats.active, stats.capacity.max(stats.active));
        }

        for _ in 0..total {
            pool.adjust_for_pressure(MemoryPressure::Normal);
        }
        let stats = pool.stats();
        prop_assert_eq!(stats.capacity, total);
        prop_assert_eq!(stats.available + stats.active, total);
    }
}
