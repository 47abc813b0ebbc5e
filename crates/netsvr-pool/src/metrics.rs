//! Pool Metrics
//!
//! Per-pool counters kept as atomics for direct inspection and mirrored to
//! the `metrics` facade, labelled by worker address.

use metrics::{counter, describe_counter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pool metrics collector
#[derive(Debug)]
pub struct PoolMetrics {
    worker_addr: String,
    gets: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    create_failures: AtomicU64,
    evicted: AtomicU64,
    released: AtomicU64,
}

impl PoolMetrics {
    pub fn new(worker_addr: impl Into<String>) -> Self {
        describe_counter!("task_pool_gets_total", "Total connection acquisitions attempted");
        describe_counter!(
            "task_pool_timeouts_total",
            "Acquisitions that gave up after the wait timeout"
        );
        describe_counter!("task_pool_created_total", "Connections created by the factory");
        describe_counter!(
            "task_pool_create_failures_total",
            "Connections the factory failed to create"
        );
        describe_counter!(
            "task_pool_evicted_total",
            "Idle connections evicted after a failed heartbeat"
        );
        describe_counter!("task_pool_released_total", "Connections returned by callers");

        Self {
            worker_addr: worker_addr.into(),
            gets: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            created: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_gets_total", "worker_addr" => self.worker_addr.clone()).increment(1);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_timeouts_total", "worker_addr" => self.worker_addr.clone())
            .increment(1);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_created_total", "worker_addr" => self.worker_addr.clone())
            .increment(1);
    }

    pub fn record_create_failure(&self) {
        self.create_failures.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_create_failures_total", "worker_addr" => self.worker_addr.clone())
            .increment(1);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_evicted_total", "worker_addr" => self.worker_addr.clone())
            .increment(1);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
        counter!("task_pool_released_total", "worker_addr" => self.worker_addr.clone())
            .increment(1);
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn create_failures(&self) -> u64 {
        self.create_failures.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}
