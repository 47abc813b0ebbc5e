//! # netsvr-pool
//!
//! Pooled request/response connections to netsvr gateway workers.
//!
//! ```text
//!   TaskSocketPoolManager      keyed by encoded worker address
//!            │
//!            ▼
//!     TaskSocketPool           one per worker address
//!      ├─ ready   (flume)      idle, connected sockets
//!      ├─ tokens  (Semaphore)  slots not yet connected
//!      └─ heartbeat task       pings idle sockets, evicts dead ones
//!            │
//!            ▼
//!       TaskSocket             borrowed guard, returned on drop
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use netsvr_pool::{TaskSocketFactory, TaskSocketPool, TaskSocketPoolManager};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let factory = TaskSocketFactory::new(
//!     "127.0.0.1:6061",
//!     Duration::from_secs(10),
//!     Duration::from_secs(10),
//!     Duration::from_secs(10),
//! );
//! let pool = TaskSocketPool::new(
//!     10,
//!     factory,
//!     Duration::from_secs(10),
//!     Duration::from_secs(10),
//!     "~6YOt5rW35piO~",
//! );
//! pool.loop_heartbeat();
//!
//! let manager = TaskSocketPoolManager::new();
//! let key = manager.add_socket(pool)?;
//! if let Some(socket) = manager.get_socket(&key).await {
//!     socket.send(&b"payload"[..]).await;
//! }
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod metrics;
pub mod pool;
pub mod task_socket;

// Re-export main types
pub use manager::TaskSocketPoolManager;
pub use self::metrics::PoolMetrics;
pub use pool::TaskSocketPool;
pub use task_socket::{TaskSocket, TaskSocketFactory};
