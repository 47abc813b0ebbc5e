//! # netsvr-client
//!
//! Long-lived connections from a worker process to netsvr gateway workers.
//!
//! - **Socket**: one framed TCP connection (`[u32 BE length][payload]`) with
//!   separate connect/send/receive timeouts and a lock-free tri-state flag
//! - **MainSocket**: an event connection that registers interest with the
//!   gateway, then runs heartbeat, send and receive loops and dispatches
//!   gateway events to an [`EventHandler`] through a bounded worker pool
//! - **MainSocketManager**: a registry of event connections keyed by encoded
//!   worker address, started and closed as a unit, with opt-in reconnect
//!
//! ## Example
//!
//! ```rust,no_run
//! use netsvr_client::{EventHandler, MainSocket, MainSocketManager, Socket, SocketConfig};
//! use netsvr_core::protocol::{ConnOpen, Events};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Greeter {
//!     async fn on_open(&self, event: ConnOpen) {
//!         println!("client {} connected", event.uniq_id);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let socket = Socket::new(SocketConfig::new("127.0.0.1:6061"));
//!     let main = MainSocket::new(
//!         Arc::new(Greeter),
//!         socket,
//!         "~6YOt5rW35piO~",
//!         Events::ON_OPEN,
//!         10,
//!         Duration::from_secs(10),
//!     );
//!
//!     let manager = MainSocketManager::new();
//!     manager.add_socket(main)?;
//!     if manager.start().await {
//!         // ...
//!         manager.close().await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod main_socket;
pub mod manager;
pub mod socket;
pub mod state;

// Re-export commonly used types
pub use main_socket::{EventHandler, MainSocket};
pub use manager::MainSocketManager;
pub use socket::{Socket, SocketConfig};
pub use state::{ConnectionMetrics, ConnectionState};

// Re-export bytes for convenience
pub use bytes::Bytes;
