//! # netsvr-core
//!
//! Shared building blocks for the worker side of a netsvr gateway deployment:
//!
//! - **Errors**: typed error enums built with `thiserror` for sockets, the
//!   command protocol, registries and configuration.
//! - **Addresses**: the fixed-width hex encoding of gateway worker addresses
//!   used as registry keys and embedded in every uniq id.
//! - **Protocol**: command codes, the event interest bitmask and the protobuf
//!   messages exchanged with the gateway.
//! - **Configuration**: YAML-loadable settings with defaults and validation.

pub mod addr;
pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use addr::{uniq_id_to_worker_addr_hex, worker_addr_to_hex};
pub use config::{NetsvrConfig, ReconnectConfig};
pub use error::{NetsvrError, Result};
pub use protocol::{Cmd, Events};
