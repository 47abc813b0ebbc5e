//! Error types for the worker-side gateway connection layer.
//!
//! Public connection operations report failures as `bool`/`Option` results;
//! the typed errors here are what the fallible `try_*` variants return and
//! what gets logged before a failure is collapsed at the public boundary.

use std::io;
use thiserror::Error;

/// Result type alias using NetsvrError as the error type.
pub type Result<T> = std::result::Result<T, NetsvrError>;

/// Top-level error type for all netsvr operations.
#[derive(Debug, Error)]
pub enum NetsvrError {
    /// Socket-level failures
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// Frame or protobuf decoding failures
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Registry misuse
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by a single framed TCP connection.
///
/// Every variant except [`SocketError::AlreadyConnected`],
/// [`SocketError::NotConnected`] and [`SocketError::FrameTooLarge`] leaves the
/// connection closed.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to establish the TCP connection
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// TCP connect did not finish in time
    #[error("Connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    /// A connect is already in progress or established
    #[error("Connection already established")]
    AlreadyConnected,

    /// The connection is not established
    #[error("Not connected")]
    NotConnected,

    /// Write did not finish in time
    #[error("Send timed out after {timeout_ms}ms")]
    SendTimeout { timeout_ms: u64 },

    /// No complete frame arrived in time
    #[error("Receive timed out after {timeout_ms}ms")]
    ReceiveTimeout { timeout_ms: u64 },

    /// The peer closed the connection
    #[error("Connection closed by peer")]
    PeerClosed,

    /// The connection was closed locally while the operation was in flight
    #[error("Connection closed locally")]
    Closed,

    /// Outgoing frame exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Underlying I/O failure (reset, short read, oversized inbound frame)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Returns true if retrying the operation on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::ConnectTimeout { .. }
                | Self::SendTimeout { .. }
                | Self::ReceiveTimeout { .. }
                | Self::PeerClosed
                | Self::Io(_)
        )
    }
}

/// Errors decoding the command layer carried inside a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is too short to carry a command code
    #[error("Frame of {len} bytes is too short to carry a command code")]
    FrameTooShort { len: usize },

    /// Command code not known to this build
    #[error("Unknown command code {code}")]
    UnknownCommand { code: u32 },

    /// A reply arrived for a different command than the one awaited
    #[error("Expected reply to command {expected}, got {actual}")]
    UnexpectedCommand { expected: u32, actual: u32 },

    /// Protobuf body could not be decoded
    #[error("Failed to decode message body: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Gateway answered with a non-zero result code
    #[error("Gateway rejected {command}: code {code}, {message}")]
    Rejected {
        command: String,
        code: i32,
        message: String,
    },
}

/// Errors from the address encoding and the connection registries.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Address cannot be turned into a registry key
    #[error("Invalid worker address '{addr}': {reason}")]
    InvalidWorkerAddr { addr: String, reason: String },

    /// Another entry already owns the key
    #[error("Worker {worker_addr} is already registered")]
    DuplicateWorker { worker_addr: String },

    /// Entries can only be added before the registry is started
    #[error("Registry already started")]
    AlreadyStarted,
}

impl RegistryError {
    /// Creates an invalid address error.
    pub fn invalid_addr(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkerAddr {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Configuration could not be parsed
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// No worker addresses configured
    #[error("No worker addresses configured")]
    NoWorkers,

    /// A value is out of range or inconsistent
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_transient() {
        assert!(SocketError::ReceiveTimeout { timeout_ms: 10 }.is_transient());
        assert!(SocketError::PeerClosed.is_transient());
        assert!(!SocketError::AlreadyConnected.is_transient());
        assert!(!SocketError::FrameTooLarge { size: 2, max: 1 }.is_transient());
    }

    #[test]
    fn test_error_conversion() {
        let err: NetsvrError = SocketError::NotConnected.into();
        assert!(matches!(err, NetsvrError::Socket(SocketError::NotConnected)));
        assert_eq!(err.to_string(), "Socket error: Not connected");

        let err: NetsvrError = ProtocolError::UnknownCommand { code: 99 }.into();
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_registry_error_helpers() {
        let err = RegistryError::invalid_addr("nope", "missing port");
        assert_eq!(
            err.to_string(),
            "Invalid worker address 'nope': missing port"
        );
    }
}
