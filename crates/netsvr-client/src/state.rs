use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Connection state of a framed socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport
    Disconnected = 0,
    /// A connect is in flight
    Connecting = 1,
    /// Transport established
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Lock-free tri-state connection flag
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `current` to `new`, returning false if the state was not `current`.
    pub fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally stores `new`, returning the previous state.
    pub fn swap(&self, new: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(new as u8, Ordering::AcqRel))
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for tracking connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Total bytes sent
    bytes_sent: Arc<AtomicU64>,
    /// Total bytes received
    bytes_received: Arc<AtomicU64>,
    /// Total frames sent
    messages_sent: Arc<AtomicU64>,
    /// Total frames received
    messages_received: Arc<AtomicU64>,
    /// Total errors encountered
    errors: Arc<AtomicU64>,
    /// Number of successful connects over the socket's lifetime
    connects: Arc<AtomicU64>,
    /// Last activity timestamp
    last_activity: Arc<parking_lot::RwLock<SystemTime>>,
    /// Connection established timestamp
    connected_at: Arc<parking_lot::RwLock<Option<SystemTime>>>,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicU64::new(0)),
            last_activity: Arc::new(parking_lot::RwLock::new(SystemTime::now())),
            connected_at: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    /// Record a frame sent
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.update_last_activity();
    }

    /// Record a frame received
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.update_last_activity();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_last_activity(&self) {
        *self.last_activity.write() = SystemTime::now();
    }

    /// Mark connection as established
    pub fn mark_connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        *self.connected_at.write() = Some(SystemTime::now());
        self.update_last_activity();
    }

    /// Mark connection as disconnected
    pub fn mark_disconnected(&self) {
        *self.connected_at.write() = None;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> SystemTime {
        *self.last_activity.read()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        *self.connected_at.read()
    }
}
