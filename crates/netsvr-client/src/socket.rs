//! Length-prefixed framed TCP connection to one gateway worker address.
//!
//! Frames are `[u32 big-endian length][payload]`. The read and write halves
//! sit behind separate locks so a send can proceed while a receive is
//! blocked, and [`Socket::close`] can run from any task at any time: it flips
//! the state flag, cancels the per-connection token that every in-flight I/O
//! call selects on, and drops whichever halves are not currently in use.

use crate::state::{AtomicConnectionState, ConnectionMetrics, ConnectionState};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use netsvr_core::config::SocketSettings;
use netsvr_core::error::SocketError;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Maximum frame size (2MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Configuration of a framed socket
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Gateway worker address (host:port)
    pub worker_addr: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Bound for writing one frame
    pub send_timeout: Duration,
    /// Bound for reading one frame
    pub receive_timeout: Duration,
    /// Largest payload accepted in either direction
    pub max_frame_size: usize,
}

impl SocketConfig {
    pub fn new(worker_addr: impl Into<String>) -> Self {
        Self {
            worker_addr: worker_addr.into(),
            ..Default::default()
        }
    }

    /// Builds a config from the YAML-facing socket settings.
    pub fn from_settings(worker_addr: impl Into<String>, settings: &SocketSettings) -> Self {
        Self {
            worker_addr: worker_addr.into(),
            connect_timeout: settings.connect_timeout(),
            send_timeout: settings.send_timeout(),
            receive_timeout: settings.receive_timeout(),
            max_frame_size: settings.max_frame_size,
        }
    }

    pub fn with_timeouts(
        mut self,
        receive_timeout: Duration,
        send_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        self.receive_timeout = receive_timeout;
        self.send_timeout = send_timeout;
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            worker_addr: String::new(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(25),
            receive_timeout: Duration::from_secs(25),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Framed TCP connection to a gateway worker address
pub struct Socket {
    config: SocketConfig,
    state: AtomicConnectionState,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    /// Cancelled when the current connection closes; replaced on every connect
    shutdown: parking_lot::Mutex<CancellationToken>,
    metrics: ConnectionMetrics,
}

impl Socket {
    /// Create a detached socket; nothing happens on the network until [`Socket::connect`].
    pub fn new(config: SocketConfig) -> Self {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Self {
            config,
            state: AtomicConnectionState::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            shutdown: parking_lot::Mutex::new(shutdown),
            metrics: ConnectionMetrics::new(),
        }
    }

    pub fn worker_addr(&self) -> &str {
        &self.config.worker_addr
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Lock-free connection check
    pub fn is_connected(&self) -> bool {
        self.state.load() == ConnectionState::Connected
    }

    /// Token cancelled when the current connection closes.
    ///
    /// Background loops select on it to stop promptly. Before the first
    /// connect the returned token is already cancelled.
    pub fn close_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(self.config.max_frame_size)
            .new_codec()
    }

    /// Connect to the gateway, returning false if already connected or on failure.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(SocketError::AlreadyConnected) => false,
            Err(e) => {
                warn!(worker_addr = %self.config.worker_addr, error = %e, "Connect failed");
                false
            }
        }
    }

    /// Establish the TCP connection under the compare-and-swap guard
    #[instrument(skip(self), fields(worker_addr = %self.config.worker_addr))]
    pub async fn try_connect(&self) -> Result<(), SocketError> {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(SocketError::AlreadyConnected);
        }

        // New token first, so a close racing with this connect cancels it
        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let stream = match timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.worker_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.abort_connect(&token);
                return Err(SocketError::ConnectFailed {
                    addr: self.config.worker_addr.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.abort_connect(&token);
                return Err(SocketError::ConnectTimeout {
                    addr: self.config.worker_addr.clone(),
                    timeout_ms: self.config.connect_timeout.as_millis() as u64,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let codec = self.codec();
        *self.reader.lock().await = Some(FramedRead::new(read_half, codec.clone()));
        *self.writer.lock().await = Some(FramedWrite::new(write_half, codec));

        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            // Closed while connecting
            self.reader.lock().await.take();
            self.writer.lock().await.take();
            return Err(SocketError::Closed);
        }

        self.metrics.mark_connected();
        info!("Connected to gateway worker");
        Ok(())
    }

    fn abort_connect(&self, token: &CancellationToken) {
        token.cancel();
        self.state
            .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
        self.metrics.record_error();
    }

    /// Write one frame, returning false on failure.
    pub async fn send(&self, frame: impl Into<Bytes>) -> bool {
        match self.try_send(frame.into()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(worker_addr = %self.config.worker_addr, error = %e, "Send failed");
                false
            }
        }
    }

    /// Write one frame. Any failure after bytes may have hit the wire closes the connection.
    pub async fn try_send(&self, frame: Bytes) -> Result<(), SocketError> {
        if !self.is_connected() {
            return Err(SocketError::NotConnected);
        }
        let size = frame.len();
        if size > self.config.max_frame_size {
            return Err(SocketError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }

        let token = self.close_token();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SocketError::NotConnected)?;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SocketError::Closed),
            sent = timeout(self.config.send_timeout, writer.send(frame)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SocketError::Io(e)),
                Err(_) => Err(SocketError::SendTimeout {
                    timeout_ms: self.config.send_timeout.as_millis() as u64,
                }),
            },
        };

        match result {
            Ok(()) => {
                drop(guard);
                self.metrics.record_sent(size as u64);
                // A close that ran during the write could not take the half
                if !self.is_connected() {
                    Self::reap(&self.state, &self.writer);
                }
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Read one frame, returning None on failure.
    pub async fn receive(&self) -> Option<Bytes> {
        match self.try_receive().await {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(worker_addr = %self.config.worker_addr, error = %e, "Receive failed");
                None
            }
        }
    }

    /// Read one complete frame. Timeouts, short reads and peer close all close the connection.
    pub async fn try_receive(&self) -> Result<Bytes, SocketError> {
        if !self.is_connected() {
            return Err(SocketError::NotConnected);
        }

        let token = self.close_token();
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(SocketError::NotConnected)?;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SocketError::Closed),
            received = timeout(self.config.receive_timeout, reader.next()) => match received {
                Ok(Some(Ok(frame))) => Ok(frame),
                Ok(Some(Err(e))) => Err(SocketError::Io(e)),
                Ok(None) => Err(SocketError::PeerClosed),
                Err(_) => Err(SocketError::ReceiveTimeout {
                    timeout_ms: self.config.receive_timeout.as_millis() as u64,
                }),
            },
        };

        match result {
            Ok(frame) => {
                drop(guard);
                self.metrics.record_received(frame.len() as u64);
                if !self.is_connected() {
                    Self::reap(&self.state, &self.reader);
                }
                Ok(BytesMut::freeze(frame))
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&self, error: &SocketError) {
        if !matches!(error, SocketError::Closed) {
            self.metrics.record_error();
        }
        self.close();
    }

    /// Drop a half left over from a closed connection, if nobody holds it.
    ///
    /// Checked under the lock: a reconnect only installs new halves after
    /// leaving `Disconnected`, so anything found while disconnected is stale.
    fn reap<T>(state: &AtomicConnectionState, half: &Mutex<Option<T>>) {
        if let Ok(mut half) = half.try_lock() {
            if state.load() == ConnectionState::Disconnected {
                half.take();
            }
        }
    }

    /// Close the connection. Idempotent and safe to call concurrently with in-flight I/O.
    pub fn close(&self) {
        let previous = self.state.swap(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }

        self.shutdown.lock().cancel();

        // Halves held by in-flight I/O are dropped by that call once it finishes
        Self::reap(&self.state, &self.reader);
        Self::reap(&self.state, &self.writer);

        self.metrics.mark_disconnected();
        debug!(worker_addr = %self.config.worker_addr, "Socket closed");
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("worker_addr", &self.config.worker_addr)
            .field("state", &self.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn test_config(addr: String) -> SocketConfig {
        SocketConfig::new(addr).with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    /// Accepts one connection and echoes every frame back.
    async fn spawn_echo_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut framed =
                        tokio_util::codec::Framed::new(stream, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        if framed.send(frame.freeze()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_socket_creation() {
        let socket = Socket::new(SocketConfig::new("127.0.0.1:6061"));
        assert!(!socket.is_connected());
        assert_eq!(socket.worker_addr(), "127.0.0.1:6061");
        assert!(socket.close_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let addr = spawn_echo_peer().await;
        let socket = Socket::new(test_config(addr));

        assert!(socket.connect().await);
        assert!(socket.is_connected());
        // Already connected
        assert!(!socket.connect().await);

        socket.close();
        assert!(!socket.is_connected());
        socket.close();
        assert!(!socket.is_connected());
        assert!(socket.close_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let addr = spawn_echo_peer().await;
        let socket = Arc::new(Socket::new(test_config(addr)));
        assert!(socket.connect().await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let socket = Arc::clone(&socket);
                tokio::spawn(async move { socket.close() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!socket.is_connected());
        assert_eq!(socket.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let socket = Socket::new(test_config(addr));
        assert!(!socket.connect().await);
        assert!(!socket.is_connected());
        assert_eq!(socket.metrics().errors(), 1);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let addr = spawn_echo_peer().await;
        let socket = Socket::new(test_config(addr));
        assert!(socket.connect().await);

        for size in [0usize, 1, 4, 1024, 64 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert!(socket.send(payload.clone()).await);
            let echoed = socket.receive().await.expect("echo");
            assert_eq!(echoed.as_ref(), payload.as_slice());
        }
        assert_eq!(socket.metrics().messages_received(), 5);
        socket.close();
    }

    #[tokio::test]
    async fn test_wire_format_is_length_prefixed() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 9];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let socket = Socket::new(test_config(addr));
        assert!(socket.connect().await);
        assert!(socket.send(Bytes::from_static(b"hello")).await);

        let raw = peer.await.unwrap();
        assert_eq!(&raw[..4], &5u32.to_be_bytes());
        assert_eq!(&raw[4..], b"hello");
        socket.close();
    }

    #[tokio::test]
    async fn test_receive_timeout_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let socket = Socket::new(test_config(addr));
        assert!(socket.connect().await);
        assert!(matches!(
            socket.try_receive().await,
            Err(SocketError::ReceiveTimeout { .. })
        ));
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let socket = Socket::new(test_config(addr));
        assert!(socket.connect().await);
        assert!(socket.receive().await.is_none());
        assert!(!socket.is_connected());
        assert!(!socket.send(Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn test_close_interrupts_receive() {
        let addr = spawn_echo_peer().await;
        let socket = Arc::new(Socket::new(
            SocketConfig::new(addr).with_timeouts(
                Duration::from_secs(30),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ),
        ));
        assert!(socket.connect().await);

        let receiver = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move { socket.try_receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.close();

        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receive should observe close")
            .unwrap();
        assert!(matches!(result, Err(SocketError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_racing_io_releases_halves() {
        let addr = spawn_echo_peer().await;
        let socket = Arc::new(Socket::new(test_config(addr)));

        for _ in 0..50 {
            assert!(socket.connect().await);
            let io = {
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if socket.send(Bytes::from_static(b"race")).await {
                        let _ = socket.receive().await;
                    }
                })
            };
            tokio::task::yield_now().await;
            socket.close();
            io.await.unwrap();

            assert!(!socket.is_connected());
            assert!(socket.reader.lock().await.is_none());
            assert!(socket.writer.lock().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let addr = spawn_echo_peer().await;
        let socket = Socket::new(test_config(addr));
        assert!(socket.connect().await);
        socket.close();
        assert!(socket.connect().await);
        assert!(socket.send(Bytes::from_static(b"again")).await);
        assert_eq!(socket.receive().await.unwrap().as_ref(), b"again");
        assert_eq!(socket.metrics().connects(), 2);
        socket.close();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let addr = spawn_echo_peer().await;
        let mut config = test_config(addr);
        config.max_frame_size = 8;
        let socket = Socket::new(config);
        assert!(socket.connect().await);
        assert!(matches!(
            socket.try_send(Bytes::from(vec![0u8; 9])).await,
            Err(SocketError::FrameTooLarge { size: 9, max: 8 })
        ));
        assert!(socket.is_connected());
        socket.close();
    }
}
