//! Pooled connections and the factory that creates them.

use crate::pool::PoolShared;
use netsvr_client::{Socket, SocketConfig};
use netsvr_core::error::SocketError;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Creates connected sockets for one worker address
#[derive(Debug, Clone)]
pub struct TaskSocketFactory {
    config: SocketConfig,
}

impl TaskSocketFactory {
    pub fn new(
        worker_addr: impl Into<String>,
        receive_timeout: Duration,
        send_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            config: SocketConfig::new(worker_addr).with_timeouts(
                receive_timeout,
                send_timeout,
                connect_timeout,
            ),
        }
    }

    pub fn from_config(config: SocketConfig) -> Self {
        Self { config }
    }

    pub fn worker_addr(&self) -> &str {
        &self.config.worker_addr
    }

    /// Create a socket and connect it.
    pub async fn make(&self) -> Result<Socket, SocketError> {
        let socket = Socket::new(self.config.clone());
        socket.try_connect().await?;
        Ok(socket)
    }
}

/// A connection borrowed from a [`TaskSocketPool`](crate::TaskSocketPool).
///
/// Dereferences to the underlying [`Socket`]. The connection goes back to its
/// pool when the guard is dropped or [`TaskSocket::release`]d; a connection
/// that failed while borrowed is closed and its slot freed instead.
pub struct TaskSocket {
    socket: ManuallyDrop<Socket>,
    pool: Arc<PoolShared>,
}

impl TaskSocket {
    pub(crate) fn new(socket: Socket, pool: Arc<PoolShared>) -> Self {
        Self {
            socket: ManuallyDrop::new(socket),
            pool,
        }
    }

    /// Return the connection to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for TaskSocket {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

impl Drop for TaskSocket {
    fn drop(&mut self) {
        // SAFETY: `socket` is taken exactly once, here, and never touched again.
        let socket = unsafe { ManuallyDrop::take(&mut self.socket) };
        self.pool.release(socket);
    }
}

impl std::fmt::Debug for TaskSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSocket")
            .field("socket", &*self.socket)
            .finish()
    }
}
