//! Bounded pool of request/response connections to one worker address.
//!
//! Capacity is tracked by two primitives and nothing else:
//!
//! - `ready`: a bounded channel of idle, connected sockets
//! - `tokens`: a semaphore of slots not yet materialized into a socket
//!
//! A `get` takes an idle socket if one is queued, otherwise forgets one token
//! and creates a socket for it. Every path that throws a socket away adds the
//! token back, so `idle + tokens + borrowed == size` holds at every step. A
//! socket out for a heartbeat ping counts as idle.

use crate::metrics::PoolMetrics;
use crate::task_socket::{TaskSocket, TaskSocketFactory};
use bytes::Bytes;
use netsvr_client::{Socket, SocketConfig};
use netsvr_core::config::NetsvrConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Slot {
    Ready(Socket),
    Token,
}

/// A forgotten token held while its socket is being made.
///
/// Dropping the guard, including by cancelling `get` mid-connect, gives the
/// token back to the pool.
struct TokenGuard<'a> {
    shared: &'a PoolShared,
    armed: bool,
}

impl<'a> TokenGuard<'a> {
    fn new(shared: &'a PoolShared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    /// The token now belongs to a live socket.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.tokens.add_permits(1);
        }
    }
}

/// State shared between the pool handle, its heartbeat task and borrowed sockets
pub(crate) struct PoolShared {
    size: usize,
    ready_tx: flume::Sender<Socket>,
    ready_rx: flume::Receiver<Socket>,
    tokens: Semaphore,
    factory: TaskSocketFactory,
    wait_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat: Bytes,
    closed: AtomicBool,
    pinging: AtomicUsize,
    shutdown: CancellationToken,
    metrics: PoolMetrics,
}

impl PoolShared {
    fn worker_addr(&self) -> &str {
        self.factory.worker_addr()
    }

    async fn acquire_slot(&self) -> Option<Slot> {
        loop {
            let slot = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                ready = self.ready_rx.recv_async() => Slot::Ready(ready.ok()?),
                permit = self.tokens.acquire() => {
                    permit.ok()?.forget();
                    Slot::Token
                }
            };
            match slot {
                // Died while idle; its slot becomes a token again
                Slot::Ready(socket) if !socket.is_connected() => self.discard(socket),
                slot => return Some(slot),
            }
        }
    }

    /// Close `socket` and turn its slot back into a token.
    fn discard(&self, socket: Socket) {
        socket.close();
        self.tokens.add_permits(1);
    }

    fn drain(&self) {
        for socket in self.ready_rx.drain() {
            self.discard(socket);
        }
    }

    pub(crate) fn release(&self, socket: Socket) {
        self.metrics.record_released();
        self.put_back(socket);
    }

    fn put_back(&self, socket: Socket) {
        if self.closed.load(Ordering::SeqCst) || !socket.is_connected() {
            self.discard(socket);
            return;
        }
        if let Err(full) = self.ready_tx.try_send(socket) {
            self.discard(full.into_inner());
            return;
        }
        // Close may have drained before the push landed
        if self.closed.load(Ordering::SeqCst) {
            self.drain();
        }
    }

    async fn heartbeat_until_closed(&self) {
        let period = self.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_idle().await,
            }
        }
        debug!(worker_addr = %self.worker_addr(), "loop heartbeat quit");
    }

    /// Ping each socket idle at the start of the round, one at a time.
    async fn heartbeat_idle(&self) {
        for _ in 0..self.ready_rx.len() {
            let Ok(socket) = self.ready_rx.try_recv() else {
                break;
            };
            self.pinging.fetch_add(1, Ordering::SeqCst);
            let alive = self.ping(&socket).await;
            self.pinging.fetch_sub(1, Ordering::SeqCst);
            if alive {
                self.put_back(socket);
            } else {
                self.metrics.record_evicted();
                warn!(worker_addr = %self.worker_addr(), "Evicting dead pooled connection");
                self.discard(socket);
            }
        }
    }

    /// Heartbeat round trip, bounded by half the wait timeout so a waiting
    /// `get` always sees the socket again, or its token, before giving up.
    async fn ping(&self, socket: &Socket) -> bool {
        let exchange = async {
            socket.send(self.heartbeat.clone()).await
                && matches!(socket.receive().await, Some(echo) if echo == self.heartbeat)
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            alive = timeout(self.wait_timeout / 2, exchange) => alive.unwrap_or(false),
        }
    }

    /// Mark closed and release idle sockets. Returns false if already closed.
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        self.drain();
        true
    }
}

/// Connection pool for one gateway worker address
pub struct TaskSocketPool {
    shared: Arc<PoolShared>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSocketPool {
    pub fn new(
        size: usize,
        factory: TaskSocketFactory,
        wait_timeout: Duration,
        heartbeat_interval: Duration,
        heartbeat: impl Into<Bytes>,
    ) -> Self {
        let (ready_tx, ready_rx) = flume::bounded(size);
        let metrics = PoolMetrics::new(factory.worker_addr());
        Self {
            shared: Arc::new(PoolShared {
                size,
                ready_tx,
                ready_rx,
                tokens: Semaphore::new(size),
                factory,
                wait_timeout,
                heartbeat_interval,
                heartbeat: heartbeat.into(),
                closed: AtomicBool::new(false),
                pinging: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                metrics,
            }),
            heartbeat_task: Mutex::new(None),
        }
    }

    /// Builds a pool for `worker_addr` from the loaded configuration.
    pub fn from_config(worker_addr: &str, config: &NetsvrConfig) -> Self {
        let factory =
            TaskSocketFactory::from_config(SocketConfig::from_settings(worker_addr, &config.socket));
        Self::new(
            config.task_pool.size,
            factory,
            config.task_pool.wait_timeout(),
            config.task_pool.heartbeat_interval(),
            config.heartbeat_message.clone(),
        )
    }

    /// Borrow a connection, waiting up to the wait timeout.
    ///
    /// Returns None if the pool is closed, if nothing frees up in time, or if
    /// creating a new connection fails. In the last case the slot is returned
    /// and the caller may retry.
    pub async fn get(&self) -> Option<TaskSocket> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        shared.metrics.record_get();

        let slot = match timeout(shared.wait_timeout, shared.acquire_slot()).await {
            Ok(Some(slot)) => slot,
            Ok(None) => return None,
            Err(_) => {
                shared.metrics.record_timeout();
                debug!(worker_addr = %shared.worker_addr(), "Timed out waiting for a pooled connection");
                return None;
            }
        };

        let socket = match slot {
            Slot::Ready(socket) => socket,
            Slot::Token => {
                let token = TokenGuard::new(shared);
                match shared.factory.make().await {
                    Ok(socket) => {
                        token.disarm();
                        shared.metrics.record_created();
                        socket
                    }
                    Err(e) => {
                        drop(token);
                        shared.metrics.record_create_failure();
                        warn!(worker_addr = %shared.worker_addr(), error = %e, "Failed to create pooled connection");
                        return None;
                    }
                }
            }
        };

        if shared.closed.load(Ordering::SeqCst) {
            shared.discard(socket);
            return None;
        }
        Some(TaskSocket::new(socket, Arc::clone(shared)))
    }

    /// Return a borrowed connection. Same as dropping it.
    pub fn release(&self, socket: TaskSocket) {
        socket.release();
    }

    /// Start pinging idle connections every heartbeat interval. Idempotent.
    pub fn loop_heartbeat(&self) {
        let mut task = self.heartbeat_task.lock();
        if task.is_some() || self.is_closed() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            shared.heartbeat_until_closed().await;
        }));
    }

    /// Close the pool. Idempotent.
    ///
    /// Idle connections are closed now; borrowed ones are closed when released.
    pub async fn close(&self) {
        if self.shared.mark_closed() {
            info!(worker_addr = %self.worker_addr(), "Task socket pool closed");
        }
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.drain();
    }

    pub fn worker_addr(&self) -> &str {
        self.shared.worker_addr()
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Connections not borrowed: waiting in the ready buffer or out for a heartbeat
    pub fn idle_count(&self) -> usize {
        self.shared.ready_rx.len() + self.shared.pinging.load(Ordering::SeqCst)
    }

    /// Slots not yet materialized into a connection
    pub fn available_tokens(&self) -> usize {
        self.shared.tokens.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }
}

impl Drop for TaskSocketPool {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

impl std::fmt::Debug for TaskSocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSocketPool")
            .field("worker_addr", &self.worker_addr())
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .field("tokens", &self.available_tokens())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    const HEARTBEAT: &[u8] = b"~6YOt5rW35piO~";

    /// Echoes every frame back on every accepted connection.
    async fn spawn_echo_gateway() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
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

    fn pool(addr: String, size: usize, wait: Duration) -> TaskSocketPool {
        let factory = TaskSocketFactory::new(
            addr,
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        TaskSocketPool::new(size, factory, wait, Duration::from_secs(10), HEARTBEAT)
    }

    #[tokio::test]
    async fn test_get_consumes_token() {
        let addr = spawn_echo_gateway().await;
        let pool = pool(addr.clone(), 10, Duration::from_secs(1));

        let socket = pool.get().await.expect("socket");
        assert!(socket.is_connected());
        assert_eq!(socket.worker_addr(), addr);
        assert_eq!(pool.available_tokens(), 9);
        assert_eq!(pool.idle_count(), 0);

        socket.release();
        assert_eq!(pool.available_tokens(), 9);
        assert_eq!(pool.idle_count(), 1);

        // Reuses the idle connection
        let _socket = pool.get().await.expect("socket");
        assert_eq!(pool.metrics().created(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let addr = spawn_echo_gateway().await;
        let pool = pool(addr, 2, Duration::from_millis(200));

        let first = pool.get().await;
        let second = pool.get().await;
        assert!(first.is_some());
        assert!(second.is_some());

        let started = Instant::now();
        assert!(pool.get().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(pool.metrics().timeouts(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let addr = spawn_echo_gateway().await;
        let pool = Arc::new(pool(addr, 1, Duration::from_secs(2)));

        let held = pool.get().await.expect("socket");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release();

        assert!(waiter.await.unwrap());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_dead_connection_becomes_token() {
        let addr = spawn_echo_gateway().await;
        let pool = pool(addr, 3, Duration::from_secs(1));

        let socket = pool.get().await.expect("socket");
        socket.close();
        socket.release();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_tokens(), 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_create_failure_returns_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = pool(addr, 2, Duration::from_secs(1));
        assert!(pool.get().await.is_none());
        assert_eq!(pool.available_tokens(), 2);
        assert_eq!(pool.metrics().create_failures(), 1);
    }

    #[tokio::test]
    async fn test_close_restores_tokens() {
        let addr = spawn_echo_gateway().await;
        let pool = pool(addr, 4, Duration::from_secs(1));

        let sockets: Vec<_> = futures::future::join_all((0..4).map(|_| pool.get()))
            .await
            .into_iter()
            .map(|socket| socket.expect("socket"))
            .collect();
        let borrowed = sockets.into_iter().take(1).collect::<Vec<_>>();
        assert_eq!(pool.idle_count(), 3);

        pool.close().await;
        pool.close().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_tokens(), 3);
        assert!(pool.get().await.is_none());

        // Released after close: closed, not re-pooled
        drop(borrowed);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_tokens(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_get_returns_token() {
        // Backlog of one that is never accepted: further connects hang
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut held = Vec::new();
        for _ in 0..64 {
            match timeout(
                Duration::from_millis(100),
                tokio::net::TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }

        let pool = pool(addr.to_string(), 1, Duration::from_secs(1));
        assert!(timeout(Duration::from_millis(100), pool.get()).await.is_err());

        assert_eq!(pool.available_tokens(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.metrics().created(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_get_succeeds_while_slow_ping_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Echoes every frame, 600ms late
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        tokio::time::sleep(Duration::from_millis(600)).await;
                        if framed.send(frame.freeze()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let factory = TaskSocketFactory::new(
            addr,
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let pool = TaskSocketPool::new(
            1,
            factory,
            Duration::from_millis(300),
            Duration::from_millis(50),
            HEARTBEAT,
        );
        pool.get().await.expect("socket").release();
        pool.loop_heartbeat();

        // First ping goes out at 50ms and is still waiting for its echo
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.idle_count() + pool.available_tokens(), 1);

        let socket = pool.get().await;
        assert!(socket.is_some());
        assert!(pool.metrics().evicted() >= 1);
        drop(socket);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_dead_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts and then never answers
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let factory = TaskSocketFactory::new(
            addr,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let pool = TaskSocketPool::new(
            2,
            factory,
            Duration::from_secs(1),
            Duration::from_millis(50),
            HEARTBEAT,
        );
        pool.get().await.expect("socket").release();
        assert_eq!(pool.idle_count(), 1);

        pool.loop_heartbeat();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_tokens(), 2);
        assert!(pool.metrics().evicted() >= 1);
        pool.close().await;
    }
}
