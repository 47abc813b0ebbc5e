use crate::main_socket::MainSocket;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use netsvr_core::addr::worker_addr_to_hex;
use netsvr_core::config::ReconnectConfig;
use netsvr_core::error::RegistryError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registry of event connections keyed by encoded worker address.
///
/// Connections are added before [`MainSocketManager::start`] and started as a
/// unit. Lookups return nothing until the registry is started and again after
/// it is closed.
pub struct MainSocketManager {
    sockets: DashMap<String, Arc<MainSocket>>,
    started: AtomicBool,
    starting: AtomicBool,
    reconnect: Option<ReconnectConfig>,
    shutdown: Mutex<CancellationToken>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl MainSocketManager {
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
            started: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            reconnect: None,
            shutdown: Mutex::new(CancellationToken::new()),
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Supervise started connections and reconnect them after an unexpected loss.
    ///
    /// Has no effect unless `config.enabled` is set.
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config.enabled.then_some(config);
        self
    }

    /// Register a not-yet-started connection, returning its registry key.
    pub fn add_socket(&self, socket: impl Into<Arc<MainSocket>>) -> Result<String, RegistryError> {
        if self.started.load(Ordering::Acquire) || self.starting.load(Ordering::Acquire) {
            return Err(RegistryError::AlreadyStarted);
        }
        let socket = socket.into();
        let key = worker_addr_to_hex(socket.worker_addr())?;
        match self.sockets.entry(key.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateWorker {
                worker_addr: socket.worker_addr().to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(worker_addr = %socket.worker_addr(), key = %key, "Main socket added");
                slot.insert(socket);
                Ok(key)
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of registered connections
    pub fn count(&self) -> usize {
        self.sockets.len()
    }

    /// Connect, register and start every connection.
    ///
    /// On any failure every connection is closed again and false is returned;
    /// the registry stays not-started and keeps its entries. A call made while
    /// another start is in flight returns false and touches nothing.
    pub async fn start(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return true;
        }
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Main socket manager start already in progress");
            return false;
        }

        let started = self.start_all().await;
        self.starting.store(false, Ordering::Release);
        started
    }

    async fn start_all(&self) -> bool {
        let sockets = self.snapshot();
        let results = join_all(sockets.iter().map(|socket| socket.start())).await;

        if let Some(failed) = results.iter().position(|ok| !ok) {
            error!(
                worker_addr = %sockets[failed].worker_addr(),
                "Main socket failed to start, closing all"
            );
            for socket in &sockets {
                socket.close();
            }
            join_all(sockets.iter().map(|socket| socket.join())).await;
            return false;
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();
        if let Some(config) = &self.reconnect {
            let mut supervisors = self.supervisors.lock();
            for socket in &sockets {
                supervisors.push(tokio::spawn(supervise(
                    Arc::clone(socket),
                    config.clone(),
                    shutdown.clone(),
                )));
            }
        }

        self.started.store(true, Ordering::Release);
        info!(count = sockets.len(), "Main socket manager started");
        true
    }

    /// Look up a started connection by registry key.
    pub fn get_socket(&self, key: &str) -> Option<Arc<MainSocket>> {
        if !self.is_started() {
            return None;
        }
        self.sockets.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every started connection.
    pub fn get_sockets(&self) -> Vec<Arc<MainSocket>> {
        if !self.is_started() {
            return Vec::new();
        }
        self.snapshot()
    }

    fn snapshot(&self) -> Vec<Arc<MainSocket>> {
        self.sockets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Unregister and close every connection, then clear the registry. Idempotent.
    pub async fn close(&self) {
        self.shutdown.lock().cancel();
        let supervisors = std::mem::take(&mut *self.supervisors.lock());
        join_all(supervisors).await;

        let sockets = self.snapshot();
        join_all(sockets.iter().map(|socket| async move {
            if socket.is_connected() {
                socket.unregister().await;
            }
            socket.close();
            socket.join().await;
        }))
        .await;

        self.sockets.clear();
        if self.started.swap(false, Ordering::AcqRel) {
            info!(count = sockets.len(), "Main socket manager closed");
        }
    }
}

impl Default for MainSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Restart `socket` with capped exponential backoff each time its connection is lost.
async fn supervise(socket: Arc<MainSocket>, config: ReconnectConfig, shutdown: CancellationToken) {
    loop {
        let lost = socket.socket().close_token();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = lost.cancelled() => {}
        }
        socket.join().await;
        warn!(worker_addr = %socket.worker_addr(), "Main socket lost, reconnecting");

        let mut attempt = 0u32;
        loop {
            if config.max_attempts.is_some_and(|max| attempt >= max) {
                error!(
                    worker_addr = %socket.worker_addr(),
                    attempts = attempt,
                    "Giving up reconnecting main socket"
                );
                return;
            }
            let delay = config.backoff(attempt);
            debug!(worker_addr = %socket.worker_addr(), attempt, ?delay, "Waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if socket.start().await {
                info!(worker_addr = %socket.worker_addr(), attempt, "Main socket reconnected");
                break;
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_socket::EventHandler;
    use crate::socket::{Socket, SocketConfig};
    use async_trait::async_trait;
    use netsvr_core::protocol::Events;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {}

    fn main_socket(addr: &str) -> MainSocket {
        let socket = Socket::new(SocketConfig::new(addr).with_timeouts(
            Duration::from_millis(300),
            Duration::from_millis(300),
            Duration::from_millis(300),
        ));
        MainSocket::new(
            Arc::new(NoopHandler),
            socket,
            "~6YOt5rW35piO~",
            Events::ALL,
            1,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_add_socket_keys_by_worker_addr() {
        let manager = MainSocketManager::new();
        let key = manager.add_socket(main_socket("127.0.0.1:6061")).unwrap();
        assert_eq!(key, "7f00000117ad");
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_add_socket_rejects_duplicates() {
        let manager = MainSocketManager::new();
        manager.add_socket(main_socket("127.0.0.1:6061")).unwrap();
        assert!(matches!(
            manager.add_socket(main_socket("localhost:6061")),
            Err(RegistryError::DuplicateWorker { .. })
        ));
        assert!(matches!(
            manager.add_socket(main_socket("not-an-address")),
            Err(RegistryError::InvalidWorkerAddr { .. })
        ));
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_lookups_empty_before_start() {
        let manager = MainSocketManager::new();
        let key = manager.add_socket(main_socket("127.0.0.1:6061")).unwrap();
        assert!(manager.get_socket(&key).is_none());
        assert!(manager.get_sockets().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_not_started() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let manager = MainSocketManager::new();
        let key = manager.add_socket(main_socket(&addr)).unwrap();

        assert!(!manager.start().await);
        assert!(!manager.is_started());
        assert!(manager.get_socket(&key).is_none());
        assert_eq!(manager.count(), 1);

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_reconnect_disabled_by_default() {
        let manager = MainSocketManager::new().with_reconnect(ReconnectConfig::default());
        assert!(manager.reconnect.is_none());

        let enabled = ReconnectConfig {
            enabled: true,
            ..Default::default()
        };
        let manager = MainSocketManager::new().with_reconnect(enabled);
        assert!(manager.reconnect.is_some());
    }
}
