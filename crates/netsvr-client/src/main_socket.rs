//! Persistent event connection to one gateway worker address.
//!
//! A [`MainSocket`] registers an interest bitmask with the gateway and then
//! runs three background loops for the lifetime of the connection:
//!
//! - heartbeat: writes the heartbeat payload every interval, directly on the socket
//! - send: drains the bounded outbound queue to the socket in enqueue order
//! - receive: reads frames and hands gateway events to a bounded worker pool
//!
//! All three loops select on the socket's close token, so [`MainSocket::close`]
//! stops them promptly from any task.

use crate::socket::{Socket, SocketConfig};
use async_trait::async_trait;
use bytes::Bytes;
use netsvr_core::config::NetsvrConfig;
use netsvr_core::error::{NetsvrError, ProtocolError, SocketError};
use netsvr_core::protocol::{
    decode_body, encode_command, split_command, Cmd, ConnClose, ConnOpen, Events, RegisterReq,
    RegisterResp, Transfer, UnRegisterReq, UnRegisterResp,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default capacity of the outbound queue
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Callbacks for gateway-pushed events.
///
/// Every method defaults to a no-op, so an implementation only overrides the
/// capabilities it cares about. A capability is only invoked when its bit is
/// part of the interest bitmask registered by the owning [`MainSocket`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// A client connection opened on the gateway
    async fn on_open(&self, _event: ConnOpen) {}

    /// A client sent a message
    async fn on_message(&self, _event: Transfer) {}

    /// A client connection closed on the gateway
    async fn on_close(&self, _event: ConnClose) {}
}

type PendingAck = (Cmd, oneshot::Sender<Bytes>);

/// Event connection with heartbeat, send and receive loops
pub struct MainSocket {
    handler: Arc<dyn EventHandler>,
    socket: Socket,
    heartbeat: Bytes,
    events: Events,
    process_cmd_worker_num: usize,
    heartbeat_interval: Duration,
    send_tx: flume::Sender<Bytes>,
    send_rx: flume::Receiver<Bytes>,
    /// Register/unregister reply awaited while the receive loop owns the read half
    pending_ack: Mutex<Option<PendingAck>>,
    receiving: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MainSocket {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        socket: Socket,
        heartbeat: impl Into<Bytes>,
        events: Events,
        process_cmd_worker_num: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        let (send_tx, send_rx) = flume::bounded(DEFAULT_SEND_QUEUE_CAPACITY);
        Self {
            handler,
            socket,
            heartbeat: heartbeat.into(),
            events,
            process_cmd_worker_num: process_cmd_worker_num.max(1),
            heartbeat_interval,
            send_tx,
            send_rx,
            pending_ack: Mutex::new(None),
            receiving: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Builds an event connection for `worker_addr` from the loaded configuration.
    pub fn from_config(
        handler: Arc<dyn EventHandler>,
        worker_addr: &str,
        config: &NetsvrConfig,
    ) -> Self {
        let socket = Socket::new(SocketConfig::from_settings(worker_addr, &config.socket));
        Self::new(
            handler,
            socket,
            config.heartbeat_message.clone(),
            config.main_socket.events(),
            config.main_socket.process_cmd_worker_num,
            config.main_socket.heartbeat_interval(),
        )
        .with_send_queue_capacity(config.main_socket.send_queue_capacity)
    }

    /// Replace the outbound queue with one of the given capacity.
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        let (send_tx, send_rx) = flume::bounded(capacity.max(1));
        self.send_tx = send_tx;
        self.send_rx = send_rx;
        self
    }

    pub fn worker_addr(&self) -> &str {
        self.socket.worker_addr()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn events(&self) -> Events {
        self.events
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Number of frames waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.send_rx.len()
    }

    pub async fn connect(&self) -> bool {
        self.socket.connect().await
    }

    /// Connect, register interest and start all three loops.
    ///
    /// Returns false if connect or register fails; the socket is left closed.
    pub async fn start(self: &Arc<Self>) -> bool {
        if !self.connect().await {
            return false;
        }
        if !self.register().await {
            self.close();
            return false;
        }
        self.loop_heartbeat();
        self.loop_send();
        self.loop_receive();
        info!(worker_addr = %self.worker_addr(), events = self.events.bits(), "Main socket started");
        true
    }

    /// Declare the interest bitmask and wait for the gateway's acknowledgement.
    pub async fn register(&self) -> bool {
        match self.try_register().await {
            Ok(()) => true,
            Err(e) => {
                error!(worker_addr = %self.worker_addr(), error = %e, "Register failed");
                false
            }
        }
    }

    pub async fn try_register(&self) -> Result<(), NetsvrError> {
        let req = RegisterReq {
            events: self.events.bits(),
            process_cmd_goroutine_num: self.process_cmd_worker_num as u32,
        };
        let body = self
            .exchange(Cmd::Register, encode_command(Cmd::Register, &req))
            .await?;
        let resp: RegisterResp = decode_body(body)?;
        if resp.code != 0 {
            return Err(ProtocolError::Rejected {
                command: Cmd::Register.to_string(),
                code: resp.code,
                message: resp.message,
            }
            .into());
        }
        Ok(())
    }

    /// Revoke the interest bitmask and wait for the gateway's acknowledgement.
    pub async fn unregister(&self) -> bool {
        match self.try_unregister().await {
            Ok(()) => true,
            Err(e) => {
                warn!(worker_addr = %self.worker_addr(), error = %e, "Unregister failed");
                false
            }
        }
    }

    pub async fn try_unregister(&self) -> Result<(), NetsvrError> {
        let body = self
            .exchange(Cmd::Unregister, encode_command(Cmd::Unregister, &UnRegisterReq {}))
            .await?;
        let resp: UnRegisterResp = decode_body(body)?;
        if resp.code != 0 {
            return Err(ProtocolError::Rejected {
                command: Cmd::Unregister.to_string(),
                code: resp.code,
                message: resp.message,
            }
            .into());
        }
        Ok(())
    }

    /// Send a control frame and return the body of the reply carrying the same command.
    async fn exchange(&self, cmd: Cmd, frame: Bytes) -> Result<Bytes, NetsvrError> {
        let receive_timeout = self.socket.config().receive_timeout;
        let timed_out = || SocketError::ReceiveTimeout {
            timeout_ms: receive_timeout.as_millis() as u64,
        };

        if self.receiving.load(Ordering::Acquire) {
            let (ack_tx, ack_rx) = oneshot::channel();
            *self.pending_ack.lock() = Some((cmd, ack_tx));
            if let Err(e) = self.socket.try_send(frame).await {
                self.pending_ack.lock().take();
                return Err(e.into());
            }
            return match tokio::time::timeout(receive_timeout, ack_rx).await {
                Ok(Ok(body)) => Ok(body),
                // Receive loop ended before the reply arrived
                Ok(Err(_)) => Err(SocketError::Closed.into()),
                Err(_) => {
                    self.pending_ack.lock().take();
                    Err(timed_out().into())
                }
            };
        }

        self.socket.try_send(frame).await?;
        let read_reply = async {
            loop {
                let payload = self.socket.try_receive().await?;
                if payload == self.heartbeat {
                    continue;
                }
                let (code, body) = split_command(&payload)?;
                if code == cmd.code() {
                    return Ok::<_, NetsvrError>(body);
                }
                debug!(command = code, awaiting = %cmd, "Skipping frame while awaiting reply");
            }
        };
        tokio::time::timeout(receive_timeout, read_reply)
            .await
            .map_err(|_| timed_out())?
    }

    /// Enqueue a frame for the send loop.
    ///
    /// Blocks only while the outbound queue is full. Returns false if the
    /// connection is closed, including when it closes while waiting for room.
    pub async fn send(&self, frame: impl Into<Bytes>) -> bool {
        if !self.socket.is_connected() {
            return false;
        }
        let token = self.socket.close_token();
        tokio::select! {
            _ = token.cancelled() => false,
            queued = self.send_tx.send_async(frame.into()) => queued.is_ok(),
        }
    }

    /// Start the heartbeat loop.
    pub fn loop_heartbeat(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.socket.close_token();
        let handle = tokio::spawn(async move {
            let period = this.heartbeat_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !this.socket.send(this.heartbeat.clone()).await {
                            warn!(worker_addr = %this.worker_addr(), "Heartbeat send failed");
                            break;
                        }
                    }
                }
            }
            debug!(worker_addr = %this.worker_addr(), "loop heartbeat quit");
        });
        self.tasks.lock().push(handle);
    }

    /// Start the send loop.
    pub fn loop_send(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.socket.close_token();
        let queue = self.send_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    frame = queue.recv_async() => {
                        let Ok(frame) = frame else { break };
                        if !this.socket.send(frame).await {
                            break;
                        }
                    }
                }
            }
            let dropped = queue.drain().count();
            debug!(worker_addr = %this.worker_addr(), dropped, "loop send quit");
        });
        self.tasks.lock().push(handle);
    }

    /// Start the receive loop and its dispatch workers.
    pub fn loop_receive(self: &Arc<Self>) {
        let (work_tx, work_rx) = flume::bounded::<(Cmd, Bytes)>(self.process_cmd_worker_num);
        let mut tasks = self.tasks.lock();

        for _ in 0..self.process_cmd_worker_num {
            let this = Arc::clone(self);
            let work_rx = work_rx.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok((cmd, body)) = work_rx.recv_async().await {
                    this.dispatch(cmd, body).await;
                }
            }));
        }

        self.receiving.store(true, Ordering::Release);
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.receive_until_closed(work_tx).await;
        }));
    }

    async fn receive_until_closed(&self, work_tx: flume::Sender<(Cmd, Bytes)>) {
        let token = self.socket.close_token();
        loop {
            let payload = match self.socket.try_receive().await {
                Ok(payload) => payload,
                Err(SocketError::Closed | SocketError::NotConnected) => break,
                Err(e) => {
                    error!(worker_addr = %self.worker_addr(), error = %e, "Main socket receive failed");
                    break;
                }
            };
            if payload == self.heartbeat {
                continue;
            }

            let decoded = match split_command(&payload)
                .and_then(|(code, body)| Ok((Cmd::try_from(code)?, body)))
            {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(worker_addr = %self.worker_addr(), error = %e, "Discarding frame");
                    continue;
                }
            };

            match decoded {
                (ack @ (Cmd::Register | Cmd::Unregister), body) => self.complete_ack(ack, body),
                (Cmd::ConnOpen | Cmd::ConnClose | Cmd::Transfer, _) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        queued = work_tx.send_async(decoded) => {
                            if queued.is_err() {
                                break;
                            }
                        }
                    }
                }
                (other, _) => {
                    warn!(worker_addr = %self.worker_addr(), command = %other, "Discarding unexpected command");
                }
            }
        }

        self.receiving.store(false, Ordering::Release);
        self.pending_ack.lock().take();
        self.socket.close();
        debug!(worker_addr = %self.worker_addr(), "loop receive quit");
    }

    fn complete_ack(&self, cmd: Cmd, body: Bytes) {
        let mut pending = self.pending_ack.lock();
        match pending.take() {
            Some((awaiting, ack_tx)) if awaiting == cmd => {
                let _ = ack_tx.send(body);
            }
            other => {
                *pending = other;
                debug!(worker_addr = %self.worker_addr(), command = %cmd, "Discarding unsolicited reply");
            }
        }
    }

    async fn dispatch(&self, cmd: Cmd, body: Bytes) {
        let result = match cmd {
            Cmd::ConnOpen if self.events.contains(Events::ON_OPEN) => {
                decode_body::<ConnOpen>(body).map(|event| self.handler.on_open(event))
            }
            Cmd::ConnClose if self.events.contains(Events::ON_CLOSE) => {
                decode_body::<ConnClose>(body).map(|event| self.handler.on_close(event))
            }
            Cmd::Transfer if self.events.contains(Events::ON_MESSAGE) => {
                decode_body::<Transfer>(body).map(|event| self.handler.on_message(event))
            }
            _ => return,
        };
        match result {
            Ok(callback) => callback.await,
            Err(e) => {
                warn!(worker_addr = %self.worker_addr(), command = %cmd, error = %e, "Discarding undecodable event");
            }
        }
    }

    /// Close the connection; all loops observe it and exit. Idempotent.
    pub fn close(&self) {
        self.socket.close();
    }

    /// Wait for every loop started so far to exit.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for MainSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainSocket")
            .field("worker_addr", &self.worker_addr())
            .field("events", &self.events)
            .field("connected", &self.is_connected())
            .finish()
    }
}
