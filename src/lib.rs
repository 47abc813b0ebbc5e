//! # netsvr-business
//!
//! Business-side API for talking to netsvr gateways.
//!
//! [`NetBus`] routes commands for a client, identified by its uniq id, to the
//! gateway worker that owns that client. The first twelve characters of every
//! uniq id encode the owning worker address, so no directory lookup is needed.
//! When an event connection to that worker is registered, frames go through
//! its outbound queue; otherwise a connection is borrowed from the worker's
//! pool for the duration of the send.

use bytes::Bytes;
use futures::future::join_all;
use netsvr_client::{EventHandler, MainSocket, MainSocketManager};
use netsvr_core::addr::uniq_id_to_worker_addr_hex;
use netsvr_core::config::NetsvrConfig;
use netsvr_core::error::{NetsvrError, ProtocolError};
use netsvr_core::protocol::{
    decode_body, encode_command, split_command, Broadcast, Cmd, ConnInfoDelete, ConnInfoReq,
    ConnInfoResp, ConnInfoRespItem, ConnInfoUpdate, ForceOffline, SingleCast, SingleCastBulk,
};
use netsvr_pool::{TaskSocketPool, TaskSocketPoolManager};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use netsvr_client;
pub use netsvr_core;
pub use netsvr_pool;

/// Router from uniq ids to gateway connections
pub struct NetBus {
    main_sockets: Option<Arc<MainSocketManager>>,
    task_pools: Arc<TaskSocketPoolManager>,
}

impl NetBus {
    pub fn new(
        main_sockets: Option<Arc<MainSocketManager>>,
        task_pools: Arc<TaskSocketPoolManager>,
    ) -> Self {
        Self {
            main_sockets,
            task_pools,
        }
    }

    /// Build a pool for every configured worker and, when a handler is given,
    /// an event connection per worker as well. Nothing connects until [`NetBus::start`].
    pub fn from_config(
        config: &NetsvrConfig,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self, NetsvrError> {
        config.validate()?;

        let task_pools = TaskSocketPoolManager::new();
        for worker_addr in &config.workers {
            task_pools.add_socket(TaskSocketPool::from_config(worker_addr, config))?;
        }

        let main_sockets = match handler {
            Some(handler) => {
                let manager = MainSocketManager::new().with_reconnect(config.reconnect.clone());
                for worker_addr in &config.workers {
                    manager.add_socket(MainSocket::from_config(
                        Arc::clone(&handler),
                        worker_addr,
                        config,
                    ))?;
                }
                Some(Arc::new(manager))
            }
            None => None,
        };

        Ok(Self::new(main_sockets, Arc::new(task_pools)))
    }

    pub fn main_sockets(&self) -> Option<&Arc<MainSocketManager>> {
        self.main_sockets.as_ref()
    }

    pub fn task_pools(&self) -> &Arc<TaskSocketPoolManager> {
        &self.task_pools
    }

    /// Start pool heartbeats and, if present, the event connections.
    pub async fn start(&self) -> bool {
        for pool in self.task_pools.pools() {
            pool.loop_heartbeat();
        }
        match &self.main_sockets {
            Some(manager) => manager.start().await,
            None => true,
        }
    }

    /// Close event connections first, then every pool.
    pub async fn close(&self) {
        if let Some(manager) = &self.main_sockets {
            manager.close().await;
        }
        self.task_pools.close().await;
        info!("Net bus closed");
    }

    /// Frame payload for `cmd` carrying `message`.
    pub fn pack<M: prost::Message>(cmd: Cmd, message: &M) -> Bytes {
        encode_command(cmd, message)
    }

    /// Deliver a frame to the worker that owns `uniq_id`.
    pub async fn send_to_socket_by_uniq_id(&self, uniq_id: &str, frame: Bytes) -> bool {
        match uniq_id_to_worker_addr_hex(uniq_id) {
            Some(key) => self.send_to_worker(key, frame).await,
            None => {
                warn!(uniq_id, "Uniq id does not carry a worker address");
                false
            }
        }
    }

    /// Deliver a frame to the worker registered under `key`, preferring its event connection.
    pub async fn send_to_worker(&self, key: &str, frame: Bytes) -> bool {
        if let Some(main) = self
            .main_sockets
            .as_ref()
            .and_then(|manager| manager.get_socket(key))
            .filter(|main| main.is_connected())
        {
            return main.send(frame).await;
        }
        match self.task_pools.get_socket(key).await {
            Some(socket) => socket.send(frame).await,
            None => {
                debug!(key, "No connection available for worker");
                false
            }
        }
    }

    /// Deliver a frame to every worker. Returns true if every worker accepted it.
    pub async fn send_to_sockets(&self, frame: Bytes) -> bool {
        let mains = self
            .main_sockets
            .as_ref()
            .map(|manager| manager.get_sockets())
            .unwrap_or_default();
        if !mains.is_empty() {
            return join_all(mains.iter().map(|main| main.send(frame.clone())))
                .await
                .into_iter()
                .all(|sent| sent);
        }

        let sockets = self.task_pools.get_sockets().await;
        if sockets.len() < self.task_pools.count() {
            warn!(
                available = sockets.len(),
                workers = self.task_pools.count(),
                "Some workers have no connection available"
            );
        }
        let all_sent = join_all(sockets.iter().map(|socket| socket.send(frame.clone())))
            .await
            .into_iter()
            .all(|sent| sent);
        all_sent && sockets.len() == self.task_pools.count()
    }

    /// Send `data` to one client.
    pub async fn single_cast(&self, uniq_id: &str, data: impl Into<Vec<u8>>) -> bool {
        let message = SingleCast {
            uniq_id: uniq_id.to_string(),
            data: data.into(),
        };
        self.send_to_socket_by_uniq_id(uniq_id, Self::pack(Cmd::SingleCast, &message))
            .await
    }

    /// Send one payload per client, one frame per owning worker.
    ///
    /// `data` pairs with `uniq_ids` by index; a single payload is sent to every client.
    pub async fn single_cast_bulk(&self, uniq_ids: &[String], data: &[Vec<u8>]) -> bool {
        if data.is_empty() || (data.len() != 1 && data.len() != uniq_ids.len()) {
            warn!(
                uniq_ids = uniq_ids.len(),
                payloads = data.len(),
                "Mismatched single cast bulk payloads"
            );
            return false;
        }

        let mut grouped: HashMap<&str, SingleCastBulk> = HashMap::new();
        for (index, uniq_id) in uniq_ids.iter().enumerate() {
            let Some(key) = uniq_id_to_worker_addr_hex(uniq_id) else {
                warn!(uniq_id = %uniq_id, "Uniq id does not carry a worker address");
                continue;
            };
            let bulk = grouped.entry(key).or_default();
            bulk.uniq_ids.push(uniq_id.clone());
            bulk.data
                .push(data.get(index).unwrap_or(&data[0]).clone());
        }

        self.send_grouped(grouped, Cmd::SingleCastBulk).await
    }

    /// Send `data` to every client on every worker.
    pub async fn broadcast(&self, data: impl Into<Vec<u8>>) -> bool {
        let message = Broadcast { data: data.into() };
        self.send_to_sockets(Self::pack(Cmd::Broadcast, &message))
            .await
    }

    /// Replace session, customer id or topics of a client connection.
    pub async fn conn_info_update(&self, update: ConnInfoUpdate) -> bool {
        let frame = Self::pack(Cmd::ConnInfoUpdate, &update);
        self.send_to_socket_by_uniq_id(&update.uniq_id, frame).await
    }

    /// Clear session, customer id or topics of a client connection.
    pub async fn conn_info_delete(&self, delete: ConnInfoDelete) -> bool {
        let frame = Self::pack(Cmd::ConnInfoDelete, &delete);
        self.send_to_socket_by_uniq_id(&delete.uniq_id, frame).await
    }

    /// Disconnect clients, optionally sending `data` to them first.
    pub async fn force_offline(&self, uniq_ids: &[String], data: impl Into<Vec<u8>>) -> bool {
        let data = data.into();
        let mut grouped: HashMap<&str, ForceOffline> = HashMap::new();
        for uniq_id in uniq_ids {
            let Some(key) = uniq_id_to_worker_addr_hex(uniq_id) else {
                warn!(uniq_id = %uniq_id, "Uniq id does not carry a worker address");
                continue;
            };
            let message = grouped.entry(key).or_insert_with(|| ForceOffline {
                uniq_ids: Vec::new(),
                data: data.clone(),
            });
            message.uniq_ids.push(uniq_id.clone());
        }

        self.send_grouped(grouped, Cmd::ForceOffline).await
    }

    async fn send_grouped<M: prost::Message>(&self, grouped: HashMap<&str, M>, cmd: Cmd) -> bool {
        if grouped.is_empty() {
            return false;
        }
        join_all(
            grouped
                .iter()
                .map(|(key, message)| self.send_to_worker(key, Self::pack(cmd, message))),
        )
        .await
        .into_iter()
        .all(|sent| sent)
    }

    /// Query session, customer id and topics of clients.
    ///
    /// One request per owning worker, each over a pooled connection. Clients
    /// unknown to their gateway, or whose worker could not be reached, are
    /// absent from the result.
    pub async fn conn_info(&self, request: &ConnInfoReq) -> HashMap<String, ConnInfoRespItem> {
        let mut grouped: HashMap<&str, ConnInfoReq> = HashMap::new();
        for uniq_id in &request.uniq_ids {
            let Some(key) = uniq_id_to_worker_addr_hex(uniq_id) else {
                warn!(uniq_id = %uniq_id, "Uniq id does not carry a worker address");
                continue;
            };
            grouped
                .entry(key)
                .or_insert_with(|| ConnInfoReq {
                    uniq_ids: Vec::new(),
                    ..request.clone()
                })
                .uniq_ids
                .push(uniq_id.clone());
        }

        let responses = join_all(
            grouped
                .iter()
                .map(|(key, worker_request)| self.request_conn_info(key, worker_request)),
        )
        .await;

        let mut items = HashMap::new();
        for (key, response) in grouped.keys().zip(responses) {
            match response {
                Ok(response) => items.extend(response.items),
                Err(e) => warn!(key = %key, error = %e, "Conn info request failed"),
            }
        }
        items
    }

    async fn request_conn_info(
        &self,
        key: &str,
        request: &ConnInfoReq,
    ) -> Result<ConnInfoResp, NetsvrError> {
        let socket = self
            .task_pools
            .get_socket(key)
            .await
            .ok_or(netsvr_core::error::SocketError::NotConnected)?;

        socket
            .try_send(Self::pack(Cmd::ConnInfo, request))
            .await?;
        let payload = socket.try_receive().await?;

        let reply = split_command(&payload).and_then(|(code, body)| {
            if code != Cmd::ConnInfo.code() {
                return Err(ProtocolError::UnexpectedCommand {
                    expected: Cmd::ConnInfo.code(),
                    actual: code,
                });
            }
            decode_body::<ConnInfoResp>(body)
        });
        if reply.is_err() {
            // The stream is out of step with our requests; never reuse it
            socket.close();
        }
        Ok(reply?)
    }
}

impl std::fmt::Debug for NetBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetBus")
            .field("main_sockets", &self.main_sockets.as_ref().map(|m| m.count()))
            .field("task_pools", &self.task_pools.count())
            .finish()
    }
}
