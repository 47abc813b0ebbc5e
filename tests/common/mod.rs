//! In-process gateway used by the integration tests.
//!
//! Speaks the worker-facing wire protocol: echoes heartbeats, acknowledges
//! register/unregister, answers conn-info queries and records every other
//! frame so tests can assert on what the worker side sent.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use netsvr_business::netsvr_core::protocol::{
    decode_body, encode_command, split_command, Cmd, ConnInfoReq, ConnInfoResp, ConnInfoRespItem,
    RegisterReq, RegisterResp, UnRegisterResp,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT: &[u8] = b"~6YOt5rW35piO~";

/// Install a test subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    registered: Option<RegisterReq>,
    kill: CancellationToken,
}

#[derive(Default)]
struct GatewayState {
    register_code: AtomicI32,
    next_id: AtomicUsize,
    accepted: AtomicUsize,
    connections: Mutex<HashMap<usize, Connection>>,
    frames: Mutex<Vec<(u32, Bytes)>>,
    heartbeats: Mutex<HashMap<usize, usize>>,
}

pub struct MockGateway {
    addr: String,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock gateway");
        let addr = listener.local_addr().expect("local addr").to_string();
        let state = Arc::new(GatewayState::default());
        let shutdown = CancellationToken::new();

        {
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => break,
                        },
                    };
                    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(Arc::clone(&state), stream, id, shutdown.child_token()));
                }
            });
        }

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Answer future register requests with `code`.
    pub fn set_register_code(&self, code: i32) {
        self.state.register_code.store(code, Ordering::SeqCst);
    }

    /// Push a gateway event to every connection that registered.
    pub fn push<M: prost::Message>(&self, cmd: Cmd, message: &M) -> usize {
        self.push_raw(encode_command(cmd, message))
    }

    pub fn push_raw(&self, frame: Bytes) -> usize {
        let connections = self.state.connections.lock();
        connections
            .values()
            .filter(|conn| conn.registered.is_some())
            .filter(|conn| conn.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Interest bitmasks of the currently registered connections.
    pub fn registrations(&self) -> Vec<RegisterReq> {
        self.state
            .connections
            .lock()
            .values()
            .filter_map(|conn| conn.registered.clone())
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.lock().len()
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Drop every open connection from the gateway side.
    pub fn kill_connections(&self) {
        for conn in self.state.connections.lock().values() {
            conn.kill.cancel();
        }
    }

    /// Bodies of every recorded frame carrying `cmd`.
    pub fn frames(&self, cmd: Cmd) -> Vec<Bytes> {
        self.state
            .frames
            .lock()
            .iter()
            .filter(|(code, _)| *code == cmd.code())
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn decoded<M: prost::Message + Default>(&self, cmd: Cmd) -> Vec<M> {
        self.frames(cmd)
            .into_iter()
            .map(|body| decode_body(body).expect("Failed to decode recorded frame"))
            .collect()
    }

    /// Heartbeats received per connection, in connection order.
    pub fn heartbeats(&self) -> Vec<usize> {
        let heartbeats = self.state.heartbeats.lock();
        let mut ids: Vec<_> = heartbeats.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| heartbeats[&id]).collect()
    }

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(state: Arc<GatewayState>, stream: TcpStream, id: usize, kill: CancellationToken) {
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split::<Bytes>();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    state.connections.lock().insert(
        id,
        Connection {
            tx: tx.clone(),
            registered: None,
            kill: kill.clone(),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = kill.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => frame.freeze(),
                _ => break,
            },
        };
        handle(&state, id, frame, &tx);
    }

    state.connections.lock().remove(&id);
    writer.abort();
}

fn handle(state: &GatewayState, id: usize, frame: Bytes, tx: &mpsc::UnboundedSender<Bytes>) {
    if frame.as_ref() == HEARTBEAT {
        *state.heartbeats.lock().entry(id).or_default() += 1;
        let _ = tx.send(frame);
        return;
    }

    let Ok((code, body)) = split_command(&frame) else {
        return;
    };
    match Cmd::try_from(code) {
        Ok(Cmd::Register) => {
            let code = state.register_code.load(Ordering::SeqCst);
            if code == 0 {
                if let Some(conn) = state.connections.lock().get_mut(&id) {
                    conn.registered = decode_body(body.clone()).ok();
                }
            }
            let resp = RegisterResp {
                code,
                message: String::new(),
            };
            let _ = tx.send(encode_command(Cmd::Register, &resp));
        }
        Ok(Cmd::Unregister) => {
            if let Some(conn) = state.connections.lock().get_mut(&id) {
                conn.registered = None;
            }
            let _ = tx.send(encode_command(Cmd::Unregister, &UnRegisterResp::default()));
        }
        Ok(Cmd::ConnInfo) => {
            let req: ConnInfoReq = decode_body(body.clone()).unwrap_or_default();
            let items = req
                .uniq_ids
                .iter()
                .filter(|uniq_id| !uniq_id.ends_with("ffff"))
                .map(|uniq_id| {
                    let item = ConnInfoRespItem {
                        session: if req.req_session {
                            format!("session-{}", uniq_id)
                        } else {
                            String::new()
                        },
                        customer_id: if req.req_customer_id {
                            format!("customer-{}", uniq_id)
                        } else {
                            String::new()
                        },
                        topics: if req.req_topic {
                            vec!["news".to_string()]
                        } else {
                            Vec::new()
                        },
                    };
                    (uniq_id.clone(), item)
                })
                .collect();
            let _ = tx.send(encode_command(Cmd::ConnInfo, &ConnInfoResp { items }));
        }
        _ => {}
    }
    state.frames.lock().push((code, body));
}

/// A uniq id owned by the worker listening on `addr`.
pub fn uniq_id_for(addr: &str, suffix: &str) -> String {
    let key = netsvr_business::netsvr_core::worker_addr_to_hex(addr).expect("worker addr");
    format!("{}{}", key, suffix)
}
