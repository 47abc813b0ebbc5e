//! Command layer carried inside each frame.
//!
//! Every frame payload starts with a 4-byte big-endian command code followed
//! by the protobuf body for that command. Only the messages the worker side
//! needs to produce or consume are modelled here.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Length of the command code prefix.
pub const CMD_LEN: usize = 4;

/// Command codes shared with the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Cmd {
    /// Gateway → worker: a client connection opened
    ConnOpen = 1,
    /// Gateway → worker: a client connection closed
    ConnClose = 2,
    /// Gateway → worker: a client sent a message
    Transfer = 3,
    /// Worker → gateway: declare event interest (acknowledged)
    Register = 4,
    /// Worker → gateway: revoke event interest (acknowledged)
    Unregister = 5,
    /// Worker → gateway: replace session/customer/topics of a connection
    ConnInfoUpdate = 6,
    /// Worker → gateway: clear session/customer/topics of a connection
    ConnInfoDelete = 7,
    /// Worker → gateway: send to every client
    Broadcast = 8,
    /// Worker → gateway: send to one client
    SingleCast = 9,
    /// Worker → gateway: send per-client payloads
    SingleCastBulk = 10,
    /// Worker → gateway: disconnect clients
    ForceOffline = 11,
    /// Worker ↔ gateway: query connection info (request/response)
    ConnInfo = 12,
}

impl Cmd {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Cmd {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Cmd::ConnOpen,
            2 => Cmd::ConnClose,
            3 => Cmd::Transfer,
            4 => Cmd::Register,
            5 => Cmd::Unregister,
            6 => Cmd::ConnInfoUpdate,
            7 => Cmd::ConnInfoDelete,
            8 => Cmd::Broadcast,
            9 => Cmd::SingleCast,
            10 => Cmd::SingleCastBulk,
            11 => Cmd::ForceOffline,
            12 => Cmd::ConnInfo,
            code => return Err(ProtocolError::UnknownCommand { code }),
        })
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Interest bitmask registered with the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    pub const ON_OPEN: Events = Events(1);
    pub const ON_CLOSE: Events = Events(1 << 1);
    pub const ON_MESSAGE: Events = Events(1 << 2);
    pub const ALL: Events = Events(1 | 1 << 1 | 1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keeps only the known bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Events(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

/// Builds a frame payload: command code followed by the encoded message.
pub fn encode_command<M: prost::Message>(cmd: Cmd, message: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(CMD_LEN + message.encoded_len());
    buf.put_u32(cmd.code());
    // BytesMut grows on demand, so encoding cannot run out of capacity
    let _ = message.encode(&mut buf);
    buf.freeze()
}

/// Splits a frame payload into its raw command code and body.
pub fn split_command(payload: &Bytes) -> Result<(u32, Bytes), ProtocolError> {
    if payload.len() < CMD_LEN {
        return Err(ProtocolError::FrameTooShort { len: payload.len() });
    }
    let mut code = [0u8; CMD_LEN];
    code.copy_from_slice(&payload[..CMD_LEN]);
    Ok((u32::from_be_bytes(code), payload.slice(CMD_LEN..)))
}

/// Decodes the body of a frame whose command code has already been checked.
pub fn decode_body<M: prost::Message + Default>(body: Bytes) -> Result<M, ProtocolError> {
    Ok(M::decode(body)?)
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterReq {
    /// Interest bitmask, see [`Events`]
    #[prost(uint32, tag = "1")]
    pub events: u32,
    /// Number of workers dispatching events on the worker side
    #[prost(uint32, tag = "2")]
    pub process_cmd_goroutine_num: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterResp {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnRegisterReq {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnRegisterResp {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnOpen {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(string, tag = "2")]
    pub raw_query: String,
    #[prost(string, repeated, tag = "3")]
    pub sub_protocol: Vec<String>,
    #[prost(string, tag = "4")]
    pub x_forwarded_for: String,
    #[prost(string, tag = "5")]
    pub x_real_ip: String,
    #[prost(string, tag = "6")]
    pub remote_addr: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnClose {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(string, tag = "2")]
    pub customer_id: String,
    #[prost(string, tag = "3")]
    pub session: String,
    #[prost(string, repeated, tag = "4")]
    pub topics: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Transfer {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(string, tag = "2")]
    pub customer_id: String,
    #[prost(string, tag = "3")]
    pub session: String,
    #[prost(string, repeated, tag = "4")]
    pub topics: Vec<String>,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleCast {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleCastBulk {
    #[prost(string, repeated, tag = "1")]
    pub uniq_ids: Vec<String>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub data: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Broadcast {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfoUpdate {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(string, tag = "2")]
    pub new_session: String,
    #[prost(string, tag = "3")]
    pub new_customer_id: String,
    #[prost(string, repeated, tag = "4")]
    pub new_topics: Vec<String>,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfoDelete {
    #[prost(string, tag = "1")]
    pub uniq_id: String,
    #[prost(bool, tag = "2")]
    pub del_session: bool,
    #[prost(bool, tag = "3")]
    pub del_customer_id: bool,
    #[prost(bool, tag = "4")]
    pub del_topic: bool,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ForceOffline {
    #[prost(string, repeated, tag = "1")]
    pub uniq_ids: Vec<String>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfoReq {
    #[prost(string, repeated, tag = "1")]
    pub uniq_ids: Vec<String>,
    #[prost(bool, tag = "2")]
    pub req_session: bool,
    #[prost(bool, tag = "3")]
    pub req_customer_id: bool,
    #[prost(bool, tag = "4")]
    pub req_topic: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfoRespItem {
    #[prost(string, tag = "1")]
    pub session: String,
    #[prost(string, tag = "2")]
    pub customer_id: String,
    #[prost(string, repeated, tag = "3")]
    pub topics: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfoResp {
    /// Keyed by uniq id; connections unknown to the gateway are absent
    #[prost(map = "string, message", tag = "1")]
    pub items: HashMap<String, ConnInfoRespItem>,
}
