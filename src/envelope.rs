//! Wire codec (C1): the envelope format shared by TCP and UDP, and their two
//! framings (spec.md §4.1).
//!
//! TCP: `[len: u32 BE][envelope]`. UDP: `[root_code: u8][envelope]` — one
//! datagram, one message, no length prefix needed. The envelope body is
//! `postcard`, the same compact binary format the teacher already uses for
//! its own wire messages and tickets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::peer::PeerId;

/// Generous default; DHT replies in particular can be large (spec.md §4.1).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Partitions the UDP message space into disjoint handler families
/// (spec.md §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootCode {
    Request = 0,
    Gossip = 1,
    Discovery = 2,
    Dht = 3,
}

impl RootCode {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(RootCode::Request),
            1 => Ok(RootCode::Gossip),
            2 => Ok(RootCode::Discovery),
            3 => Ok(RootCode::Dht),
            other => Err(CodecError::UnknownRootCode(other)),
        }
    }
}

/// Envelope headers used by the core (spec.md §6). Kept as a closed
/// enumeration per spec.md §9's redesign flag ("dynamic header dispatch...
/// encode the header as an enumeration"), with a single escape hatch for
/// DHT RPC names, which are genuinely plugin-style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    // Requests endpoint small RPCs (C3).
    Ping,
    Unping,
    RemovalPing,
    SearchPeersReq,
    SearchPeersReply,
    // Acceptor handshakes (C7).
    CmdFileConn,
    CmdRecvDir,
    OtmUpdateStreamLink,
    CmdMsgConn,
    CmdText,
    // Gossip (C5).
    GossipMessage,
    GossipSearchReq,
    GossipSearchReply,
    // Discovery (C6).
    NetworkFind,
    NetworkFindReply,
    // DHT custom RPCs (C4) — plugin-style, by name.
    DhtRpc(String),
}

/// The universal wire message (spec.md §3): header + optional correlation id
/// + optional sender id + an arbitrary body map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub msg_id: Option<u64>,
    pub peer_id: Option<PeerId>,
    pub body: BTreeMap<String, BodyValue>,
}

/// A small closed set of value kinds for the body map — enough to express
/// every header-specific payload spec.md §6 lists, without resorting to an
/// open-ended `serde_json::Value` (postcard doesn't support one anyway).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyValue {
    Str(String),
    U64(u64),
    Bytes(Vec<u8>),
    PeerId(PeerId),
    PeerList(Vec<PeerId>),
}

impl Envelope {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            msg_id: None,
            peer_id: None,
            body: BTreeMap::new(),
        }
    }

    pub fn with_msg_id(mut self, msg_id: u64) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_body(mut self, key: &str, value: BodyValue) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn body_str(&self, key: &str) -> Option<&str> {
        match self.body.get(key) {
            Some(BodyValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn body_u64(&self, key: &str) -> Option<u64> {
        match self.body.get(key) {
            Some(BodyValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Encode the body via postcard. Shared by both framings.
    fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_stdvec(self)?)
    }

    fn decode_body(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// TCP framing: `[len: u32 BE][envelope]`.
    pub fn encode_tcp(&self) -> Result<Vec<u8>, CodecError> {
        let body = self.encode_body()?;
        let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge {
            got: u32::MAX,
            max: DEFAULT_MAX_FRAME_SIZE,
        })?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one TCP frame's body bytes (length prefix already consumed by
    /// the caller via [`read_tcp_frame`]).
    pub fn decode_tcp_body(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode_body(bytes)
    }

    /// UDP framing: `[root_code: u8][envelope]` — one datagram, one message.
    pub fn encode_udp(&self, root: RootCode) -> Result<Vec<u8>, CodecError> {
        let body = self.encode_body()?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(root.to_byte());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Split a received datagram into its root code and decoded envelope.
    pub fn decode_udp(datagram: &[u8]) -> Result<(RootCode, Self), CodecError> {
        let (root_byte, rest) = datagram
            .split_first()
            .ok_or(CodecError::Truncated { expected: 1, got: 0 })?;
        let root = RootCode::from_byte(*root_byte)?;
        let envelope = Self::decode_body(rest)?;
        Ok((root, envelope))
    }
}

/// Read one length-prefixed TCP frame from an async reader, enforcing
/// `max_frame_size` (spec.md §4.1: "oversized TCP frames cause the
/// connection to be closed").
pub async fn read_tcp_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Envelope, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            got: len,
            max: max_frame_size,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Envelope::decode_tcp_body(&body)
}

pub async fn write_tcp_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let frame = envelope.encode_tcp()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
