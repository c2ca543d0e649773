//! Wire message formats traded between instances.
//!
//! This module is the only place in the crate that knows frame layouts.
//! All integers are big-endian. Handshake subscription lists use 32 bit
//! counts and lengths; regular message fields use 64 bit lengths, since
//! subscriptions are small and bodies may be large.

use std::convert::TryInto;

use futures::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::communication::{NodeId, Subscription};
use crate::error::*;

/// The current version of the wire protocol. Peers reporting any other
/// version are refused during the handshake.
pub const CURRENT_VERSION: u64 = 1;

/// The reserved channel carrying subscription notices between
/// instances. Bodies published on it are control messages, never
/// dispatched to callbacks.
pub const CONTROL_CHANNEL: &str = "tolliver";

/// Message id reserved for unreliable sends. No delivery rows are
/// recorded for it, and no acknowledgement is expected.
pub const UNRELIABLE_MESSAGE_ID: u64 = 0;

/// Ack status signalling successful receipt.
pub const ACK_SUCCESS: u8 = 0;

/// The leading byte of every frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameTag {
    HandshakeRequest = 0,
    HandshakeResponse = 1,
    HandshakeFinal = 2,
    Regular = 3,
    Ack = 4,
}

impl FrameTag {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(FrameTag::HandshakeRequest),
            1 => Ok(FrameTag::HandshakeResponse),
            2 => Ok(FrameTag::HandshakeFinal),
            3 => Ok(FrameTag::Regular),
            4 => Ok(FrameTag::Ack),
            _ => Err(Error::wrapped(
                ErrorKind::UnexpectedTag,
                format!("unknown frame tag {}", raw),
            )),
        }
    }
}

/// Status codes carried by handshake responses and finals.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum HandshakeStatus {
    Success = 0,
    GeneralError = 1,
    BackwardsCompatible = 2,
    Incompatible = 3,
    RequestCompatibility = 4,
}

impl HandshakeStatus {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(HandshakeStatus::Success),
            1 => Ok(HandshakeStatus::GeneralError),
            2 => Ok(HandshakeStatus::BackwardsCompatible),
            3 => Ok(HandshakeStatus::Incompatible),
            4 => Ok(HandshakeStatus::RequestCompatibility),
            _ => Err(Error::wrapped(
                ErrorKind::MalformedFrame,
                format!("unknown handshake status {}", raw),
            )),
        }
    }
}

/// A decoded `HandshakeRequest` payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRequest {
    pub version: u64,
    pub id: NodeId,
    pub subscriptions: Vec<Subscription>,
}

/// A decoded `HandshakeResponse` payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub version: u64,
    pub id: NodeId,
    pub status: HandshakeStatus,
    pub subscriptions: Vec<Subscription>,
}

/// A decoded `RegularMessage` payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegularMessage {
    pub message_id: u64,
    pub channel: String,
    pub key: String,
    pub body: Vec<u8>,
}

/// A decoded `Ack` payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ack {
    pub status: u8,
    pub message_id: u64,
}

/// Operations carried on the reserved control channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ControlOp {
    Subscribe = 0,
    Unsubscribe = 1,
}

/// A decoded control channel body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlMessage {
    pub op: ControlOp,
    pub subscriptions: Vec<Subscription>,
}

/// An append-only buffer used to build outgoing frames.
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            data: Vec::with_capacity(32),
        }
    }

    /// Returns the finished frame bytes.
    pub fn join(self) -> Vec<u8> {
        self.data
    }

    pub fn write_u8(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn write_u32(&mut self, n: u32) {
        self.data.extend_from_slice(&n.to_be_bytes());
    }

    pub fn write_u64(&mut self, n: u64) {
        self.data.extend_from_slice(&n.to_be_bytes());
    }

    pub fn write_node_id(&mut self, id: NodeId) {
        self.data.extend_from_slice(id.as_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }

    /// Writes a subscription list: a 32 bit entry count, then per entry
    /// the channel and key lengths followed by their bytes.
    pub fn write_subscriptions(&mut self, subs: &[Subscription]) {
        self.write_u32(subs.len() as u32);
        for sub in subs {
            self.write_u32(sub.channel.len() as u32);
            self.write_u32(sub.key.len() as u32);
            self.write_bytes(sub.channel.as_bytes());
            self.write_bytes(sub.key.as_bytes());
        }
    }
}

pub fn encode_handshake_request(version: u64, id: NodeId, subs: &[Subscription]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(FrameTag::HandshakeRequest as u8);
    w.write_u64(version);
    w.write_node_id(id);
    w.write_subscriptions(subs);
    w.join()
}

pub fn encode_handshake_response(
    version: u64,
    id: NodeId,
    status: HandshakeStatus,
    subs: &[Subscription],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(FrameTag::HandshakeResponse as u8);
    w.write_u64(version);
    w.write_node_id(id);
    w.write_u8(status as u8);
    w.write_subscriptions(subs);
    w.join()
}

pub fn encode_handshake_final(status: HandshakeStatus) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(FrameTag::HandshakeFinal as u8);
    w.write_u8(status as u8);
    w.join()
}

pub fn encode_regular(message_id: u64, channel: &str, key: &str, body: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(FrameTag::Regular as u8);
    w.write_u64(message_id);
    w.write_u64(channel.len() as u64);
    w.write_bytes(channel.as_bytes());
    w.write_u64(key.len() as u64);
    w.write_bytes(key.as_bytes());
    w.write_u64(body.len() as u64);
    w.write_bytes(body);
    w.join()
}

pub fn encode_ack(status: u8, message_id: u64) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(FrameTag::Ack as u8);
    w.write_u8(status);
    w.write_u64(message_id);
    w.join()
}

/// Encodes a control channel body: the operation code followed by a
/// subscription list.
pub fn encode_control(op: ControlOp, subs: &[Subscription]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(op as u8);
    w.write_subscriptions(subs);
    w.join()
}

/// Decodes a control channel body. The encoded length must equal the
/// body length of the enclosing regular message exactly, so trailing
/// bytes are an error.
pub fn decode_control(body: &[u8]) -> Result<ControlMessage> {
    let mut r = SliceReader { buf: body };
    let op = match r.read_u8()? {
        0 => ControlOp::Subscribe,
        1 => ControlOp::Unsubscribe,
        op => {
            return Err(Error::wrapped(
                ErrorKind::MalformedFrame,
                format!("unknown control op {}", op),
            ))
        }
    };
    let count = r.read_u32()?;
    let mut subscriptions = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let channel_len = r.read_u32()?;
        let key_len = r.read_u32()?;
        let channel = r.read_string(channel_len as usize)?;
        let key = r.read_string(key_len as usize)?;
        subscriptions.push(Subscription { channel, key });
    }
    if !r.buf.is_empty() {
        return Err(Error::wrapped(
            ErrorKind::MalformedFrame,
            "control body longer than its encoded contents",
        ));
    }
    Ok(ControlMessage { op, subscriptions })
}

struct SliceReader<'a> {
    buf: &'a [u8],
}

impl<'a> SliceReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::wrapped(
                ErrorKind::MalformedFrame,
                "control body shorter than its length prefixes claim",
            ));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes(raw.try_into().unwrap()))
    }

    fn read_string(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?.to_vec();
        String::from_utf8(raw).wrapped(ErrorKind::MalformedFrame)
    }
}

/// A buffered frame decoder over one half of a peer transport.
///
/// All read methods block until the requested bytes arrive; a transport
/// that closes mid-frame yields `ShortRead`. Partial frames are never
/// returned.
pub struct Reader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(transport: R) -> Self {
        Reader {
            inner: BufReader::new(transport),
        }
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.inner.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0; 8];
        self.inner.read_exact(&mut buf).await?;
        Ok(u64::from_be_bytes(buf))
    }

    pub async fn read_node_id(&mut self) -> Result<NodeId> {
        let mut buf = [0; NodeId::LENGTH];
        self.inner.read_exact(&mut buf).await?;
        Ok(NodeId::from_bytes(buf))
    }

    pub async fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_string(&mut self, len: usize) -> Result<String> {
        let raw = self.read_vec(len).await?;
        String::from_utf8(raw).wrapped(ErrorKind::MalformedFrame)
    }

    pub async fn read_subscriptions(&mut self) -> Result<Vec<Subscription>> {
        let count = self.read_u32().await?;
        let mut subs = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let channel_len = self.read_u32().await? as usize;
            let key_len = self.read_u32().await? as usize;
            let channel = self.read_string(channel_len).await?;
            let key = self.read_string(key_len).await?;
            subs.push(Subscription { channel, key });
        }
        Ok(subs)
    }

    /// Reads the leading byte of the next frame.
    pub async fn read_tag(&mut self) -> Result<FrameTag> {
        FrameTag::from_u8(self.read_u8().await?)
    }

    /// Reads the leading byte of the next frame, failing with
    /// `UnexpectedTag` unless it matches `want`.
    pub async fn expect_tag(&mut self, want: FrameTag) -> Result<()> {
        let raw = self.read_u8().await?;
        if raw != want as u8 {
            return Err(Error::wrapped(
                ErrorKind::UnexpectedTag,
                format!("expected tag {:?}, found byte {}", want, raw),
            ));
        }
        Ok(())
    }

    /// Decodes a `HandshakeRequest` payload. The tag byte must already
    /// have been consumed.
    pub async fn read_handshake_request(&mut self) -> Result<HandshakeRequest> {
        let version = self.read_u64().await?;
        let id = self.read_node_id().await?;
        let subscriptions = self.read_subscriptions().await?;
        Ok(HandshakeRequest {
            version,
            id,
            subscriptions,
        })
    }

    /// Decodes a `HandshakeResponse` payload. The tag byte must already
    /// have been consumed.
    pub async fn read_handshake_response(&mut self) -> Result<HandshakeResponse> {
        let version = self.read_u64().await?;
        let id = self.read_node_id().await?;
        let status = HandshakeStatus::from_u8(self.read_u8().await?)?;
        let subscriptions = self.read_subscriptions().await?;
        Ok(HandshakeResponse {
            version,
            id,
            status,
            subscriptions,
        })
    }

    /// Decodes a `HandshakeFinal` payload. The tag byte must already
    /// have been consumed.
    pub async fn read_handshake_final(&mut self) -> Result<HandshakeStatus> {
        HandshakeStatus::from_u8(self.read_u8().await?)
    }

    /// Decodes a `RegularMessage` payload. The tag byte must already
    /// have been consumed.
    pub async fn read_regular(&mut self) -> Result<RegularMessage> {
        let message_id = self.read_u64().await?;
        let channel_len = self.read_len().await?;
        let channel = self.read_string(channel_len).await?;
        let key_len = self.read_len().await?;
        let key = self.read_string(key_len).await?;
        let body_len = self.read_len().await?;
        let body = self.read_vec(body_len).await?;
        Ok(RegularMessage {
            message_id,
            channel,
            key,
            body,
        })
    }

    /// Decodes an `Ack` payload. The tag byte must already have been
    /// consumed.
    pub async fn read_ack(&mut self) -> Result<Ack> {
        let status = self.read_u8().await?;
        let message_id = self.read_u64().await?;
        Ok(Ack { status, message_id })
    }

    async fn read_len(&mut self) -> Result<usize> {
        self.read_u64()
            .await?
            .try_into()
            .simple_msg(ErrorKind::MalformedFrame, "length prefix overflows usize")
    }
}
