use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame payload. Bounds memory against a hostile
/// or buggy peer; a larger prefix is a protocol error, not a retry.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u32 = 1 << 20; // 1 MiB

const LEN_PREFIX_BYTES: usize = 4;
const KIND_BYTES: usize = 1;
const HEAD_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u32),
    #[error("frame head missing for {0:?}")]
    MissingHead(ProtoKind),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Every protocol error is fatal to the connection carrying it.
    /// There is no partial-frame recovery.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Closed set of wire message kinds. Unknown tags are protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtoKind {
    Ping = 0x01,
    Pong = 0x02,
    Request = 0x10,
    ResponseOk = 0x11,
    ResponseErr = 0x12,
    Transfer = 0x20,
    RemoteConnected = 0x21,
    RemoteDisconnect = 0x22,
}

impl ProtoKind {
    fn from_u8(v: u8) -> Result<Self, ProtoError> {
        Ok(match v {
            0x01 => ProtoKind::Ping,
            0x02 => ProtoKind::Pong,
            0x10 => ProtoKind::Request,
            0x11 => ProtoKind::ResponseOk,
            0x12 => ProtoKind::ResponseErr,
            0x20 => ProtoKind::Transfer,
            0x21 => ProtoKind::RemoteConnected,
            0x22 => ProtoKind::RemoteDisconnect,
            other => return Err(ProtoError::UnknownKind(other)),
        })
    }

    /// The fixed head block is present for every kind except the
    /// registration request/response family.
    pub fn has_head(self) -> bool {
        !matches!(
            self,
            ProtoKind::Request | ProtoKind::ResponseOk | ProtoKind::ResponseErr
        )
    }
}

/// `(tunnel_id, session_id)` routing head, encoded big-endian as one u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Head {
    pub tunnel_id: u32,
    pub session_id: u32,
}

impl Head {
    pub fn new(tunnel_id: u32, session_id: u32) -> Self {
        Self {
            tunnel_id,
            session_id,
        }
    }
}

/// One framed protocol message. Immutable once constructed; use the
/// kind-specific constructors so the head invariant holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    pub kind: ProtoKind,
    pub head: Option<Head>,
    pub payload: Bytes,
}

impl ProtoMessage {
    pub fn ping() -> Self {
        Self {
            kind: ProtoKind::Ping,
            head: Some(Head::default()),
            payload: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: ProtoKind::Pong,
            head: Some(Head::default()),
            payload: Bytes::new(),
        }
    }

    pub fn request(payload: Bytes) -> Self {
        Self {
            kind: ProtoKind::Request,
            head: None,
            payload,
        }
    }

    pub fn response_ok(payload: Bytes) -> Self {
        Self {
            kind: ProtoKind::ResponseOk,
            head: None,
            payload,
        }
    }

    pub fn response_err(reason: &str) -> Self {
        Self {
            kind: ProtoKind::ResponseErr,
            head: None,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn transfer(tunnel_id: u32, session_id: u32, payload: Bytes) -> Self {
        Self {
            kind: ProtoKind::Transfer,
            head: Some(Head::new(tunnel_id, session_id)),
            payload,
        }
    }

    pub fn remote_connected(tunnel_id: u32, session_id: u32) -> Self {
        Self {
            kind: ProtoKind::RemoteConnected,
            head: Some(Head::new(tunnel_id, session_id)),
            payload: Bytes::new(),
        }
    }

    pub fn remote_disconnect(tunnel_id: u32, session_id: u32) -> Self {
        Self {
            kind: ProtoKind::RemoteDisconnect,
            head: Some(Head::new(tunnel_id, session_id)),
            payload: Bytes::new(),
        }
    }
}

/// Frame layout: `[payload_len: u32 BE][kind: u8][head: u64 BE, kind-dependent][payload]`.
#[derive(Debug, Clone, Copy)]
pub struct ProtoCodec {
    max_payload_bytes: u32,
}

impl ProtoCodec {
    pub fn new(max_payload_bytes: u32) -> Self {
        Self { max_payload_bytes }
    }
}

impl Default for ProtoCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl Decoder for ProtoCodec {
    type Item = ProtoMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtoMessage>, ProtoError> {
        if src.len() < LEN_PREFIX_BYTES + KIND_BYTES {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if payload_len > self.max_payload_bytes {
            // Reject before buffering the payload.
            return Err(ProtoError::PayloadTooLarge(payload_len));
        }

        let kind = ProtoKind::from_u8(src[4])?;
        let head_len = if kind.has_head() { HEAD_BYTES } else { 0 };
        let frame_len = LEN_PREFIX_BYTES + KIND_BYTES + head_len + payload_len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX_BYTES + KIND_BYTES);
        let head = if kind.has_head() {
            let tunnel_id = src.get_u32();
            let session_id = src.get_u32();
            Some(Head::new(tunnel_id, session_id))
        } else {
            None
        };
        let payload = src.split_to(payload_len as usize).freeze();

        Ok(Some(ProtoMessage {
            kind,
            head,
            payload,
        }))
    }
}

impl Encoder<ProtoMessage> for ProtoCodec {
    type Error = ProtoError;

    fn encode(&mut self, msg: ProtoMessage, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let payload_len: u32 = msg
            .payload
            .len()
            .try_into()
            .map_err(|_| ProtoError::PayloadTooLarge(u32::MAX))?;
        if payload_len > self.max_payload_bytes {
            return Err(ProtoError::PayloadTooLarge(payload_len));
        }

        let head_len = if msg.kind.has_head() { HEAD_BYTES } else { 0 };
        dst.reserve(LEN_PREFIX_BYTES + KIND_BYTES + head_len + msg.payload.len());

        dst.put_u32(payload_len);
        dst.put_u8(msg.kind as u8);
        if msg.kind.has_head() {
            let head = msg.head.ok_or(ProtoError::MissingHead(msg.kind))?;
            dst.put_u32(head.tunnel_id);
            dst.put_u32(head.session_id);
        }
        dst.put_slice(&msg.payload);
        Ok(())
    }
}
