use super::sysinfo::{SYSTEM_INFO_LEN, SYS_INFO_PROBE_LEN};
use crate::errors::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use std::fmt::{Display, Formatter};

/// Size of the fixed header: length, opcode, session tag, request id.
pub const HEADER_LEN: usize = 20;

/// Bit set on the opcode of every reply.
pub const REPLY_MASK: i32 = 0x4000_0000;

const OP_QUERY: i32 = 2004;
const OP_GETMORE: i32 = 2005;
const OP_KILL_CONTEXT: i32 = 2007;
const OP_DISCONNECT: i32 = 2008;
const OP_INTERRUPT: i32 = 2009;
const OP_INTERRUPT_SELF: i32 = 2016;

/// Operation codes the core routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Query,
    QueryResponse,
    GetMore,
    GetMoreResponse,
    KillContext,
    KillContextResponse,
    Disconnect,
    Interrupt,
    InterruptSelf,
    /// Any opcode the core does not interpret.
    Other(i32),
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Query => OP_QUERY,
            Self::QueryResponse => OP_QUERY | REPLY_MASK,
            Self::GetMore => OP_GETMORE,
            Self::GetMoreResponse => OP_GETMORE | REPLY_MASK,
            Self::KillContext => OP_KILL_CONTEXT,
            Self::KillContextResponse => OP_KILL_CONTEXT | REPLY_MASK,
            Self::Disconnect => OP_DISCONNECT,
            Self::Interrupt => OP_INTERRUPT,
            Self::InterruptSelf => OP_INTERRUPT_SELF,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            OP_QUERY => Self::Query,
            c if c == OP_QUERY | REPLY_MASK => Self::QueryResponse,
            OP_GETMORE => Self::GetMore,
            c if c == OP_GETMORE | REPLY_MASK => Self::GetMoreResponse,
            OP_KILL_CONTEXT => Self::KillContext,
            c if c == OP_KILL_CONTEXT | REPLY_MASK => Self::KillContextResponse,
            OP_DISCONNECT => Self::Disconnect,
            OP_INTERRUPT => Self::Interrupt,
            OP_INTERRUPT_SELF => Self::InterruptSelf,
            other => Self::Other(other),
        }
    }

    pub fn is_reply(self) -> bool {
        self.code() & REPLY_MASK != 0
    }

    /// Disconnect and interrupt opcodes must never bring a session into existence.
    pub fn allows_session_create(self) -> bool {
        !matches!(self, Self::Disconnect | Self::Interrupt | Self::InterruptSelf)
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(code) => write!(f, "opcode({})", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// The fixed-size header at the front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame size in bytes, header included.
    pub length: u32,
    pub op_code: OpCode,
    /// Zero routes to the main queue, anything else to a session.
    pub tag: u32,
    /// Correlation id echoed back in replies.
    pub request_id: u64,
}

impl MsgHeader {
    /// Creates a header for a frame carrying `payload_len` body bytes.
    pub fn new(op_code: OpCode, tag: u32, request_id: u64, payload_len: usize) -> Self {
        Self {
            length: (HEADER_LEN + payload_len) as u32,
            op_code,
            tag,
            request_id,
        }
    }

    /// Reads the header of a complete frame.
    ///
    /// A frame whose first word is [`SYSTEM_INFO_LEN`] is the system-info probe
    /// and only needs the probe's twelve bytes.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < 4 {
            return Err(WireError::Truncated {
                needed: 4,
                actual: frame.len(),
            });
        }
        let mut buf = frame;
        let length = buf.get_u32_le();

        if length == SYSTEM_INFO_LEN {
            if frame.len() < SYS_INFO_PROBE_LEN {
                return Err(WireError::Truncated {
                    needed: SYS_INFO_PROBE_LEN,
                    actual: frame.len(),
                });
            }
            return Ok(Self {
                length,
                op_code: OpCode::Other(0),
                tag: 0,
                request_id: 0,
            });
        }

        if (length as usize) < HEADER_LEN {
            return Err(WireError::BadLength(length));
        }
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                actual: frame.len(),
            });
        }
        if length as usize != frame.len() {
            return Err(WireError::LengthMismatch {
                declared: length,
                actual: frame.len(),
            });
        }

        let op_code = OpCode::from_code(buf.get_i32_le());
        let tag = buf.get_u32_le();
        let request_id = buf.get_u64_le();
        Ok(Self {
            length,
            op_code,
            tag,
            request_id,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32_le(self.length);
        dst.put_i32_le(self.op_code.code());
        dst.put_u32_le(self.tag);
        dst.put_u64_le(self.request_id);
    }

    pub fn is_system_info(&self) -> bool {
        self.length == SYSTEM_INFO_LEN
    }

    pub fn is_main_queue(&self) -> bool {
        self.tag == 0
    }
}

/// A header plus an owned copy of the whole frame it came from.
///
/// The transport reuses its receive buffer as soon as dispatch returns, so
/// anything that outlives the dispatch call holds one of these instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: MsgHeader,
    frame: Bytes,
}

impl Envelope {
    /// Copies the first `header.length` bytes of `frame` into a fresh buffer.
    pub fn copy_from(header: MsgHeader, frame: &[u8]) -> Result<Self, WireError> {
        let len = if header.is_system_info() {
            frame.len()
        } else {
            header.length as usize
        };
        let source = frame.get(..len).ok_or(WireError::Truncated {
            needed: len,
            actual: frame.len(),
        })?;

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(len)
            .map_err(|_| WireError::AllocFailed { len })?;
        owned.extend_from_slice(source);

        Ok(Self {
            header,
            frame: Bytes::from(owned),
        })
    }

    /// Builds a frame around `payload`.
    pub fn build(op_code: OpCode, tag: u32, request_id: u64, payload: &[u8]) -> Self {
        let header = MsgHeader::new(op_code, tag, request_id, payload.len());
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.put_slice(payload);
        Self {
            header,
            frame: buf.freeze(),
        }
    }

    /// Builds a frame whose body is `body` serialized as JSON.
    pub fn json<T: serde::Serialize>(
        op_code: OpCode,
        tag: u32,
        request_id: u64,
        body: &T,
    ) -> Result<Self, WireError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::build(op_code, tag, request_id, &payload))
    }

    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// The body after the header. Empty for the system-info probe.
    pub fn payload(&self) -> &[u8] {
        if self.header.is_system_info() {
            return &[];
        }
        self.frame.get(HEADER_LEN..).unwrap_or(&[])
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(self.payload())?)
    }
}
