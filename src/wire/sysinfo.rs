use bytes::{BufMut, Bytes, BytesMut};

/// Value of the first header word that marks a system-info probe.
pub const SYSTEM_INFO_LEN: u32 = 0xFFFF_FFFF;
pub const EYE_CATCHER: u32 = 0xFFFE_FDFC;

/// Probe layout: special length, eye catcher, real length.
pub const SYS_INFO_PROBE_LEN: usize = 12;
/// Reply layout: the probe fields, OS type, and 16 reserved bytes.
pub const SYS_INFO_REPLY_LEN: usize = 32;

/// The answer written back synchronously on a probing handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysInfoReply {
    pub os_type: i32,
}

impl SysInfoReply {
    pub fn new(os_type: i32) -> Self {
        Self { os_type }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYS_INFO_REPLY_LEN);
        buf.put_u32_le(SYSTEM_INFO_LEN);
        buf.put_u32_le(EYE_CATCHER);
        buf.put_u32_le(SYS_INFO_REPLY_LEN as u32);
        buf.put_i32_le(self.os_type);
        buf.put_bytes(0, 16);
        buf.freeze()
    }
}

/// Builds the probe a peer sends to ask for system information.
pub fn encode_probe() -> Bytes {
    let mut buf = BytesMut::with_capacity(SYS_INFO_PROBE_LEN);
    buf.put_u32_le(SYSTEM_INFO_LEN);
    buf.put_u32_le(EYE_CATCHER);
    buf.put_u32_le(SYS_INFO_PROBE_LEN as u32);
    buf.freeze()
}
