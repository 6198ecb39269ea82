//! Frame layout shared by the dispatcher and every session.

mod header;
mod reply;
mod request;
mod sysinfo;

pub use header::{Envelope, MsgHeader, OpCode, HEADER_LEN, REPLY_MASK};
pub use reply::{OpReply, ReplyClass, StatusCode, NO_CONTEXT};
pub use request::{DataNodeRequest, FLG_QUERY_WITH_RETURNDATA, POP_COMMAND};
pub use sysinfo::{
    encode_probe, SysInfoReply, EYE_CATCHER, SYSTEM_INFO_LEN, SYS_INFO_PROBE_LEN,
    SYS_INFO_REPLY_LEN,
};

#[cfg(test)]
#[path = "tests/header_tests.rs"]
mod header_tests;
