use super::header::{Envelope, OpCode};
use crate::errors::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

/// Context id meaning "no cursor".
pub const NO_CONTEXT: i64 = -1;

/// Status code carried in a reply's `flags` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(i32);

impl StatusCode {
    pub const OK: Self = Self(0);
    pub const OOM: Self = Self(-2);
    pub const INVALIDARG: Self = Self(-6);
    pub const SYS: Self = Self(-10);
    pub const TIMEOUT: Self = Self(-13);
    pub const NETWORK: Self = Self(-15);
    pub const DMS_NOTEXIST: Self = Self(-23);
    pub const DMS_EOC: Self = Self(-29);
    pub const CS_NOTEXIST: Self = Self(-34);
    pub const BROKEN_MSG: Self = Self(-84);
    pub const NOT_PRIMARY: Self = Self(-104);
    pub const CS_DELETING: Self = Self(-248);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Collection, collection space, or a collection space being dropped.
    pub fn is_not_exist(self) -> bool {
        self == Self::DMS_NOTEXIST || self == Self::CS_NOTEXIST || self == Self::CS_DELETING
    }

    pub fn class(self) -> ReplyClass {
        if self.is_ok() {
            ReplyClass::Ok
        } else if self == Self::DMS_EOC {
            ReplyClass::EndOfCursor
        } else if self.is_not_exist() {
            ReplyClass::NotExist
        } else if self == Self::NOT_PRIMARY {
            ReplyClass::NotPrimary
        } else {
            ReplyClass::Failed(self)
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a session should read a reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Ok,
    EndOfCursor,
    NotExist,
    NotPrimary,
    Failed(StatusCode),
}

/// Body of a query, getmore or kill-context reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReply {
    pub flags: StatusCode,
    #[serde(default = "no_context")]
    pub context_id: i64,
    #[serde(default)]
    pub start_from: i32,
    #[serde(default)]
    pub num_returned: i32,
    #[serde(default)]
    pub docs: Vec<Value>,
}

fn no_context() -> i64 {
    NO_CONTEXT
}

impl OpReply {
    pub fn ok(context_id: i64, docs: Vec<Value>) -> Self {
        Self {
            flags: StatusCode::OK,
            context_id,
            start_from: 0,
            num_returned: docs.len() as i32,
            docs,
        }
    }

    pub fn end_of_cursor() -> Self {
        Self::failed(StatusCode::DMS_EOC)
    }

    pub fn failed(status: StatusCode) -> Self {
        Self {
            flags: status,
            context_id: NO_CONTEXT,
            start_from: 0,
            num_returned: 0,
            docs: Vec::new(),
        }
    }

    pub fn decode(envelope: &Envelope) -> Result<Self, WireError> {
        envelope.decode_json()
    }

    pub fn into_envelope(self, op_code: OpCode, tag: u32, request_id: u64) -> Result<Envelope, WireError> {
        Envelope::json(op_code, tag, request_id, &self)
    }
}
