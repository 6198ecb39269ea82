//! Error types for the dispatch core.
//!
//! Every component boundary has its own enum; none of them carry raw status
//! codes across into the registry or the timer service.

use crate::session::{SessionKey, SessionType};
use crate::timer::TimerId;
use crate::wire::{OpCode, StatusCode};
use std::fmt::{Display, Formatter};

/// Errors raised while decoding or building frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The frame is shorter than the structure being read.
    Truncated { needed: usize, actual: usize },
    /// The header's declared length disagrees with the frame size.
    LengthMismatch { declared: u32, actual: usize },
    /// The declared length is smaller than the header itself.
    BadLength(u32),
    /// Allocating the owned copy of a frame failed.
    AllocFailed { len: usize },
    /// The JSON body could not be encoded or decoded.
    Body(String),
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, actual } => {
                write!(f, "frame truncated: need {} bytes, got {}", needed, actual)
            }
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "header declares {} bytes but frame has {}",
                declared, actual
            ),
            Self::BadLength(len) => write!(f, "invalid message length {}", len),
            Self::AllocFailed { len } => write!(f, "failed to allocate {} bytes", len),
            Self::Body(message) => write!(f, "invalid message body: {}", message),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        Self::Body(err.to_string())
    }
}

/// Errors returned by remote collaborators (catalog, data node, search engine,
/// transport route agent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collection, collection space or index does not exist.
    NotExist(String),
    /// The node answering is not the primary of its group.
    NotPrimary,
    /// The call did not complete within its deadline.
    Timeout,
    /// The collaborator cannot be reached right now.
    Unavailable(String),
    /// Any other failure, with the collaborator's status code.
    Failed { code: i32, message: String },
}

impl CollaboratorError {
    /// Builds the error matching a non-OK status code.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if status.is_not_exist() {
            Self::NotExist(message)
        } else if status == StatusCode::NOT_PRIMARY {
            Self::NotPrimary
        } else if status == StatusCode::TIMEOUT {
            Self::Timeout
        } else {
            Self::Failed {
                code: status.code(),
                message,
            }
        }
    }
}

impl Display for CollaboratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotExist(what) => write!(f, "{} does not exist", what),
            Self::NotPrimary => write!(f, "node is not primary"),
            Self::Timeout => write!(f, "collaborator call timed out"),
            Self::Unavailable(message) => write!(f, "collaborator unavailable: {}", message),
            Self::Failed { code, message } => write!(f, "failed[{}]: {}", code, message),
        }
    }
}

impl std::error::Error for CollaboratorError {}

/// Errors from the session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No live session for the key. Expected during races.
    NotFound(SessionKey),
    /// No live session owns the timer any more.
    UnknownTimer(TimerId),
    /// A live session already owns the key.
    DuplicateKey(SessionKey),
    /// Allocation failed while building the session or its message.
    OutOfMemory,
    /// No factory can build a session for this request.
    NoFactory {
        session_type: Option<SessionType>,
        op_code: OpCode,
    },
    /// The factory refused to build the session.
    Create(String),
    /// The session actor could not be spawned.
    Spawn(String),
    /// The session is registered but its mailbox is closed.
    SessionGone(SessionKey),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "session {} not found", key),
            Self::UnknownTimer(timer_id) => write!(f, "{} has no owning session", timer_id),
            Self::DuplicateKey(key) => write!(f, "session {} already exists", key),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NoFactory {
                session_type,
                op_code,
            } => match session_type {
                Some(ty) => write!(f, "no factory registered for {} sessions", ty),
                None => write!(f, "no session type for opcode {}", op_code),
            },
            Self::Create(message) => write!(f, "failed to create session: {}", message),
            Self::Spawn(message) => write!(f, "failed to spawn session actor: {}", message),
            Self::SessionGone(key) => write!(f, "session {} is no longer accepting messages", key),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors from posting to the main processing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The consumer side of the queue has gone away.
    Closed,
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "main queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors returned by a session's message handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The reply could not be decoded.
    Wire(WireError),
    /// A data node or catalog call failed.
    Collaborator(CollaboratorError),
    /// A search engine call failed. Always worth retrying.
    Search(CollaboratorError),
    /// A reply carried a non-OK status.
    Status(StatusCode),
    /// The data violates an invariant (bad operation tag, missing id, ...).
    Structural(String),
    /// A reply arrived in a phase that never expects it.
    UnexpectedReply { op_code: OpCode, phase: String },
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(err) => write!(f, "wire error: {}", err),
            Self::Collaborator(err) => write!(f, "{}", err),
            Self::Search(err) => write!(f, "search engine: {}", err),
            Self::Status(status) => write!(f, "reply status {}", status),
            Self::Structural(message) => write!(f, "structural error: {}", message),
            Self::UnexpectedReply { op_code, phase } => {
                write!(f, "unexpected {} in phase {}", op_code, phase)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<CollaboratorError> for SessionError {
    fn from(err: CollaboratorError) -> Self {
        Self::Collaborator(err)
    }
}

/// Errors surfaced by the dispatcher. Returning one of these to the transport
/// means the connection must be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The frame itself is malformed.
    Wire(WireError),
    /// Session resolution or delivery failed.
    Registry(RegistryError),
    /// The main queue refused the event.
    Queue(QueueError),
    /// The synchronous system-info reply could not be sent.
    Reply(CollaboratorError),
}

impl DispatchError {
    /// Status reported to the transport for every dispatch failure.
    pub fn status(&self) -> StatusCode {
        StatusCode::BROKEN_MSG
    }
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(err) => write!(f, "malformed frame: {}", err),
            Self::Registry(err) => write!(f, "session dispatch failed: {}", err),
            Self::Queue(err) => write!(f, "main queue dispatch failed: {}", err),
            Self::Reply(err) => write!(f, "system info reply failed: {}", err),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<WireError> for DispatchError {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}
