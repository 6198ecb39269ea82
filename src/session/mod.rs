//! Session contract and identity types.
//!
//! A session is a state machine owned by the registry and driven from a single
//! actor: received messages, timer ticks, attach and detach all arrive through
//! its mailbox, so implementations never need interior locking.

mod actor;
mod message_map;

pub use actor::{SessionActor, SessionActorArgs, SessionMsg, SessionRetirer};
pub use message_map::{MessageHandler, MessageMap};

use crate::errors::SessionError;
use crate::timer::TimerId;
use crate::wire::{Envelope, MsgHeader};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport-level connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetHandle(pub u32);

impl NetHandle {
    /// Owner recorded for sessions the node spawns itself.
    pub const INTERNAL: Self = Self(u32::MAX);
}

impl Display for NetHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 32-bit tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTag(pub u32);

impl SessionTag {
    /// Set on tags allocated for active sessions.
    pub const ACTIVE_BIT: u32 = 0x8000_0000;

    pub fn is_active(self) -> bool {
        self.0 & Self::ACTIVE_BIT != 0
    }
}

/// Registry key of a live session.
///
/// Passive keys combine the owning handle with the tag, active keys use
/// [`NetHandle::INTERNAL`] so replies on any data-node connection resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(pub u64);

impl SessionKey {
    pub fn passive(handle: NetHandle, tag: SessionTag) -> Self {
        Self((u64::from(handle.0) << 32) | u64::from(tag.0))
    }

    pub fn active(tag: SessionTag) -> Self {
        Self::passive(NetHandle::INTERNAL, tag)
    }

    pub fn tag(self) -> SessionTag {
        SessionTag(self.0 as u32)
    }

    pub fn handle(self) -> NetHandle {
        NetHandle((self.0 >> 32) as u32)
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Discriminant used to pick a factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Client,
    Replication,
    SearchIndex,
}

impl Display for SessionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Replication => write!(f, "replication"),
            Self::SearchIndex => write!(f, "search_index"),
        }
    }
}

/// Whether the session was created by inbound traffic or by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    Passive,
    Active,
}

/// Execution context shared between a session and the dispatcher.
///
/// The dispatcher only ever touches the interrupt flag; everything else in a
/// session is private to its actor.
#[derive(Debug, Default)]
pub struct ExecContext {
    interrupted: AtomicBool,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

/// A session state machine.
pub trait Session: Send + 'static {
    fn key(&self) -> SessionKey;

    fn name(&self) -> &str;

    fn session_type(&self) -> SessionType;

    fn exec(&self) -> &Arc<ExecContext>;

    /// Bookkeeping when the dispatcher has resolved this session for a frame.
    fn on_receive(&mut self, _handle: NetHandle, _header: &MsgHeader) {}

    /// Advances the state machine on a reply or request.
    fn on_message(&mut self, handle: NetHandle, envelope: &Envelope) -> Result<(), SessionError>;

    fn on_timer(&mut self, _timer_id: TimerId, _interval_ms: u32) {}

    /// Polled after every callback; `true` retires the session.
    fn timeout(&self, _interval_ms: u32) -> bool {
        false
    }

    /// Interval for the session's periodic timer, if it wants one.
    fn timer_interval(&self) -> Option<Duration> {
        None
    }

    /// Acquires session-scoped resources. A failure must leave `timeout`
    /// reporting `true`.
    fn on_attach(&mut self) {}

    fn on_detach(&mut self) {}
}
