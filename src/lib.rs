//! Node-local asynchronous session and message-dispatch core.
//!
//! Inbound frames arrive from the transport on a [`session::NetHandle`] and are
//! routed by the [`dispatcher::MessageDispatcher`] to one of three places:
//!
//! - the system-info probe, answered synchronously on the same handle
//! - a session, resolved (or created) through the [`registry::SessionRegistry`]
//! - the node's main queue, as an owned [`queue::OutboundEvent`]
//!
//! ## Architecture
//!
//! - **Wire (`wire/`)**: fixed-size header, opcodes, reply bodies and data-node requests.
//! - **Sessions (`session/`)**: the session state-machine contract and the
//!   actor that serializes every callback of one session.
//! - **Registry (`registry.rs`)**: key to live-session map, lifecycle and timer ownership.
//! - **Timers (`timer.rs`)**: interval timers that hand ticks off to the registry.
//! - **Node (`node.rs`)**: the composition root that owns all of the above.
//! - **Search adapter (`seadapter/`)**: the index-synchronization session that
//!   replays a primary collection into a search index through a staging collection.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod failure;
pub mod hooks;
pub mod node;
pub mod queue;
pub mod registry;
pub mod seadapter;
pub mod session;
pub mod structured_logger;
pub mod telemetry;
pub mod timer;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::NodeConfig;
pub use dispatcher::MessageDispatcher;
pub use errors::{CollaboratorError, DispatchError, QueueError, RegistryError, SessionError, WireError};
pub use hooks::{DefaultHooks, ErrorDisposition, RouteAgent, SessionManagerHooks};
pub use node::Node;
pub use queue::{ChannelEventQueue, EventQueue, OutboundEvent};
pub use registry::{SessionFactory, SessionHint, SessionInfo, SessionInit, SessionRef, SessionRegistry};
pub use session::{ExecContext, NetHandle, Session, SessionKey, SessionPolicy, SessionTag, SessionType};
pub use timer::{TimerFired, TimerId, TimerService};
pub use wire::{Envelope, MsgHeader, OpCode, OpReply, StatusCode};
