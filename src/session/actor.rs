//! Actor hosting one live session.
//!
//! The actor mailbox is the session's message queue: frames, timer ticks and
//! detach requests are handled strictly in arrival order, one at a time.

use crate::session::{NetHandle, Session, SessionKey};
use crate::timer::TimerId;
use crate::wire::{Envelope, MsgHeader};
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::sync::Weak;
use tokio::sync::oneshot;

/// Messages accepted by a session actor.
pub enum SessionMsg {
    /// The dispatcher resolved this session for an inbound frame.
    Received { handle: NetHandle, header: MsgHeader },
    /// An owned frame for the session's message handlers.
    Deliver { handle: NetHandle, envelope: Envelope },
    /// A tick of the session's periodic timer.
    Timer { timer_id: TimerId, interval_ms: u32 },
    /// The registry has dropped the session; run `on_detach` and stop.
    Detach(oneshot::Sender<()>),
    /// Replies once every earlier message has been handled.
    Flush(oneshot::Sender<()>),
}

/// Removes a session that retired itself from the registry.
#[async_trait]
pub trait SessionRetirer: Send + Sync {
    /// Returns `false` when the key was already released.
    async fn retire(&self, key: SessionKey) -> bool;
}

pub struct SessionActorArgs {
    pub session: Box<dyn Session>,
    pub retirer: Weak<dyn SessionRetirer>,
}

pub struct SessionActorState {
    session: Box<dyn Session>,
    retirer: Weak<dyn SessionRetirer>,
    detached: bool,
    failed_messages: u64,
}

impl SessionActorState {
    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.session.on_detach();
        }
    }
}

pub struct SessionActor;

impl SessionActor {
    /// Retires the session when its timeout predicate fires.
    async fn poll_timeout(
        myself: &ActorRef<SessionMsg>,
        state: &mut SessionActorState,
        interval_ms: u32,
    ) {
        if state.detached || !state.session.timeout(interval_ms) {
            return;
        }

        let key = state.session.key();
        tracing::debug!(session = %key, name = state.session.name(), "Session asked to stop");
        match state.retirer.upgrade() {
            Some(retirer) => {
                if !retirer.retire(key).await {
                    tracing::debug!(session = %key, "Session was already released");
                }
            }
            None => tracing::debug!(session = %key, "Registry gone before retiring session"),
        }
        state.detach();
        myself.stop(None);
    }
}

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;
    type State = SessionActorState;
    type Arguments = SessionActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut session = args.session;
        session.on_attach();

        Ok(SessionActorState {
            session,
            retirer: args.retirer,
            detached: false,
            failed_messages: 0,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // A failed attach reports done straight away.
        Self::poll_timeout(&myself, state, 0).await;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.detached {
            return Ok(());
        }

        match message {
            SessionMsg::Received { handle, header } => {
                state.session.on_receive(handle, &header);
            }
            SessionMsg::Deliver { handle, envelope } => {
                if let Err(err) = state.session.on_message(handle, &envelope) {
                    state.failed_messages += 1;
                    tracing::warn!(
                        session = %state.session.key(),
                        op_code = %envelope.header.op_code,
                        failures = state.failed_messages,
                        "Session failed to process message: {}",
                        err
                    );
                }
                Self::poll_timeout(&myself, state, 0).await;
            }
            SessionMsg::Timer {
                timer_id,
                interval_ms,
            } => {
                state.session.on_timer(timer_id, interval_ms);
                Self::poll_timeout(&myself, state, interval_ms).await;
            }
            SessionMsg::Detach(reply) => {
                state.detach();
                if reply.send(()).is_err() {
                    tracing::debug!("Detach reply channel closed");
                }
                myself.stop(None);
            }
            SessionMsg::Flush(reply) => {
                if reply.send(()).is_err() {
                    tracing::debug!("Flush reply channel closed");
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.detach();
        Ok(())
    }
}
