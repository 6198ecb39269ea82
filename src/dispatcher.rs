//! Inbound message classification.
//!
//! Every frame goes to exactly one of three routes:
//!
//! 1. the system-info probe, answered synchronously on the same handle
//! 2. a session, resolved through the registry by the header's tag
//! 3. the main queue, for untagged frames
//!
//! The transport owns the frame buffer and may reuse it as soon as a dispatch
//! call returns, so anything queued past this point is an owned copy.

use crate::config::DispatcherConfig;
use crate::errors::{DispatchError, RegistryError, WireError};
use crate::hooks::{ErrorDisposition, RouteAgent, SessionManagerHooks};
use crate::queue::{EventQueue, OutboundEvent};
use crate::registry::SessionRegistry;
use crate::session::{NetHandle, SessionKey, SessionPolicy, SessionTag};
use crate::structured_logger::SessionJournal;
use crate::wire::{Envelope, MsgHeader, OpCode, SysInfoReply};
use bytes::Bytes;
use std::sync::Arc;

pub struct MessageDispatcher {
    registry: SessionRegistry,
    hooks: Arc<dyn SessionManagerHooks>,
    route: Arc<dyn RouteAgent>,
    main_queue: Arc<dyn EventQueue>,
    sys_info_reply: Bytes,
    journal: Option<Arc<SessionJournal>>,
}

impl MessageDispatcher {
    pub fn new(
        config: &DispatcherConfig,
        registry: SessionRegistry,
        hooks: Arc<dyn SessionManagerHooks>,
        route: Arc<dyn RouteAgent>,
        main_queue: Arc<dyn EventQueue>,
        journal: Option<Arc<SessionJournal>>,
    ) -> Self {
        Self {
            registry,
            hooks,
            route,
            main_queue,
            sys_info_reply: SysInfoReply::new(config.os_type).encode(),
            journal,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Decodes the header of a raw frame and dispatches it.
    pub async fn on_frame(&self, handle: NetHandle, frame: &[u8]) -> Result<(), DispatchError> {
        let header = match MsgHeader::decode(frame) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(handle = %handle, len = frame.len(), "Dropping malformed frame: {}", err);
                return Err(err.into());
            }
        };
        self.on_message(handle, &header, frame).await
    }

    /// Routes one frame. An error means the connection must be closed.
    ///
    /// Calls for the same handle must not overlap.
    pub async fn on_message(
        &self,
        handle: NetHandle,
        header: &MsgHeader,
        frame: &[u8],
    ) -> Result<(), DispatchError> {
        if header.is_system_info() {
            return self.reply_sys_info(handle);
        }

        if header.is_main_queue() {
            self.dispatch_main(handle, header, frame)
        } else {
            self.dispatch_session(handle, header, frame).await
        }
    }

    /// Releases the passive sessions of a closed connection.
    pub async fn on_close(&self, handle: NetHandle) -> usize {
        let released = self.registry.handle_close(handle).await;
        tracing::debug!(handle = %handle, released, "Connection closed");
        released
    }

    fn reply_sys_info(&self, handle: NetHandle) -> Result<(), DispatchError> {
        self.route
            .sync_send_raw(handle, &self.sys_info_reply)
            .map_err(|err| {
                tracing::warn!(handle = %handle, "Failed to answer system info probe: {}", err);
                DispatchError::Reply(err)
            })
    }

    fn dispatch_main(&self, handle: NetHandle, header: &MsgHeader, frame: &[u8]) -> Result<(), DispatchError> {
        let envelope = match Envelope::copy_from(*header, frame) {
            Ok(envelope) => envelope,
            Err(err) => return self.escalate(err.into(), header, handle, None),
        };

        match self.main_queue.post_event(OutboundEvent::Message { handle, envelope }) {
            Ok(()) => Ok(()),
            Err(err) => self.escalate(err.into(), header, handle, None),
        }
    }

    async fn dispatch_session(
        &self,
        handle: NetHandle,
        header: &MsgHeader,
        frame: &[u8],
    ) -> Result<(), DispatchError> {
        let key = self.hooks.make_session_key(handle, header);
        let tag = SessionTag(header.tag);
        // Active sessions are only ever started by the node itself.
        let allow_create = header.op_code.allows_session_create() && !tag.is_active();
        let policy = if tag.is_active() {
            SessionPolicy::Active
        } else {
            SessionPolicy::Passive
        };

        let session = match self
            .registry
            .get_or_create(key, policy, handle, allow_create, header.op_code, None)
            .await
        {
            Ok(session) => session,
            Err(RegistryError::NotFound(_)) if !allow_create => {
                if header.op_code == OpCode::Disconnect {
                    self.hooks.on_none_session_disconnect(key, handle);
                } else {
                    tracing::debug!(
                        session = %key,
                        op_code = %header.op_code,
                        "No session for message, dropping"
                    );
                }
                return Ok(());
            }
            Err(err) => return self.escalate(err.into(), header, handle, Some(key)),
        };

        if let Err(err) = self.registry.notify_received(&session, handle, header).await {
            return self.escalate(err.into(), header, handle, Some(key));
        }

        match header.op_code {
            OpCode::Disconnect => {
                self.hooks.on_session_disconnect(&session);
                if let Err(err) = self.registry.release(key, false).await {
                    tracing::warn!(session = %key, "Failed to release disconnected session: {}", err);
                }
                return Ok(());
            }
            OpCode::InterruptSelf => {
                session.interrupt();
                return Ok(());
            }
            OpCode::Interrupt => session.interrupt(),
            _ => {}
        }

        let envelope = match Envelope::copy_from(*header, frame) {
            Ok(envelope) => envelope,
            Err(WireError::AllocFailed { .. }) => {
                return self.escalate(RegistryError::OutOfMemory.into(), header, handle, Some(key))
            }
            Err(err) => return self.escalate(err.into(), header, handle, Some(key)),
        };

        match self.registry.push_message(&session, handle, envelope) {
            Ok(()) => Ok(()),
            Err(err) => self.escalate(err.into(), header, handle, Some(key)),
        }
    }

    /// Lets the hooks decide whether a failure closes the connection.
    fn escalate(
        &self,
        err: DispatchError,
        header: &MsgHeader,
        handle: NetHandle,
        key: Option<SessionKey>,
    ) -> Result<(), DispatchError> {
        let fatal = self.hooks.on_error(&err, header, handle, key) == ErrorDisposition::Fatal;
        if fatal {
            tracing::warn!(
                handle = %handle,
                op_code = %header.op_code,
                status = %err.status(),
                "Dispatch failed, closing connection: {}",
                err
            );
        } else {
            tracing::debug!(handle = %handle, op_code = %header.op_code, "Dispatch failure ignored: {}", err);
        }
        if let Some(journal) = &self.journal {
            journal.log_dispatch_failure(handle, header.op_code, &err.to_string(), fatal);
        }

        if fatal {
            Err(err)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod dispatcher_tests;
