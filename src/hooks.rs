//! Extension points the hosting node plugs into the dispatcher and registry.

use crate::errors::{CollaboratorError, DispatchError};
use crate::failure::FailureKind;
use crate::registry::SessionRef;
use crate::session::{NetHandle, SessionKey, SessionTag, SessionType};
use crate::wire::{MsgHeader, OpCode};

/// What the dispatcher does after reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The message counts as handled.
    Continue,
    /// The failure goes back to the transport, which closes the connection.
    Fatal,
}

/// Writes raw bytes back on a network handle.
pub trait RouteAgent: Send + Sync {
    fn sync_send_raw(&self, handle: NetHandle, data: &[u8]) -> Result<(), CollaboratorError>;
}

/// Per-node policy for session routing.
pub trait SessionManagerHooks: Send + Sync {
    /// Tags with the active bit resolve to node-spawned sessions regardless of
    /// which data-node connection the reply arrived on.
    fn make_session_key(&self, handle: NetHandle, header: &MsgHeader) -> SessionKey {
        let tag = SessionTag(header.tag);
        if tag.is_active() {
            SessionKey::active(tag)
        } else {
            SessionKey::passive(handle, tag)
        }
    }

    /// Session type for inbound traffic that needs a new session.
    fn passive_session_type(&self, _op_code: OpCode) -> Option<SessionType> {
        Some(SessionType::Client)
    }

    fn on_error(
        &self,
        err: &DispatchError,
        header: &MsgHeader,
        handle: NetHandle,
        key: Option<SessionKey>,
    ) -> ErrorDisposition {
        let disposition = match FailureKind::from_dispatch(err) {
            FailureKind::ProtocolFatal => ErrorDisposition::Fatal,
            _ => ErrorDisposition::Continue,
        };
        tracing::debug!(
            handle = %handle,
            op_code = %header.op_code,
            session = ?key,
            ?disposition,
            "Dispatch error reported"
        );
        disposition
    }

    /// A disconnect arrived for a session that does not exist.
    fn on_none_session_disconnect(&self, _key: SessionKey, _handle: NetHandle) {}

    /// Runs before a disconnecting session is released.
    fn on_session_disconnect(&self, _session: &SessionRef) {}

    fn on_session_released(&self, _key: SessionKey, _notify: bool) {}
}

/// Hooks with every default in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl SessionManagerHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RegistryError;

    #[test]
    fn test_active_tag_ignores_handle() {
        let hooks = DefaultHooks;
        let tag = SessionTag::ACTIVE_BIT | 9;
        let header = MsgHeader::new(OpCode::QueryResponse, tag, 1, 0);

        let a = hooks.make_session_key(NetHandle(1), &header);
        let b = hooks.make_session_key(NetHandle(2), &header);
        assert_eq!(a, b);
        assert_eq!(a, SessionKey::active(SessionTag(tag)));
    }

    #[test]
    fn test_passive_tag_includes_handle() {
        let hooks = DefaultHooks;
        let header = MsgHeader::new(OpCode::Query, 9, 1, 0);

        assert_ne!(
            hooks.make_session_key(NetHandle(1), &header),
            hooks.make_session_key(NetHandle(2), &header)
        );
    }

    #[test]
    fn test_default_error_policy() {
        let hooks = DefaultHooks;
        let header = MsgHeader::new(OpCode::Query, 9, 1, 0);
        let key = SessionKey(9);

        let not_found = DispatchError::Registry(RegistryError::NotFound(key));
        let duplicate = DispatchError::Registry(RegistryError::DuplicateKey(key));
        assert_eq!(
            hooks.on_error(&not_found, &header, NetHandle(1), Some(key)),
            ErrorDisposition::Continue
        );
        assert_eq!(
            hooks.on_error(&duplicate, &header, NetHandle(1), Some(key)),
            ErrorDisposition::Fatal
        );
    }
}
