//! Failure taxonomy shared by the dispatcher and background sessions.
//!
//! Collaborator status codes and typed errors are classified here at the
//! boundary; nothing past this point branches on raw codes.

use crate::errors::{CollaboratorError, DispatchError, RegistryError, SessionError, WireError};
use crate::wire::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network hiccup, timeout, momentary unavailability.
    Transient,
    /// Corrupt data or a broken invariant.
    Structural,
    /// The collection or index backing the task is gone.
    ResourceGone,
    /// A primary switch is in progress.
    NotPrimary,
    /// Malformed frame or key collision; the connection must close.
    ProtocolFatal,
}

impl FailureKind {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_not_exist() {
            Self::ResourceGone
        } else if status == StatusCode::NOT_PRIMARY {
            Self::NotPrimary
        } else if status == StatusCode::BROKEN_MSG {
            Self::ProtocolFatal
        } else if status == StatusCode::INVALIDARG || status == StatusCode::SYS {
            Self::Structural
        } else {
            Self::Transient
        }
    }

    pub fn from_collaborator(err: &CollaboratorError) -> Self {
        match err {
            CollaboratorError::NotExist(_) => Self::ResourceGone,
            CollaboratorError::NotPrimary => Self::NotPrimary,
            CollaboratorError::Timeout | CollaboratorError::Unavailable(_) => Self::Transient,
            CollaboratorError::Failed { code, .. } => Self::from_status(StatusCode::new(*code)),
        }
    }

    pub fn from_session(err: &SessionError) -> Self {
        match err {
            SessionError::Wire(WireError::AllocFailed { .. }) => Self::Transient,
            SessionError::Wire(_) | SessionError::Structural(_) => Self::Structural,
            SessionError::Collaborator(err) => Self::from_collaborator(err),
            SessionError::Search(_) => Self::Transient,
            SessionError::Status(status) => Self::from_status(*status),
            SessionError::UnexpectedReply { .. } => Self::Structural,
        }
    }

    pub fn from_dispatch(err: &DispatchError) -> Self {
        match err {
            DispatchError::Registry(
                RegistryError::NotFound(_)
                | RegistryError::UnknownTimer(_)
                | RegistryError::OutOfMemory
                | RegistryError::SessionGone(_),
            )
            | DispatchError::Wire(WireError::AllocFailed { .. }) => Self::Transient,
            _ => Self::ProtocolFatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Structural)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Transient => "Transient",
            Self::Structural => "Structural",
            Self::ResourceGone => "Resource Gone",
            Self::NotPrimary => "Not Primary",
            Self::ProtocolFatal => "Protocol Fatal",
        }
    }
}

/// What a background session does after a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Stay in the current phase and try again on the next tick.
    RetryNextTick,
    /// Re-derive the collection version and rescan from the start.
    RestartFromBegin,
    /// Drop the derived index and renegotiate the resume point.
    StartOver,
    /// Leave the pipeline for good.
    Terminate { drop_index: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FailureKind::from_status(StatusCode::DMS_NOTEXIST), FailureKind::ResourceGone);
        assert_eq!(FailureKind::from_status(StatusCode::CS_DELETING), FailureKind::ResourceGone);
        assert_eq!(FailureKind::from_status(StatusCode::NOT_PRIMARY), FailureKind::NotPrimary);
        assert_eq!(FailureKind::from_status(StatusCode::NETWORK), FailureKind::Transient);
        assert_eq!(FailureKind::from_status(StatusCode::INVALIDARG), FailureKind::Structural);
        assert_eq!(FailureKind::from_status(StatusCode::BROKEN_MSG), FailureKind::ProtocolFatal);
    }

    #[test]
    fn test_session_errors_classify_through_collaborator() {
        let err = SessionError::Collaborator(CollaboratorError::NotExist("cs.cl".to_string()));
        assert_eq!(FailureKind::from_session(&err), FailureKind::ResourceGone);

        let err = SessionError::Search(CollaboratorError::NotExist("idx".to_string()));
        assert_eq!(FailureKind::from_session(&err), FailureKind::Transient);

        let err = SessionError::Structural("bad type".to_string());
        assert_eq!(FailureKind::from_session(&err), FailureKind::Structural);
        assert!(FailureKind::Structural.is_retryable());
        assert!(!FailureKind::ResourceGone.is_retryable());
    }

    #[test]
    fn test_dispatch_errors_are_protocol_fatal_unless_racy() {
        let key = crate::session::SessionKey(1);
        let not_found = DispatchError::Registry(RegistryError::NotFound(key));
        let duplicate = DispatchError::Registry(RegistryError::DuplicateKey(key));
        assert_eq!(FailureKind::from_dispatch(&not_found), FailureKind::Transient);
        assert_eq!(FailureKind::from_dispatch(&duplicate), FailureKind::ProtocolFatal);
    }
}
