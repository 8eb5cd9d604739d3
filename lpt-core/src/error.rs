//! Session-level errors and teardown reasons.

use crate::address::CorrelationError;
use crate::channel::ChannelError;
use crate::identity::PeerId;
use crate::session::SessionState;

/// Errors surfaced synchronously to façade callers. Never retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session")]
    InvalidSession,
    #[error("session is closing")]
    SessionClosing,
    #[error("connection limit reached")]
    Overloaded,
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("malformed correlation: {0}")]
    MalformedCorrelation(#[from] CorrelationError),
    #[error("duplicate connection from {peer:?} with tag {tag}")]
    DuplicateConnection { peer: PeerId, tag: u32 },
    #[error("address has no usable network type")]
    UnclassifiedAddress,
    #[error("accepting side cannot initiate sessions")]
    CannotInitiate,
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Why a session ended. Reported to the upper layer and carried by failed completions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Explicit `disconnect_session` / `disconnect_peer`.
    Disconnect,
    /// Idle deadline fired.
    Timeout,
    /// Transport failure on one of the session's channels.
    Channel(ChannelError),
    /// Plugin shutdown.
    Shutdown,
}

/// Failure outcome of a queued transmission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    #[error("session ended before the message was sent ({0:?})")]
    SessionEnded(EndReason),
}
