use std::io;
use std::path::PathBuf;

use bytes::BytesMut;
use thiserror::Error;

use crate::option_set::ActionFlags;

/// Listener-scope errors.
///
/// These are fatal for the listener they occur on and are returned from
/// [`Client::run`](crate::client::Client::run). Per-connection problems
/// never surface here, see [`ProtocolError`].
#[derive(Debug, Error)]
pub enum Error {
    /// The connection spec string did not match the
    /// `inet:`/`inet6:`/`unix:` grammar.
    #[error("invalid connection spec {spec:?}: {reason}")]
    BadSpec { spec: String, reason: String },

    /// No connection spec was configured before `run()`.
    #[error("no connection spec configured")]
    MissingSpec,

    #[error("failed to bind {spec}: {source}")]
    BindFailed { spec: String, source: io::Error },

    #[error("failed to listen on {spec}: {source}")]
    ListenFailed { spec: String, source: io::Error },

    #[error("failed to accept a connection: {source}")]
    AcceptFailed { source: io::Error },

    /// Mode, group or unlink handling of the UNIX socket path failed.
    #[error("UNIX socket {path:?}: {reason}")]
    UnixSocket { path: PathBuf, reason: String },
}

/// Connection-scope errors.
///
/// Raised while decoding packets or driving the state machine of a single
/// connection. The connection answers with tempfail where its state still
/// allows a reply and is closed; the listener keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix announced a frame larger than the configured cap.
    #[error("frame of {size} bytes exceeds the {limit} byte cap")]
    OversizeFrame { size: usize, limit: usize },

    /// The tag byte is not a known packet for this direction.
    #[error("unknown {direction} tag {tag:?}")]
    UnknownTag { tag: char, direction: Direction },

    /// Field parsing ran past the payload or a required NUL was missing.
    #[error("malformed {tag:?} payload: {reason}")]
    MalformedPayload { tag: char, reason: String },

    /// A command arrived in a state that does not accept it.
    #[error("command {command:?} not acceptable in state {state}")]
    UnexpectedCommand { command: char, state: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(tag: u8, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedPayload {
            tag: char::from(tag),
            reason: reason.into(),
        }
    }

    pub(crate) fn short_payload(tag: u8, needed: usize, got: &BytesMut) -> Self {
        ProtocolError::MalformedPayload {
            tag: char::from(tag),
            reason: format!("need at least {} bytes, got {}", needed, got.len()),
        }
    }
}

/// Which side of the conversation a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// MTA to filter.
    Command,
    /// Filter to MTA.
    Reply,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Command => write!(f, "command"),
            Direction::Reply => write!(f, "reply"),
        }
    }
}

/// Errors returned to the embedder from modification and keep-alive calls
/// on the context. None of these write anything to the MTA.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The negotiated action mask does not contain the required bit.
    #[error("action {required:?} was not negotiated")]
    NotNegotiated { required: ActionFlags },

    /// Modification actions are only legal while handling end-of-message.
    #[error("modification actions are only valid at end-of-message")]
    OutsideEndOfMessage,

    /// Writing the action packet failed. The connection is unlikely to
    /// survive; the stage reply will surface the same condition.
    #[error("failed to write action packet: {source}")]
    Write { source: io::Error },
}
