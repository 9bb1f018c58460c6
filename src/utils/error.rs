//! Error types for the tuning client

use std::io;
use thiserror::Error;

use crate::binding::TunableType;
use crate::client::SessionState;

/// Top-level library error
#[derive(Error, Debug)]
pub enum TuningError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// Server answered with a NACK. The session stays usable; a NACK that
    /// answered the handshake surfaces as `ConnectionError::HandshakeRejected`
    /// instead.
    #[error("Rejected by server: {reason}")]
    Rejected { reason: String },

    /// The request-all reply covered fewer variables than are registered.
    /// Values that did arrive have been applied; the named bindings keep
    /// their prior values.
    #[error("Incomplete update: server omitted {missing:?}")]
    IncompleteUpdate { missing: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TuningError {
    /// Failures that move the session to the Failed state. Locally-detected
    /// type mismatches never take this path; they are raised before any I/O.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, TuningError::Connection(_) | TuningError::Protocol(_))
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed by server")]
    Closed,

    #[error("Socket error: {0}")]
    Socket(io::Error),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("Type mismatch for {variable}: expected {expected}, got {actual}")]
    TypeMismatch {
        variable: String,
        expected: TunableType,
        actual: TunableType,
    },

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },
}

/// Caller mistakes, reported synchronously without touching session state
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Variable {bundle}.{name} is already registered")]
    DuplicateVariable { bundle: String, name: String },

    #[error("Session is not active (state: {0})")]
    SessionNotActive(SessionState),

    #[error("Unknown session handle: {0}")]
    UnknownHandle(u32),

    #[error("Variable set is sealed once tuning activity has started")]
    BindingsSealed,

    #[error("Variable {0} is not registered in this session")]
    UnknownVariable(String),
}

pub type Result<T> = std::result::Result<T, TuningError>;
