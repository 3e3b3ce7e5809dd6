//! Error types for the tic-tac-toe session client.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::protocol::{MatchId, Ticket};

/// Errors that can occur when using the session client.
///
/// Authentication, connection, and join failures end the current attempt and
/// are meant to be surfaced to the user. Decode failures on inbound match data
/// never reach the caller: they are logged and the message is dropped.
#[derive(Debug, Error)]
pub enum GameClientError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The device identity could not be exchanged for a session credential.
    #[error("authentication failed: {reason}")]
    AuthFailure {
        /// Why the exchange failed.
        reason: String,
        /// Structured error code, if provided by the server.
        error_code: Option<ErrorCode>,
    },

    /// The duplex channel could not be opened or the server refused the credential.
    #[error("connect failed: {reason}")]
    ConnectFailure {
        /// Why the connection attempt failed.
        reason: String,
        /// Structured error code, if provided by the server.
        error_code: Option<ErrorCode>,
    },

    /// Attempted an operation that requires an active connection, but the client is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Joining a match failed (match gone, rejected, or connection down).
    #[error("failed to join match {match_id}: {reason}")]
    JoinFailure {
        /// The match that could not be joined.
        match_id: MatchId,
        /// Why the join failed.
        reason: String,
    },

    /// A different match is already active on this session.
    #[error("already joined match {active}")]
    AlreadyJoined {
        /// The match that is currently active.
        active: MatchId,
    },

    /// An inbound payload could not be decoded.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// The connection was lost while a matchmaking ticket was pending.
    #[error("matchmaking interrupted by connection loss")]
    MatchmakingInterrupted,

    /// A matchmaking request is already outstanding on this connection.
    #[error("matchmaking already in progress")]
    MatchmakingPending {
        /// The outstanding ticket, if the server has issued it yet.
        ticket: Option<Ticket>,
    },

    /// The server returned an error message.
    #[error("server error: {message}")]
    ServerError {
        /// Human-readable error message from the server.
        message: String,
        /// Structured error code, if provided by the server.
        error_code: Option<ErrorCode>,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GameClientError {
    /// Shorthand for an [`AuthFailure`](Self::AuthFailure) without an error code.
    pub(crate) fn auth(reason: impl Into<String>) -> Self {
        Self::AuthFailure {
            reason: reason.into(),
            error_code: None,
        }
    }

    /// Shorthand for a [`ConnectFailure`](Self::ConnectFailure) without an error code.
    pub(crate) fn connect(reason: impl Into<String>) -> Self {
        Self::ConnectFailure {
            reason: reason.into(),
            error_code: None,
        }
    }

    /// Shorthand for a [`JoinFailure`](Self::JoinFailure).
    pub(crate) fn join(match_id: impl Into<MatchId>, reason: impl Into<String>) -> Self {
        Self::JoinFailure {
            match_id: match_id.into(),
            reason: reason.into(),
        }
    }
}

/// A specialized [`Result`] type for session client operations.
pub type Result<T> = std::result::Result<T, GameClientError>;
