//! Wire protocol types.
//!
//! Every frame is a JSON text message of the form
//! `{"type": "<Variant>", "data": { ... }}`. Match payloads travel as raw
//! bytes (`serde_bytes`), so the game-state JSON is nested inside them rather
//! than inlined into the envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_codes::ErrorCode;

// ── Type aliases ────────────────────────────────────────────────────

/// Server-assigned user identifier.
pub type UserId = String;

/// Identifier of a joined (or joinable) match.
pub type MatchId = String;

/// Handle of an outstanding matchmaking request.
pub type Ticket = String;

// ── Identity ────────────────────────────────────────────────────────

/// Stable per-installation device identifier exchanged for a [`Credential`].
///
/// The authentication store is expected to generate one once and persist it;
/// generating a fresh id on every launch creates a new account each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generates a new random device id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing identifier (e.g. one loaded from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session credential: an opaque token plus the user it belongs to.
///
/// Immutable while valid. The token is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    user_id: UserId,
}

impl Credential {
    pub fn new(token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

// ── Structs ─────────────────────────────────────────────────────────

/// A user present in a match or matched by the matchmaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Exchange a device id for a session token.
    Authenticate {
        device_id: DeviceId,
        /// Create the account if the device is unknown.
        create: bool,
    },
    /// Open the realtime session with a previously issued token. First message on a socket.
    SessionStart { token: String },
    /// Ask to be paired with opponents.
    MatchmakerAdd {
        query: String,
        min_count: u32,
        max_count: u32,
    },
    /// Withdraw a matchmaking ticket.
    MatchmakerRemove { ticket: Ticket },
    /// Join a match by id.
    MatchJoin { match_id: MatchId },
    /// Leave a match.
    MatchLeave { match_id: MatchId },
    /// Send an op-code tagged payload to the match handler.
    MatchDataSend {
        match_id: MatchId,
        op_code: i64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Message types sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Device authentication succeeded.
    Authenticated {
        token: String,
        user_id: UserId,
        /// `true` when the account was created by this request.
        #[serde(default)]
        created: bool,
    },
    /// Device authentication failed.
    AuthenticationError { error: String, error_code: ErrorCode },
    /// The realtime session is open.
    SessionAccepted { user_id: UserId },
    /// The session token was refused.
    SessionRejected {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Ticket issued for a matchmaking request.
    MatchmakerTicket { ticket: Ticket },
    /// The matchmaker paired this ticket.
    MatchmakerMatched {
        ticket: Ticket,
        /// Authoritative match to join. Absent when the server has not created one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_id: Option<MatchId>,
        #[serde(default)]
        users: Vec<Presence>,
    },
    /// Successfully joined a match.
    MatchJoined {
        match_id: MatchId,
        #[serde(default)]
        presences: Vec<Presence>,
    },
    /// Failed to join a match.
    MatchJoinFailed {
        match_id: MatchId,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Op-code tagged payload broadcast by the match handler.
    MatchData {
        match_id: MatchId,
        op_code: i64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<Presence>,
    },
    /// Users joined or left a match.
    MatchPresence {
        match_id: MatchId,
        #[serde(default)]
        joins: Vec<Presence>,
        #[serde(default)]
        leaves: Vec<Presence>,
    },
    /// Pong response to ping.
    Pong,
    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}

/// Routing predicate for inbound messages. Each [`ServerMessage`] has exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Authentication,
    Session,
    MatchmakerTicket,
    MatchmakerMatched,
    MatchJoin,
    MatchData,
    MatchPresence,
    Pong,
    Error,
}

impl ServerMessage {
    /// The routing kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Authenticated { .. } | Self::AuthenticationError { .. } => {
                MessageKind::Authentication
            }
            Self::SessionAccepted { .. } | Self::SessionRejected { .. } => MessageKind::Session,
            Self::MatchmakerTicket { .. } => MessageKind::MatchmakerTicket,
            Self::MatchmakerMatched { .. } => MessageKind::MatchmakerMatched,
            Self::MatchJoined { .. } | Self::MatchJoinFailed { .. } => MessageKind::MatchJoin,
            Self::MatchData { .. } => MessageKind::MatchData,
            Self::MatchPresence { .. } => MessageKind::MatchPresence,
            Self::Pong => MessageKind::Pong,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}
