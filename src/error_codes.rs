//! Structured error codes reported by the game server.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"MATCH_NOT_FOUND"`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the game server.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    Unauthorized,
    InvalidToken,
    InvalidDeviceId,
    AccountDisabled,

    // Request errors
    BadInput,
    MessageTooLarge,

    // Matchmaking errors
    TicketNotFound,
    TooManyTickets,

    // Match errors
    MatchNotFound,
    MatchFull,
    MatchJoinRejected,
    NotInMatch,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    RuntimeException,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => {
                "Access denied. Authentication credentials are missing or invalid."
            }
            Self::InvalidToken => {
                "The session token is invalid or has expired. Authenticate again to obtain a new one."
            }
            Self::InvalidDeviceId => {
                "The device identifier was rejected. It must be a non-empty, stable identifier."
            }
            Self::AccountDisabled => "The account linked to this device has been disabled.",

            Self::BadInput => "The request was malformed. Check the message parameters.",
            Self::MessageTooLarge => "The message exceeds the maximum allowed size.",

            Self::TicketNotFound => {
                "The matchmaking ticket does not exist. It may already have been matched or removed."
            }
            Self::TooManyTickets => {
                "Too many matchmaking tickets are outstanding for this session."
            }

            Self::MatchNotFound => {
                "The match could not be found. It may have ended before you joined."
            }
            Self::MatchFull => "The match already has two players.",
            Self::MatchJoinRejected => "The server refused to let you join this match.",
            Self::NotInMatch => "You are not part of this match.",

            Self::RateLimitExceeded => {
                "Too many requests in a short time. Please slow down and try again later."
            }

            Self::RuntimeException => {
                "The match handler on the server raised an error while processing the request."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
