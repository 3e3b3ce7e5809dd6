//! Connection lifecycle events emitted by [`SessionClient`](crate::client::SessionClient).

use crate::error_codes::ErrorCode;
use crate::protocol::UserId;

/// Events delivered on the receiver returned by
/// [`SessionClient::new`](crate::client::SessionClient::new).
///
/// The same receiver survives reconnects: every successful `connect` emits
/// `Connected`, and every connection that goes away emits exactly one
/// `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The realtime session was accepted by the server.
    Connected { user_id: UserId },
    /// The connection ended. `reason` is `None` for a clean close by the server.
    Disconnected { reason: Option<String> },
    /// The server reported an error that no subscriber claimed.
    ServerError {
        message: String,
        error_code: Option<ErrorCode>,
    },
}
