//! # Tic-Tac-Toe Session Client
//!
//! Async client for a server-authoritative two-player tic-tac-toe service.
//!
//! The crate covers the client-side session layer: authenticating a device,
//! holding one realtime connection, matchmaking, joining a match, keeping a
//! local copy of the authoritative [`GameState`] in sync, and gating move
//! submission on locally known turn ownership. The server remains the sole
//! judge of legality, turns, and outcomes.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] + [`Connector`] for any backend
//! - **WebSocket built-in**: default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **Exclusive routing**: one [`Subscription`] per [`MessageKind`], disposed synchronously
//! - **At-most-once change events**: each board cell is reported filled once per match
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tictactoe_session_client::{
//!     ClientConfig, DeviceId, MatchSession, Matchmaker, MatchmakerQuery, SessionClient,
//!     WebSocketConnector,
//! };
//!
//! let (mut client, _events) =
//!     SessionClient::new(WebSocketConnector::new(url), ClientConfig::new());
//! let credential = client.authenticate(&device_id).await?;
//! client.connect(&credential).await?;
//!
//! let matchmaker = Matchmaker::new(client.handle());
//! let resolution = matchmaker.find_match(&MatchmakerQuery::new()).await?;
//!
//! let mut session = MatchSession::new(client.handle());
//! if let Some(match_id) = resolution.match_id() {
//!     session.join(match_id, |state: &GameState, changes: &ChangeSet| {
//!         render(state, changes);
//!     }).await?;
//! }
//! ```

pub mod client;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod game;
pub mod match_session;
pub mod matchmaker;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{ClientConfig, ConnectionState, SessionClient, SessionHandle};
pub use error::{GameClientError, Result};
pub use error_codes::ErrorCode;
pub use event::SessionEvent;
pub use game::{Board, Cell, GameState, Mark, OpCode, Outcome, BOARD_CELLS};
pub use match_session::{ChangeListener, MatchSession, MatchTracker, MoveOutcome, MoveRejection};
pub use matchmaker::{MatchResolution, Matchmaker, MatchmakerQuery, MatchmakerStatus};
pub use protocol::{ClientMessage, Credential, DeviceId, MessageKind, ServerMessage};
pub use reconcile::{diff, ChangeSet, FiredCells};
pub use router::Subscription;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
