//! Built-in [`Transport`](crate::Transport) implementations.
//!
//! | Feature                | Transport              | Connector              |
//! |------------------------|------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] | [`WebSocketConnector`] |
//!
//! # Example
//!
//! ```rust,ignore
//! use tictactoe_session_client::{ClientConfig, SessionClient, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:7350/ws")
//!     .with_timeout(std::time::Duration::from_secs(5));
//! let (client, events) = SessionClient::new(connector, ClientConfig::new());
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
