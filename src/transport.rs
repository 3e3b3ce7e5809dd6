//! Transport abstraction for the session protocol.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the game server. Every message is one JSON frame, so each
//! implementation handles framing internally (WebSocket frames, length-prefixed
//! TCP, in-process channels for tests).
//!
//! A [`Connector`] opens fresh transports. The session client holds one so it
//! can authenticate, connect, and reconnect without knowing the wire library.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tictactoe_session_client::error::GameClientError;
//! use tictactoe_session_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), GameClientError> {
//!         // Send the JSON text message over your transport
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, GameClientError>> {
//!         // Receive the next JSON text message
//!         // Return None when the connection is closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), GameClientError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::GameClientError;

/// A bidirectional text message transport.
///
/// # Object Safety
///
/// This trait is object-safe, so `Box<dyn Transport>` works for dynamic dispatch.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the session loop
/// polls it inside `tokio::select!`. Channel-based implementations (e.g.
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), GameClientError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, GameClientError>>;

    /// Close the transport connection gracefully.
    ///
    /// Implementations should release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), GameClientError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), GameClientError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, GameClientError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), GameClientError> {
        (**self).close().await
    }
}

/// Opens new [`Transport`]s to the game server.
///
/// Called once per authentication or connection attempt; a reconnect asks for
/// a brand-new transport rather than reviving a dead one.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The transport produced by this connector.
    type Transport: Transport;

    /// Open a new duplex channel to the server.
    ///
    /// # Errors
    ///
    /// Any error here is reported to the caller as a connection or
    /// authentication failure, depending on which step needed the transport.
    async fn connect(&self) -> Result<Self::Transport, GameClientError>;
}
