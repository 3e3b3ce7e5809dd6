//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries one JSON frame per WebSocket text message.
//! [`WebSocketConnector`] opens a fresh one per authentication, connection, or
//! reconnect. Both `ws://` and `wss://` URLs are supported; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tictactoe_session_client::GameClientError> {
//! use tictactoe_session_client::{WebSocketTransport, Transport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:7350/ws").await?;
//! transport.send(r#"{"type":"Ping"}"#.to_string()).await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("server said: {frame}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::GameClientError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// Wraps a `tokio-tungstenite` [`WebSocketStream`](tokio_tungstenite::WebSocketStream)
/// and maps each protocol frame onto one WebSocket text message.
///
/// # Construction
///
/// Use [`WebSocketTransport::connect`] to establish a new connection:
///
/// ```rust,no_run
/// # async fn example() -> Result<(), tictactoe_session_client::GameClientError> {
/// use tictactoe_session_client::WebSocketTransport;
///
/// let transport = WebSocketTransport::connect("ws://localhost:7350/ws").await?;
/// # Ok(())
/// # }
/// ```
///
/// For advanced use-cases (custom TLS, proxy, headers) construct the stream
/// yourself and use [`WebSocketTransport::from_stream`].
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// Supports both `ws://` and `wss://` schemes. TLS is handled automatically
    /// by `tokio-tungstenite` via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::Io`] if the URL is invalid or the handshake
    /// fails. An underlying I/O error keeps its [`ErrorKind`](std::io::ErrorKind);
    /// protocol and URL errors become [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, GameClientError> {
        Self::open(url, None).await
    }

    /// Like [`connect`](Self::connect), bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::Timeout`] if the handshake has not finished
    /// when `timeout` elapses, or any error [`connect`](Self::connect) returns.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, GameClientError> {
        Self::open(url, Some(timeout)).await
    }

    /// Wrap a stream opened elsewhere (custom TLS, proxies, extra headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    async fn open(url: &str, deadline: Option<Duration>) -> Result<Self, GameClientError> {
        let started = Instant::now();
        let handshake = tokio_tungstenite::connect_async(url);
        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(url, ?limit, "WebSocket handshake timed out");
                    return Err(GameClientError::Timeout);
                }
            },
            None => handshake.await,
        };

        let (stream, response) = outcome.map_err(|e| {
            tracing::debug!(url, "WebSocket handshake failed: {e}");
            handshake_error(e)
        })?;
        tracing::info!(
            url,
            status = response.status().as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "WebSocket open"
        );
        Ok(Self::from_stream(stream))
    }
}

fn handshake_error(err: WsError) -> GameClientError {
    let kind = match &err {
        WsError::Io(io) => io.kind(),
        _ => io::ErrorKind::Other,
    };
    GameClientError::Io(io::Error::new(kind, err))
}

/// The peer or a previous `close` already ended the stream.
fn is_closed(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), GameClientError> {
        if self.closed {
            return Err(GameClientError::TransportClosed);
        }
        match self.stream.send(Message::text(message)).await {
            Ok(()) => Ok(()),
            Err(e) if is_closed(&e) => {
                self.closed = true;
                Err(GameClientError::TransportClosed)
            }
            Err(e) => Err(GameClientError::TransportSend(e.to_string())),
        }
    }

    async fn recv(&mut self) -> Option<Result<String, GameClientError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(GameClientError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(bytes) => {
                    tracing::warn!(len = bytes.len(), "skipping binary WebSocket frame");
                }
                Message::Frame(_) => {
                    tracing::debug!("skipping raw WebSocket frame");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), GameClientError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        match self.stream.close(None).await {
            Err(e) if !is_closed(&e) => Err(GameClientError::TransportSend(e.to_string())),
            _ => {
                tracing::debug!("WebSocket closed");
                Ok(())
            }
        }
    }
}

/// Opens a new [`WebSocketTransport`] to a fixed URL for every connection attempt.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tictactoe_session_client::{ClientConfig, SessionClient, WebSocketConnector};
///
/// let connector = WebSocketConnector::new("wss://game.example.com/ws")
///     .with_timeout(Duration::from_secs(5));
/// let (client, events) = SessionClient::new(connector, ClientConfig::new());
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    timeout: Option<Duration>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: None,
        }
    }

    /// Bound each connection attempt by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self) -> Result<WebSocketTransport, GameClientError> {
        WebSocketTransport::open(&self.url, self.timeout).await
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};
    use crate::DeviceId;

    use tokio::net::TcpListener;

    type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    fn frame(msg: &ServerMessage) -> Message {
        Message::Text(serde_json::to_string(msg).unwrap().into())
    }

    /// Serves one connection with `handler` and returns the URL to dial.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    /// Drains the socket until the client goes away.
    async fn drain(mut ws: ServerSocket) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    #[test]
    fn transport_is_send_and_debug() {
        fn assert_bounds<T: Send + std::fmt::Debug>() {}
        assert_bounds::<WebSocketTransport>();
        assert_bounds::<WebSocketConnector>();
    }

    #[tokio::test]
    async fn bad_urls_and_dead_hosts_are_io_errors() {
        for url in ["not-a-valid-url", "ws://127.0.0.1:1"] {
            let err = WebSocketTransport::connect(url).await.unwrap_err();
            assert!(matches!(err, GameClientError::Io(_)), "{url}: {err:?}");
        }
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // TEST-NET-1 is never routed.
        let result = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await;

        assert!(matches!(result.unwrap_err(), GameClientError::Timeout));
    }

    // ── Frames ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn handshake_frames_cross_verbatim() {
        let device = DeviceId::generate();
        let url = serve_once(move |mut ws| async move {
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected a text frame");
            };
            let msg: ClientMessage = serde_json::from_str(&text).unwrap();
            assert!(matches!(
                msg,
                ClientMessage::Authenticate { device_id, .. } if device_id == device
            ));
            ws.send(frame(&ServerMessage::Authenticated {
                token: "tok".into(),
                user_id: "u-1".into(),
                created: true,
            }))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let request = ClientMessage::Authenticate {
            device_id: device,
            create: true,
        };
        transport
            .send(serde_json::to_string(&request).unwrap())
            .await
            .unwrap();

        let reply: ServerMessage =
            serde_json::from_str(&transport.recv().await.unwrap().unwrap()).unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Authenticated { ref user_id, .. } if user_id == "u-1"
        ));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn frames_arrive_in_order_and_binary_is_skipped() {
        let url = serve_once(|mut ws| async move {
            ws.send(frame(&ServerMessage::Pong)).await.unwrap();
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(frame(&ServerMessage::SessionAccepted {
                user_id: "u-1".into(),
            }))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();

        let first = transport.recv().await.unwrap().unwrap();
        assert_eq!(first, r#"{"type":"Pong"}"#);
        let second = transport.recv().await.unwrap().unwrap();
        assert!(second.contains("SessionAccepted"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn wrapped_stream_behaves_like_connect() {
        let url = serve_once(|mut ws| async move {
            ws.send(frame(&ServerMessage::Pong)).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let mut transport = WebSocketTransport::from_stream(ws_stream);

        assert_eq!(transport.recv().await.unwrap().unwrap(), r#"{"type":"Pong"}"#);
    }

    // ── Close ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let url = serve_once(drain).await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport
            .send(r#"{"type":"Ping"}"#.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GameClientError::TransportClosed));
    }

    #[tokio::test]
    async fn send_after_peer_close_is_transport_closed() {
        let url = serve_once(|mut ws| async move {
            ws.close(None).await.unwrap();
            drain(ws).await;
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport.recv().await.is_none());

        let err = transport
            .send(r#"{"type":"Ping"}"#.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GameClientError::TransportClosed), "{err:?}");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn recv_after_close_does_not_hang() {
        let url = serve_once(drain).await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();

        if let Some(Ok(text)) = transport.recv().await {
            panic!("expected end of stream after close, got {text:?}");
        }
    }

    // ── Connector ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connector_opens_fresh_transports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                ws.send(frame(&ServerMessage::Pong)).await.unwrap();
                ws.close(None).await.unwrap();
            }
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"))
            .with_timeout(std::time::Duration::from_secs(2));
        for _ in 0..2 {
            let mut transport = connector.connect().await.unwrap();
            assert_eq!(transport.recv().await.unwrap().unwrap(), r#"{"type":"Pong"}"#);
        }
    }

    #[tokio::test]
    async fn connector_reports_unreachable_server() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        assert!(matches!(
            connector.connect().await.unwrap_err(),
            GameClientError::Io(_)
        ));
    }
}
