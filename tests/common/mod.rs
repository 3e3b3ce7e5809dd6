#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the session client integration tests.
//!
//! Provides an in-process loopback [`Transport`] whose far end,
//! [`LoopbackServer`], plays the game server: tests read what the client sent
//! and push server frames back. [`LoopbackConnector`] hands out one queued
//! transport per connection attempt.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tictactoe_session_client::protocol::{ClientMessage, Presence, ServerMessage};
use tictactoe_session_client::{
    Board, ClientConfig, Connector, Credential, GameClientError, GameState, Mark, OpCode,
    SessionClient, SessionEvent, SessionHandle, Transport,
};

/// User id of the local player in every test.
pub const ME: &str = "user-me";
/// User id of the remote opponent.
pub const THEM: &str = "user-them";

const RECV_DEADLINE: Duration = Duration::from_secs(2);

// ── Loopback transport ──────────────────────────────────────────────

/// Client half of the loopback.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), GameClientError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(GameClientError::TransportClosed);
        }
        self.tx
            .send(message)
            .map_err(|e| GameClientError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, GameClientError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), GameClientError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server half of the loopback: reads client frames, pushes server frames.
pub struct LoopbackServer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

/// Create a connected `(transport, server)` pair.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let transport = LoopbackTransport {
        tx: client_tx,
        rx: client_rx,
        closed: Arc::clone(&closed),
    };
    let server = LoopbackServer {
        rx: server_rx,
        tx: Some(server_tx),
        closed,
    };
    (transport, server)
}

impl LoopbackServer {
    /// Push a server message to the client.
    pub fn push(&self, msg: &ServerMessage) {
        self.push_raw(serde_json::to_string(msg).expect("serialize server message"));
    }

    /// Push an arbitrary text frame to the client.
    pub fn push_raw(&self, frame: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame.into());
        }
    }

    /// Next message the client sent. Panics if none arrives in time.
    pub async fn recv_client(&mut self) -> ClientMessage {
        let frame = tokio::time::timeout(RECV_DEADLINE, self.rx.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client side of the loopback is gone");
        serde_json::from_str(&frame).expect("client sent an undecodable frame")
    }

    /// Asserts the client has sent nothing else so far.
    ///
    /// Sends a ping through `handle` and requires it to be the next frame, so
    /// anything queued earlier would show up first.
    pub async fn assert_quiet(&mut self, handle: &SessionHandle) {
        handle.ping().expect("ping as a barrier");
        let next = self.recv_client().await;
        assert!(
            matches!(next, ClientMessage::Ping),
            "expected no further client messages, got {next:?}"
        );
    }

    /// Close the server side; the client's `recv` returns `None`.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Whether the client closed its transport.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Hands out pre-made loopback transports, one per `connect`.
#[derive(Default)]
pub struct LoopbackConnector {
    queue: StdMutex<VecDeque<LoopbackTransport>>,
}

impl LoopbackConnector {
    /// A connector with `count` transports queued, plus their server halves.
    pub fn with_servers(count: usize) -> (Self, Vec<LoopbackServer>) {
        let connector = Self::default();
        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            let (transport, server) = loopback_pair();
            connector.queue.lock().unwrap().push_back(transport);
            servers.push(server);
        }
        (connector, servers)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, GameClientError> {
        self.queue.lock().unwrap().pop_front().ok_or_else(|| {
            GameClientError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no loopback server left",
            ))
        })
    }
}

// ── Client setup ────────────────────────────────────────────────────

/// Short timeouts so failure paths finish quickly.
pub fn test_config() -> ClientConfig {
    ClientConfig::new()
        .with_request_timeout(Duration::from_millis(300))
        .with_shutdown_timeout(Duration::from_millis(200))
}

pub fn credential() -> Credential {
    Credential::new("token-me", ME)
}

/// A client connected as [`ME`] plus its event receiver and server half.
///
/// The `SessionStart` frame has already been consumed from the server.
pub async fn connected_client() -> (
    SessionClient<LoopbackConnector>,
    mpsc::Receiver<SessionEvent>,
    LoopbackServer,
) {
    connected_client_with(test_config()).await
}

pub async fn connected_client_with(
    config: ClientConfig,
) -> (
    SessionClient<LoopbackConnector>,
    mpsc::Receiver<SessionEvent>,
    LoopbackServer,
) {
    let (connector, mut servers) = LoopbackConnector::with_servers(1);
    let mut server = servers.pop().unwrap();
    let (mut client, events) = SessionClient::new(connector, config);

    server.push(&ServerMessage::SessionAccepted {
        user_id: ME.into(),
    });
    client.connect(&credential()).await.unwrap();

    let start = server.recv_client().await;
    assert!(matches!(start, ClientMessage::SessionStart { .. }));
    (client, events, server)
}

// ── Game state builders ─────────────────────────────────────────────

/// A board with the given marks placed.
pub fn board(marks: &[(usize, Mark)]) -> Board {
    marks
        .iter()
        .fold(Board::new(), |board, &(position, mark)| board.with_mark(position, mark))
}

/// An in-progress state where the local player holds `my_mark`.
pub fn state(my_mark: Mark, board: Board, turn: Mark) -> GameState {
    GameState {
        board,
        current_turn: turn,
        winner: None,
        game_over: false,
        players: BTreeMap::from([(ME.to_owned(), my_mark), (THEM.to_owned(), my_mark.opponent())]),
    }
}

/// A terminal state won by `winner` (or drawn when `None`).
pub fn finished(my_mark: Mark, board: Board, winner: Option<Mark>) -> GameState {
    GameState {
        winner,
        game_over: true,
        ..state(my_mark, board, Mark::X)
    }
}

/// `MatchData` carrying `state` as its payload.
pub fn state_message(match_id: &str, op: OpCode, state: &GameState) -> ServerMessage {
    ServerMessage::MatchData {
        match_id: match_id.into(),
        op_code: op.code(),
        data: serde_json::to_vec(state).unwrap(),
        presence: None,
    }
}

pub fn joined(match_id: &str) -> ServerMessage {
    ServerMessage::MatchJoined {
        match_id: match_id.into(),
        presences: vec![
            Presence {
                user_id: ME.into(),
                username: None,
            },
            Presence {
                user_id: THEM.into(),
                username: Some("opponent".into()),
            },
        ],
    }
}
