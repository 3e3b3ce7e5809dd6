//! # Loopback Session Example
//!
//! Plays a complete match without a network. A [`Connector`] hands out
//! in-process channel transports, and every connection gets its own small
//! scripted server task that authenticates, matchmakes, hosts the match, and
//! answers each of our moves with the first free cell.
//!
//! This is the shape to copy when you want to exercise game logic against the
//! real client without running the game server, or adapt the client to some
//! other byte pipe (TCP, QUIC, WebRTC data channels).
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tictactoe_session_client::game::MovePayload;
use tictactoe_session_client::protocol::Presence;
use tictactoe_session_client::{
    Board, ChangeSet, ClientConfig, ClientMessage, Connector, DeviceId, GameClientError, GameState,
    Mark, MatchResolution, MatchSession, Matchmaker, MatchmakerQuery, OpCode, ServerMessage,
    SessionClient, Transport, BOARD_CELLS,
};

const PLAYER_ID: &str = "demo-player";
const BOT_ID: &str = "demo-bot";
const MATCH_ID: &str = "match-1";

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based transport and a connector for it
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process connection.
struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), GameClientError> {
        self.tx
            .send(message)
            .map_err(|e| GameClientError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `mpsc::UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, GameClientError>> {
        self.rx.recv().await.map(Ok)
    }

    /// Dropping the sender is enough to end the server task.
    async fn close(&mut self) -> Result<(), GameClientError> {
        Ok(())
    }
}

/// Spawns a fresh scripted server for every connection attempt.
struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, GameClientError> {
        // Client → Server
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        // Server → Client
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(scripted_server(server_rx, server_tx));
        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: The scripted server
// ─────────────────────────────────────────────────────────────────────

fn winner(board: &Board) -> Option<Mark> {
    LINES.iter().find_map(|line| {
        let [a, b, c] = line.map(|p| board.get(p).and_then(|cell| cell.mark()));
        match (a, b, c) {
            (Some(a), Some(b), Some(c)) if a == b && b == c => Some(a),
            _ => None,
        }
    })
}

/// Places `mark` and returns the op code describing the resulting state.
fn play(state: &mut GameState, position: usize, mark: Mark) -> OpCode {
    state.board = state.board.with_mark(position, mark);
    state.current_turn = mark.opponent();
    state.winner = winner(&state.board);
    state.game_over = state.winner.is_some() || state.board.is_full();
    if state.game_over {
        OpCode::GameOver
    } else {
        OpCode::Update
    }
}

fn state_frame(op: OpCode, state: &GameState) -> Result<ServerMessage, serde_json::Error> {
    Ok(ServerMessage::MatchData {
        match_id: MATCH_ID.into(),
        op_code: op.code(),
        data: serde_json::to_vec(state)?,
        presence: None,
    })
}

async fn scripted_server(
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut state = GameState {
        players: BTreeMap::from([(PLAYER_ID.to_owned(), Mark::X), (BOT_ID.to_owned(), Mark::O)]),
        ..GameState::initial()
    };

    let push = |msg: ServerMessage| match serde_json::to_string(&msg) {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(e) => tracing::error!("server failed to encode {msg:?}: {e}"),
    };

    while let Some(frame) = rx.recv().await {
        let msg: ClientMessage = match serde_json::from_str(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("server dropped an undecodable frame: {e}");
                continue;
            }
        };
        tracing::debug!("server ← {msg:?}");

        match msg {
            ClientMessage::Authenticate { .. } => push(ServerMessage::Authenticated {
                token: "loopback-token".into(),
                user_id: PLAYER_ID.into(),
                created: true,
            }),
            ClientMessage::SessionStart { .. } => push(ServerMessage::SessionAccepted {
                user_id: PLAYER_ID.into(),
            }),
            ClientMessage::MatchmakerAdd { .. } => {
                push(ServerMessage::MatchmakerTicket {
                    ticket: "ticket-1".into(),
                });
                push(ServerMessage::MatchmakerMatched {
                    ticket: "ticket-1".into(),
                    match_id: Some(MATCH_ID.into()),
                    users: vec![],
                });
            }
            ClientMessage::MatchJoin { match_id } => {
                push(ServerMessage::MatchJoined {
                    match_id,
                    presences: [PLAYER_ID, BOT_ID]
                        .into_iter()
                        .map(|id| Presence {
                            user_id: id.into(),
                            username: None,
                        })
                        .collect(),
                });
                if let Ok(frame) = state_frame(OpCode::PlayerJoin, &state) {
                    push(frame);
                }
            }
            ClientMessage::MatchDataSend { op_code, data, .. } => {
                if OpCode::from_code(op_code) != Some(OpCode::Move) || state.game_over {
                    continue;
                }
                let Ok(MovePayload { position }) = serde_json::from_slice(&data) else {
                    continue;
                };
                let position = usize::from(position);
                if state.current_turn != Mark::X || !state.board.is_empty_at(position) {
                    push(ServerMessage::Error {
                        message: format!("illegal move at {position}"),
                        error_code: None,
                    });
                    continue;
                }

                let mut op = play(&mut state, position, Mark::X);
                if op == OpCode::Update {
                    if let Some(reply) = (0..BOARD_CELLS).find(|p| state.board.is_empty_at(*p)) {
                        op = play(&mut state, reply, Mark::O);
                    }
                }
                if let Ok(frame) = state_frame(op, &state) {
                    push(frame);
                }
            }
            ClientMessage::Ping => push(ServerMessage::Pong),
            ClientMessage::MatchmakerRemove { .. } | ClientMessage::MatchLeave { .. } => {}
        }
    }
    tracing::debug!("server connection closed");
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Play through the client
// ─────────────────────────────────────────────────────────────────────

fn print_board(state: &GameState, changes: &ChangeSet) {
    if changes.newly_filled.is_empty() {
        return;
    }
    for row in state.board.cells().chunks(3) {
        let line: String = row
            .iter()
            .map(|cell| cell.mark().map_or('.', |m| if m == Mark::X { 'X' } else { 'O' }))
            .collect();
        tracing::info!("  {line}");
    }
}

/// Centre first, then corners, then whatever is left.
fn choose(session: &MatchSession) -> Option<usize> {
    [4, 0, 2, 6, 8, 1, 3, 5, 7]
        .into_iter()
        .find(|p| session.can_move(*p))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (mut client, _events) = SessionClient::new(LoopbackConnector, ClientConfig::default());

    // ── Session ─────────────────────────────────────────────────────
    let credential = client.authenticate(&DeviceId::generate()).await?;
    client.connect(&credential).await?;
    tracing::info!("Connected as {}", credential.user_id());

    // ── Matchmaking ─────────────────────────────────────────────────
    let matchmaker = Matchmaker::new(client.handle());
    let MatchResolution::Matched { match_id, .. } =
        matchmaker.find_match(&MatchmakerQuery::new()).await?
    else {
        return Err("matchmaking was cancelled".into());
    };

    // ── Match ───────────────────────────────────────────────────────
    let mut session = MatchSession::new(client.handle());
    session.join(&match_id, print_board).await?;
    tracing::info!("Joined {match_id} as {:?}", session.local_mark());

    while session.next_change().await.is_some() {
        if session.outcome().is_some() {
            break;
        }
        if let Some(position) = choose(&session) {
            tracing::info!("Playing cell {position}");
            session.submit_move(position)?;
        }
    }
    tracing::info!("Result: {:?}", session.outcome());

    // ── Cleanup ─────────────────────────────────────────────────────
    session.leave();
    client.disconnect().await;
    Ok(())
}
