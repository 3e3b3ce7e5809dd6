//! # Quick Match Example
//!
//! Plays one full match against whoever the matchmaker finds:
//!
//! 1. Authenticate a device and open the realtime session over WebSocket
//! 2. Ask the matchmaker for an opponent (Ctrl+C withdraws the ticket)
//! 3. Join the match and print every state change
//! 4. Play the first free cell whenever it is our turn
//! 5. Leave and disconnect once the game is over
//!
//! ## Running
//!
//! ```sh
//! # Start the game server on localhost:7350, then:
//! cargo run --example quick_match
//!
//! # Override the server URL or reuse a device id across runs:
//! TICTACTOE_SERVER_URL=ws://my-server:7350/ws \
//! TICTACTOE_DEVICE_ID=6f1c9a52-3c1e-4f7a-9b55-0d2a7f3e8c11 \
//!     cargo run --example quick_match
//! ```

use std::time::Duration;

use tictactoe_session_client::{
    ChangeSet, ClientConfig, DeviceId, GameState, MatchResolution, MatchSession, Matchmaker,
    MatchmakerQuery, SessionClient, SessionEvent, WebSocketConnector, BOARD_CELLS,
};

/// Default server URL when `TICTACTOE_SERVER_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:7350/ws";

fn render(state: &GameState, changes: &ChangeSet) {
    for position in &changes.newly_filled {
        if let Some(mark) = state.board.get(*position).and_then(|c| c.mark()) {
            tracing::info!("{mark} took cell {position}");
        }
    }
    if changes.turn_changed && !state.game_over {
        tracing::info!("{} to move", state.current_turn);
    }
    if changes.became_game_over {
        match state.winner {
            Some(winner) => tracing::info!("game over, {winner} wins"),
            None => tracing::info!("game over, draw"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("TICTACTOE_SERVER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let device_id = match std::env::var("TICTACTOE_DEVICE_ID") {
        Ok(raw) => raw.parse::<DeviceId>()?,
        Err(_) => DeviceId::generate(),
    };
    tracing::info!("Connecting to {url} as device {device_id}");

    let connector = WebSocketConnector::new(url).with_timeout(Duration::from_secs(5));
    let config = ClientConfig::new().with_request_timeout(Duration::from_secs(5));
    let (mut client, mut events) = SessionClient::new(connector, config);

    // Log lifecycle events in the background.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected { user_id } => tracing::info!("Connected as {user_id}"),
                SessionEvent::Disconnected { reason } => {
                    let reason = reason.as_deref().unwrap_or("server closed");
                    tracing::warn!("Disconnected: {reason}");
                }
                SessionEvent::ServerError {
                    message,
                    error_code,
                } => tracing::error!("Server error [{error_code:?}]: {message}"),
            }
        }
    });

    // ── Session ─────────────────────────────────────────────────────
    let credential = client.authenticate(&device_id).await?;
    client.connect(&credential).await?;

    // ── Matchmaking ─────────────────────────────────────────────────
    let matchmaker = Matchmaker::new(client.handle());
    tracing::info!("Looking for an opponent… (Ctrl+C to give up)");
    let query = MatchmakerQuery::new();
    let resolution = tokio::select! {
        resolution = matchmaker.find_match(&query) => resolution?,
        // Dropping the search withdraws the ticket.
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Matchmaking abandoned");
            client.disconnect().await;
            return Ok(());
        }
    };
    let MatchResolution::Matched { match_id, .. } = resolution else {
        tracing::info!("Matchmaking cancelled");
        client.disconnect().await;
        return Ok(());
    };

    // ── Match ───────────────────────────────────────────────────────
    let mut session = MatchSession::new(client.handle());
    session.join(&match_id, render).await?;
    tracing::info!("Joined match {match_id}");

    loop {
        tokio::select! {
            change = session.next_change() => {
                let Some(_) = change else {
                    tracing::warn!("Match stream ended");
                    break;
                };
                if session.outcome().is_some() {
                    break;
                }
                if let Some(position) = (0..BOARD_CELLS).find(|p| session.can_move(*p)) {
                    session.submit_move(position)?;
                    tracing::info!("Playing cell {position}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving match…");
                break;
            }
        }
    }

    if let (Some(outcome), Some(mark)) = (session.outcome(), session.local_mark()) {
        tracing::info!("Played as {mark}: {outcome:?}");
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    session.leave();
    client.disconnect().await;
    tracing::info!("Goodbye!");
    Ok(())
}
