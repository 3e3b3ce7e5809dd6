#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for joining, tracking, and leaving a match.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_test::assert_ok;

use tictactoe_session_client::protocol::{ClientMessage, ServerMessage};
use tictactoe_session_client::{
    ChangeSet, GameClientError, GameState, Mark, MatchSession, MessageKind, MoveOutcome,
    MoveRejection, OpCode, Outcome, SessionClient,
};

use common::{
    board, connected_client, connected_client_with, finished, joined, state, state_message,
    test_config, LoopbackConnector, LoopbackServer,
};

const MATCH: &str = "match-1";

type Seen = Arc<Mutex<Vec<ChangeSet>>>;

fn recorder() -> (Seen, impl FnMut(&GameState, &ChangeSet) + Send + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |_: &GameState, changes: &ChangeSet| {
        sink.lock().unwrap().push(changes.clone())
    })
}

/// Joins `MATCH`, answering the join request from the server side.
async fn join(session: &mut MatchSession, server: &mut LoopbackServer) -> Seen {
    let (seen, listener) = recorder();
    let (result, ()) = tokio::join!(session.join(MATCH, listener), async {
        assert!(matches!(
            server.recv_client().await,
            ClientMessage::MatchJoin { match_id } if match_id == MATCH
        ));
        server.push(&joined(MATCH));
    });
    assert_ok!(result);
    seen
}

// ════════════════════════════════════════════════════════════════════
// Join
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_is_idempotent_for_the_same_match() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    assert_ok!(session.join(MATCH, |_: &GameState, _: &ChangeSet| {}).await);
    server.assert_quiet(&client.handle()).await;

    assert_eq!(session.match_id(), Some(MATCH));
    assert_eq!(session.presences().len(), 2);
}

#[tokio::test]
async fn joining_a_second_match_is_rejected() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    let err = session
        .join("match-2", |_: &GameState, _: &ChangeSet| {})
        .await
        .unwrap_err();

    assert!(matches!(err, GameClientError::AlreadyJoined { active } if active == MATCH));
    assert_eq!(session.match_id(), Some(MATCH));
}

#[tokio::test]
async fn refused_join_is_join_failure() {
    let (client, _events, mut server) = connected_client().await;
    let handle = client.handle();
    let mut session = MatchSession::new(handle.clone());

    let (result, ()) = tokio::join!(session.join(MATCH, |_: &GameState, _: &ChangeSet| {}), async {
        let _ = server.recv_client().await;
        server.push(&ServerMessage::MatchJoinFailed {
            match_id: MATCH.into(),
            reason: "match not found".into(),
            error_code: None,
        });
    });

    assert!(matches!(
        result,
        Err(GameClientError::JoinFailure { reason, .. }) if reason == "match not found"
    ));
    assert!(!session.is_joined());
    assert!(!handle.is_subscribed(MessageKind::MatchData));
}

#[tokio::test]
async fn join_without_connection_is_join_failure() {
    let (connector, _servers) = LoopbackConnector::with_servers(0);
    let (client, _events) = SessionClient::new(connector, test_config());
    let mut session = MatchSession::new(client.handle());

    let err = session
        .join(MATCH, |_: &GameState, _: &ChangeSet| {})
        .await
        .unwrap_err();
    assert!(matches!(err, GameClientError::JoinFailure { .. }));
}

#[tokio::test]
async fn unanswered_join_times_out_and_leaves() {
    let config = test_config().with_request_timeout(Duration::from_millis(50));
    let (client, _events, mut server) = connected_client_with(config).await;
    let mut session = MatchSession::new(client.handle());

    let err = session
        .join(MATCH, |_: &GameState, _: &ChangeSet| {})
        .await
        .unwrap_err();

    assert!(matches!(err, GameClientError::JoinFailure { .. }));
    assert!(matches!(server.recv_client().await, ClientMessage::MatchJoin { .. }));
    assert!(matches!(server.recv_client().await, ClientMessage::MatchLeave { .. }));
}

#[tokio::test]
async fn opening_state_sent_with_the_ack_is_not_lost() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    let (seen, listener) = recorder();

    let (result, ()) = tokio::join!(session.join(MATCH, listener), async {
        let _ = server.recv_client().await;
        server.push(&joined(MATCH));
        server.push(&state_message(
            MATCH,
            OpCode::PlayerJoin,
            &state(Mark::X, board(&[]), Mark::X),
        ));
    });
    assert_ok!(result);

    let changes = session.next_change().await.unwrap();
    assert!(changes.turn_changed);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(session.local_mark(), Some(Mark::X));
    assert!(session.is_my_turn());
}

// ════════════════════════════════════════════════════════════════════
// State tracking
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn each_cell_fires_once_despite_retransmission() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    let seen = join(&mut session, &mut server).await;

    let s0 = state(Mark::O, board(&[]), Mark::X);
    let s1 = state(Mark::O, board(&[(4, Mark::X)]), Mark::O);
    let s2 = state(Mark::O, board(&[(4, Mark::X), (0, Mark::O)]), Mark::X);
    for s in [&s0, &s1, &s1, &s2, &s2] {
        server.push(&state_message(MATCH, OpCode::Update, s));
    }
    for _ in 0..5 {
        session.next_change().await.unwrap();
    }

    let seen = seen.lock().unwrap();
    let fills: Vec<BTreeSet<usize>> = seen.iter().map(|c| c.newly_filled.clone()).collect();
    assert_eq!(
        fills,
        vec![
            BTreeSet::new(),
            BTreeSet::from([4]),
            BTreeSet::new(),
            BTreeSet::from([0]),
            BTreeSet::new(),
        ]
    );
    assert!(seen[1].turn_changed);
    assert!(!seen[2].turn_changed);
}

#[tokio::test]
async fn terminal_state_reported_once() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    let playing = state(Mark::X, board(&[(0, Mark::X), (1, Mark::X)]), Mark::O);
    let won = finished(
        Mark::X,
        board(&[(0, Mark::X), (1, Mark::X), (2, Mark::X)]),
        Some(Mark::X),
    );
    server.push(&state_message(MATCH, OpCode::Update, &playing));
    server.push(&state_message(MATCH, OpCode::GameOver, &won));
    server.push(&state_message(MATCH, OpCode::GameOver, &won));

    assert!(!session.next_change().await.unwrap().became_game_over);
    assert!(session.next_change().await.unwrap().became_game_over);
    assert!(!session.next_change().await.unwrap().became_game_over);
    assert_eq!(session.outcome(), Some(Outcome::Won));
}

#[tokio::test]
async fn malformed_and_foreign_data_is_skipped() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    let seen = join(&mut session, &mut server).await;

    let good = state(Mark::X, board(&[(8, Mark::O)]), Mark::X);
    server.push(&ServerMessage::MatchData {
        match_id: MATCH.into(),
        op_code: OpCode::Update.code(),
        data: b"{\"board\":[]}".to_vec(),
        presence: None,
    });
    server.push(&state_message("other-match", OpCode::Update, &good));
    server.push(&ServerMessage::MatchData {
        match_id: MATCH.into(),
        op_code: 99,
        data: vec![],
        presence: None,
    });
    server.push(&state_message(MATCH, OpCode::Update, &good));

    let changes = session.next_change().await.unwrap();
    assert_eq!(changes.newly_filled, BTreeSet::from([8]));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(session.state(), Some(&good));
}

#[tokio::test]
async fn connection_loss_ends_the_stream() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    server.hang_up();

    assert!(session.next_change().await.is_none());
    assert!(!session.is_joined());
    assert_eq!(
        session.submit_move(0).unwrap(),
        MoveOutcome::Rejected(MoveRejection::NotJoined)
    );
}

#[tokio::test]
async fn same_match_is_joined_again_after_reconnect() {
    let (connector, mut servers) = LoopbackConnector::with_servers(2);
    let mut second = servers.pop().unwrap();
    let mut first = servers.pop().unwrap();
    for server in [&first, &second] {
        server.push(&ServerMessage::SessionAccepted {
            user_id: common::ME.into(),
        });
    }
    let (mut client, _events) = SessionClient::new(connector, test_config());
    assert_ok!(client.connect(&common::credential()).await);
    assert!(matches!(first.recv_client().await, ClientMessage::SessionStart { .. }));

    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut first).await;
    first.hang_up();
    assert!(session.next_change().await.is_none());

    assert_ok!(client.reconnect().await);
    assert!(matches!(second.recv_client().await, ClientMessage::SessionStart { .. }));

    // The helper fails unless a fresh MatchJoin reaches the new server.
    let seen = join(&mut session, &mut second).await;
    assert!(session.is_joined());

    let s = state(Mark::X, board(&[(2, Mark::O)]), Mark::X);
    second.push(&state_message(MATCH, OpCode::Update, &s));
    let changes = session.next_change().await.unwrap();
    assert_eq!(changes.newly_filled, BTreeSet::from([2]));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ════════════════════════════════════════════════════════════════════
// One match per connection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_session_cannot_join_while_one_is_active() {
    let (client, _events, mut server) = connected_client().await;
    let mut first = MatchSession::new(client.handle());
    join(&mut first, &mut server).await;

    let mut second = MatchSession::new(client.handle());
    for id in [MATCH, "match-2"] {
        let err = second
            .join(id, |_: &GameState, _: &ChangeSet| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GameClientError::AlreadyJoined { active } if active == MATCH));
    }
    server.assert_quiet(&client.handle()).await;
    assert!(!second.is_joined());

    // The first session still owns the match stream.
    assert!(first.is_joined());
    let s = state(Mark::X, board(&[(0, Mark::O)]), Mark::X);
    server.push(&state_message(MATCH, OpCode::Update, &s));
    let changes = first.next_change().await.unwrap();
    assert_eq!(changes.newly_filled, BTreeSet::from([0]));
}

#[tokio::test]
async fn another_session_may_join_after_leave() {
    let (client, _events, mut server) = connected_client().await;
    let mut first = MatchSession::new(client.handle());
    join(&mut first, &mut server).await;
    first.leave();
    assert!(matches!(server.recv_client().await, ClientMessage::MatchLeave { .. }));

    let mut second = MatchSession::new(client.handle());
    join(&mut second, &mut server).await;
    assert!(second.is_joined());
    assert!(!first.is_joined());
}

// ════════════════════════════════════════════════════════════════════
// Moves
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn move_out_of_turn_sends_nothing() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    server.push(&state_message(
        MATCH,
        OpCode::PlayerJoin,
        &state(Mark::O, board(&[]), Mark::X),
    ));
    session.next_change().await.unwrap();

    assert_eq!(
        session.submit_move(0).unwrap(),
        MoveOutcome::Rejected(MoveRejection::NotYourTurn)
    );
    assert!(!session.can_move(0));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn move_before_any_state_or_join_is_rejected() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    assert_eq!(
        session.submit_move(4).unwrap(),
        MoveOutcome::Rejected(MoveRejection::NotJoined)
    );

    join(&mut session, &mut server).await;
    assert_eq!(
        session.submit_move(4).unwrap(),
        MoveOutcome::Rejected(MoveRejection::NoState)
    );
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn occupied_and_finished_boards_refuse_moves() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    server.push(&state_message(
        MATCH,
        OpCode::Update,
        &state(Mark::X, board(&[(4, Mark::O)]), Mark::X),
    ));
    session.next_change().await.unwrap();
    assert_eq!(
        session.submit_move(4).unwrap(),
        MoveOutcome::Rejected(MoveRejection::CellOccupied)
    );
    assert_eq!(
        session.submit_move(9).unwrap(),
        MoveOutcome::Rejected(MoveRejection::OutOfRange)
    );

    server.push(&state_message(
        MATCH,
        OpCode::GameOver,
        &finished(Mark::X, board(&[(4, Mark::O)]), None),
    ));
    session.next_change().await.unwrap();
    assert_eq!(
        session.submit_move(0).unwrap(),
        MoveOutcome::Rejected(MoveRejection::GameOver)
    );
    assert_eq!(session.outcome(), Some(Outcome::Draw));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn admitted_move_is_sent_but_not_applied() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    server.push(&state_message(
        MATCH,
        OpCode::Update,
        &state(Mark::O, board(&[(0, Mark::X)]), Mark::O),
    ));
    session.next_change().await.unwrap();

    assert!(session.can_move(4));
    assert_eq!(session.submit_move(4).unwrap(), MoveOutcome::Sent);

    match server.recv_client().await {
        ClientMessage::MatchDataSend {
            match_id,
            op_code,
            data,
        } => {
            assert_eq!(match_id, MATCH);
            assert_eq!(op_code, OpCode::Move.code());
            let payload: serde_json::Value = serde_json::from_slice(&data).unwrap();
            assert_eq!(payload, serde_json::json!({ "position": 4 }));
        }
        other => panic!("expected MatchDataSend, got {other:?}"),
    }

    // Still our turn and still empty until the server says otherwise.
    let local = session.state().unwrap();
    assert!(local.board.is_empty_at(4));
    assert!(session.is_my_turn());
}

// ════════════════════════════════════════════════════════════════════
// Leave
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leave_twice_sends_one_leave() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    session.leave();
    session.leave();

    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchLeave { match_id } if match_id == MATCH
    ));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn nothing_reaches_the_listener_after_leave() {
    let (client, _events, mut server) = connected_client().await;
    let handle = client.handle();
    let mut session = MatchSession::new(handle.clone());
    let seen = join(&mut session, &mut server).await;

    session.leave();
    assert!(!handle.is_subscribed(MessageKind::MatchData));

    server.push(&state_message(
        MATCH,
        OpCode::Update,
        &state(Mark::X, board(&[(2, Mark::O)]), Mark::X),
    ));
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchLeave { .. }
    ));
    tokio::task::yield_now().await;

    assert!(session.next_change().await.is_none());
    assert!(seen.lock().unwrap().is_empty());
    assert!(session.state().is_none());
    assert!(!session.is_joined());
}

#[tokio::test]
async fn rejoin_after_leave_starts_fresh() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    let s = state(Mark::X, board(&[(4, Mark::O)]), Mark::X);
    server.push(&state_message(MATCH, OpCode::Update, &s));
    session.next_change().await.unwrap();
    session.leave();
    let _ = server.recv_client().await; // MatchLeave

    join(&mut session, &mut server).await;
    server.push(&state_message(MATCH, OpCode::Update, &s));
    let changes = session.next_change().await.unwrap();
    assert_eq!(changes.newly_filled, BTreeSet::from([4]));
}

#[tokio::test]
async fn dropping_the_session_leaves() {
    let (client, _events, mut server) = connected_client().await;
    let mut session = MatchSession::new(client.handle());
    join(&mut session, &mut server).await;

    drop(session);

    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchLeave { .. }
    ));
}
