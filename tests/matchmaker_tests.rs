#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for the matchmaking ticket lifecycle.

mod common;

use std::time::Duration;

use tokio_test::assert_ok;

use tictactoe_session_client::protocol::{ClientMessage, Presence, ServerMessage};
use tictactoe_session_client::{
    GameClientError, MatchResolution, Matchmaker, MatchmakerQuery, MatchmakerStatus, MessageKind,
};

use common::{connected_client, connected_client_with, test_config, LoopbackServer, ME, THEM};

fn ticket(ticket: &str) -> ServerMessage {
    ServerMessage::MatchmakerTicket {
        ticket: ticket.into(),
    }
}

fn matched(ticket: &str, match_id: Option<&str>) -> ServerMessage {
    ServerMessage::MatchmakerMatched {
        ticket: ticket.into(),
        match_id: match_id.map(Into::into),
        users: vec![
            Presence {
                user_id: ME.into(),
                username: None,
            },
            Presence {
                user_id: THEM.into(),
                username: None,
            },
        ],
    }
}

/// Reads the `MatchmakerAdd` and answers with `ticket_id`.
async fn issue_ticket(server: &mut LoopbackServer, ticket_id: &str) {
    match server.recv_client().await {
        ClientMessage::MatchmakerAdd {
            query,
            min_count,
            max_count,
        } => {
            assert_eq!(query, "*");
            assert_eq!((min_count, max_count), (2, 2));
        }
        other => panic!("expected MatchmakerAdd, got {other:?}"),
    }
    server.push(&ticket(ticket_id));
}

async fn until_pending(matchmaker: &Matchmaker) {
    while matchmaker.pending_ticket().is_none() {
        tokio::task::yield_now().await;
    }
}

// ════════════════════════════════════════════════════════════════════
// Resolution
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn resolves_to_match_id() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        server.push(&matched("t-1", Some("m-1")));
    });

    assert_eq!(
        resolution.unwrap(),
        MatchResolution::Matched {
            ticket: "t-1".into(),
            match_id: "m-1".into()
        }
    );
    assert_eq!(
        matchmaker.status(),
        MatchmakerStatus::Matched {
            ticket: "t-1".into(),
            match_id: "m-1".into()
        }
    );
    assert!(!client.handle().is_subscribed(MessageKind::MatchmakerMatched));
}

#[tokio::test]
async fn foreign_tickets_and_missing_match_ids_keep_waiting() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        server.push(&matched("someone-else", Some("m-x")));
        server.push(&matched("t-1", None));
        server.push(&matched("t-1", Some("m-2")));
    });

    assert_eq!(resolution.unwrap().match_id(), Some("m-2"));
}

#[tokio::test]
async fn another_search_may_start_after_a_match() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    for (t, m) in [("t-1", "m-1"), ("t-2", "m-2")] {
        let query = MatchmakerQuery::new();
        let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
            issue_ticket(&mut server, t).await;
            server.push(&matched(t, Some(m)));
        });
        assert_eq!(resolution.unwrap().match_id(), Some(m));
    }
}

// ════════════════════════════════════════════════════════════════════
// Single outstanding request
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_search_is_rejected_while_pending() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (first, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        until_pending(&matchmaker).await;

        let second = matchmaker.find_match(&MatchmakerQuery::new()).await;
        assert!(matches!(
            second,
            Err(GameClientError::MatchmakingPending { ticket: Some(t) }) if t == "t-1"
        ));
        matchmaker.cancel("t-1");
    });

    assert_eq!(
        first.unwrap(),
        MatchResolution::Cancelled {
            ticket: "t-1".into()
        }
    );
    // Only the first request reached the server.
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchmakerRemove { ticket } if ticket == "t-1"
    ));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn second_matchmaker_on_the_connection_is_rejected() {
    let (client, _events, mut server) = connected_client().await;
    let first = Matchmaker::new(client.handle());
    let second = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(first.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        until_pending(&first).await;

        let rejected = second.find_match(&MatchmakerQuery::new()).await;
        assert!(matches!(
            rejected,
            Err(GameClientError::MatchmakingPending { ticket: Some(t) }) if t == "t-1"
        ));
        assert_eq!(second.status(), MatchmakerStatus::Idle);
        server.assert_quiet(&client.handle()).await;

        server.push(&matched("t-1", Some("m-1")));
    });
    assert!(matches!(
        resolution.unwrap(),
        MatchResolution::Matched { match_id, .. } if match_id == "m-1"
    ));

    // Once the first search resolved, the connection is free again.
    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(second.find_match(&query), async {
        issue_ticket(&mut server, "t-2").await;
        server.push(&matched("t-2", Some("m-2")));
    });
    assert!(matches!(
        resolution.unwrap(),
        MatchResolution::Matched { match_id, .. } if match_id == "m-2"
    ));
}

#[tokio::test]
async fn search_before_ticket_blocks_other_matchmakers() {
    let (client, _events, mut server) = connected_client().await;
    let first = Matchmaker::new(client.handle());
    let second = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(first.find_match(&query), async {
        assert!(matches!(
            server.recv_client().await,
            ClientMessage::MatchmakerAdd { .. }
        ));
        let rejected = second.find_match(&MatchmakerQuery::new()).await;
        assert!(matches!(
            rejected,
            Err(GameClientError::MatchmakingPending { ticket: None })
        ));
        server.push(&ticket("t-1"));
        until_pending(&first).await;
        first.cancel("t-1");
    });
    assert!(matches!(resolution.unwrap(), MatchResolution::Cancelled { .. }));
}

// ════════════════════════════════════════════════════════════════════
// Cancellation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancel_withdraws_ticket_and_unregisters_synchronously() {
    let (client, _events, mut server) = connected_client().await;
    let handle = client.handle();
    let matchmaker = Matchmaker::new(handle.clone());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        until_pending(&matchmaker).await;

        matchmaker.cancel("t-1");
        assert!(!handle.is_subscribed(MessageKind::MatchmakerMatched));
        // A late match for the withdrawn ticket has nowhere to go.
        server.push(&matched("t-1", Some("m-late")));
    });

    assert!(matches!(resolution.unwrap(), MatchResolution::Cancelled { .. }));
    assert_eq!(matchmaker.status(), MatchmakerStatus::Idle);
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchmakerRemove { ticket } if ticket == "t-1"
    ));
}

#[tokio::test]
async fn cancel_twice_sends_one_remove() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        until_pending(&matchmaker).await;
        matchmaker.cancel("t-1");
        matchmaker.cancel("t-1");
        matchmaker.cancel("never-issued");
    });

    assert_ok!(resolution);
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchmakerRemove { .. }
    ));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn cancel_after_match_is_a_no_op() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        server.push(&matched("t-1", Some("m-1")));
    });
    let resolution = resolution.unwrap();

    matchmaker.cancel(resolution.ticket());
    matchmaker.cancel_pending();

    assert_eq!(resolution.match_id(), Some("m-1"));
    assert!(matches!(matchmaker.status(), MatchmakerStatus::Matched { .. }));
    server.assert_quiet(&client.handle()).await;
}

#[tokio::test]
async fn cancel_before_ticket_withdraws_on_arrival() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        assert!(matches!(
            server.recv_client().await,
            ClientMessage::MatchmakerAdd { .. }
        ));
        assert_eq!(matchmaker.status(), MatchmakerStatus::Submitting);
        matchmaker.cancel_pending();
        server.push(&ticket("t-1"));
    });

    assert_eq!(
        resolution.unwrap(),
        MatchResolution::Cancelled {
            ticket: "t-1".into()
        }
    );
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchmakerRemove { ticket } if ticket == "t-1"
    ));
}

#[tokio::test]
async fn abandoned_search_withdraws_ticket() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    tokio::select! {
        _ = matchmaker.find_match(&query) => panic!("search should still be pending"),
        () = async {
            issue_ticket(&mut server, "t-1").await;
            until_pending(&matchmaker).await;
        } => {}
    }

    assert_eq!(matchmaker.status(), MatchmakerStatus::Idle);
    assert!(matches!(
        server.recv_client().await,
        ClientMessage::MatchmakerRemove { ticket } if ticket == "t-1"
    ));
}

// ════════════════════════════════════════════════════════════════════
// Failures
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connection_loss_interrupts_search() {
    let (client, _events, mut server) = connected_client().await;
    let matchmaker = Matchmaker::new(client.handle());

    let query = MatchmakerQuery::new();
    let (resolution, ()) = tokio::join!(matchmaker.find_match(&query), async {
        issue_ticket(&mut server, "t-1").await;
        until_pending(&matchmaker).await;
        server.hang_up();
    });

    assert!(matches!(
        resolution,
        Err(GameClientError::MatchmakingInterrupted)
    ));
    assert_eq!(matchmaker.status(), MatchmakerStatus::Idle);
}

#[tokio::test]
async fn missing_ticket_times_out() {
    let config = test_config().with_request_timeout(Duration::from_millis(50));
    let (client, _events, _server) = connected_client_with(config).await;
    let matchmaker = Matchmaker::new(client.handle());

    let result = matchmaker.find_match(&MatchmakerQuery::new()).await;

    assert!(matches!(result, Err(GameClientError::Timeout)));
    assert_eq!(matchmaker.status(), MatchmakerStatus::Idle);
}

#[tokio::test]
async fn search_requires_connection() {
    let (mut client, _events, _server) = connected_client().await;
    client.disconnect().await;
    let matchmaker = Matchmaker::new(client.handle());

    let result = matchmaker.find_match(&MatchmakerQuery::new()).await;

    assert!(matches!(result, Err(GameClientError::NotConnected)));
    assert_eq!(matchmaker.status(), MatchmakerStatus::Idle);
}
