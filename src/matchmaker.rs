//! Matchmaking ticket lifecycle.
//!
//! ```text
//! Idle ──find_match──▶ Submitting ──ticket──▶ Pending(ticket) ──matched──▶ Matched(match_id)
//!                          │                      │
//!                          └──────── cancel ──────┴──▶ Idle
//!                                 connection lost ───▶ Idle (MatchmakingInterrupted)
//! ```
//!
//! At most one request is outstanding per connection, however many
//! [`Matchmaker`]s share it. A second [`find_match`](Matchmaker::find_match)
//! while one is submitting or pending is rejected with
//! [`GameClientError::MatchmakingPending`] and sends nothing.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::SessionHandle;
use crate::error::{GameClientError, Result};
use crate::protocol::{ClientMessage, MatchId, MessageKind, ServerMessage, Ticket};

/// Default matchmaker query (match anyone).
const DEFAULT_QUERY: &str = "*";

/// Party size for a tic-tac-toe match.
const PARTY_SIZE: u32 = 2;

// ── Query ───────────────────────────────────────────────────────────

/// Criteria for a pairing request.
///
/// # Example
///
/// ```
/// use tictactoe_session_client::matchmaker::MatchmakerQuery;
///
/// let query = MatchmakerQuery::new().with_query("+region:eu");
/// assert_eq!(query.query(), "+region:eu");
/// assert_eq!(query.min_count(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakerQuery {
    query: String,
    min_count: u32,
    max_count: u32,
}

impl MatchmakerQuery {
    /// Matches anyone, two players.
    pub fn new() -> Self {
        Self {
            query: DEFAULT_QUERY.to_owned(),
            min_count: PARTY_SIZE,
            max_count: PARTY_SIZE,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Sets the party size bounds. `max` is raised to `min` if smaller.
    #[must_use]
    pub fn with_counts(mut self, min: u32, max: u32) -> Self {
        self.min_count = min;
        self.max_count = max.max(min);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn min_count(&self) -> u32 {
        self.min_count
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }
}

impl Default for MatchmakerQuery {
    fn default() -> Self {
        Self::new()
    }
}

// ── Resolution & status ─────────────────────────────────────────────

/// How a [`find_match`](Matchmaker::find_match) call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResolution {
    /// The server paired this ticket into `match_id`.
    Matched { ticket: Ticket, match_id: MatchId },
    /// The ticket was withdrawn before a match was found.
    Cancelled { ticket: Ticket },
}

impl MatchResolution {
    pub fn ticket(&self) -> &str {
        match self {
            Self::Matched { ticket, .. } | Self::Cancelled { ticket } => ticket,
        }
    }

    /// The match to join, if one was found.
    pub fn match_id(&self) -> Option<&str> {
        match self {
            Self::Matched { match_id, .. } => Some(match_id),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Observable matchmaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakerStatus {
    Idle,
    /// Request sent, ticket not issued yet.
    Submitting,
    Pending { ticket: Ticket },
    /// The last request resolved into a match.
    Matched { ticket: Ticket, match_id: MatchId },
}

enum Phase {
    Idle,
    Submitting {
        cancelled: bool,
    },
    Pending {
        ticket: Ticket,
        cancel_tx: oneshot::Sender<()>,
        subscription_id: u64,
    },
    Matched {
        ticket: Ticket,
        match_id: MatchId,
    },
}

// ── Matchmaker ──────────────────────────────────────────────────────

/// Pairs the local user with an opponent over a shared [`SessionHandle`].
///
/// Share it behind an `Arc` to cancel from a different task than the one
/// awaiting [`find_match`](Self::find_match).
pub struct Matchmaker {
    handle: SessionHandle,
    /// Identifies this matchmaker's claim on the connection's search slot.
    owner: u64,
    phase: Mutex<Phase>,
}

impl Matchmaker {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            owner: handle.owner_id(),
            handle,
            phase: Mutex::new(Phase::Idle),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of the ticket lifecycle.
    pub fn status(&self) -> MatchmakerStatus {
        match &*self.phase() {
            Phase::Idle => MatchmakerStatus::Idle,
            Phase::Submitting { .. } => MatchmakerStatus::Submitting,
            Phase::Pending { ticket, .. } => MatchmakerStatus::Pending {
                ticket: ticket.clone(),
            },
            Phase::Matched { ticket, match_id } => MatchmakerStatus::Matched {
                ticket: ticket.clone(),
                match_id: match_id.clone(),
            },
        }
    }

    /// The outstanding ticket, if the server has issued one.
    pub fn pending_ticket(&self) -> Option<Ticket> {
        match &*self.phase() {
            Phase::Pending { ticket, .. } => Some(ticket.clone()),
            _ => None,
        }
    }

    /// Submits a pairing request and waits until it is matched or cancelled.
    ///
    /// Dropping the returned future withdraws the ticket.
    ///
    /// # Errors
    ///
    /// - [`GameClientError::MatchmakingPending`] if a request is already
    ///   outstanding on this connection, from this or any other matchmaker.
    /// - [`GameClientError::NotConnected`] without a live connection.
    /// - [`GameClientError::Timeout`] if no ticket is issued within the request timeout.
    /// - [`GameClientError::MatchmakingInterrupted`] if the connection drops while waiting.
    pub async fn find_match(&self, query: &MatchmakerQuery) -> Result<MatchResolution> {
        self.begin()?;
        let mut guard = SubmitGuard {
            matchmaker: self,
            armed: true,
        };

        // Both subscriptions exist before the request goes out so a fast
        // server cannot answer into an empty slot.
        let mut matched = self.handle.subscribe(MessageKind::MatchmakerMatched)?;
        let mut tickets = self.handle.subscribe(MessageKind::MatchmakerTicket)?;

        self.handle.send(ClientMessage::MatchmakerAdd {
            query: query.query.clone(),
            min_count: query.min_count,
            max_count: query.max_count,
        })?;
        debug!(
            query = %query.query,
            min = query.min_count,
            max = query.max_count,
            "matchmaking request sent"
        );

        let issued = tokio::time::timeout(self.handle.request_timeout(), next_ticket(&mut tickets));
        let ticket = match issued.await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return Err(GameClientError::MatchmakingInterrupted),
            Err(_) => return Err(GameClientError::Timeout),
        };
        drop(tickets);

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        if !self.promote(&ticket, cancel_tx, matched.id()) {
            info!(%ticket, "matchmaking cancelled before ticket was issued; withdrawing");
            guard.armed = false;
            self.withdraw(&ticket);
            *self.phase() = Phase::Idle;
            self.handle.release_search(self.owner);
            return Ok(MatchResolution::Cancelled { ticket });
        }
        info!(%ticket, "matchmaking ticket issued");

        loop {
            tokio::select! {
                biased;

                _ = &mut cancel_rx => {
                    guard.armed = false;
                    info!(%ticket, "matchmaking cancelled");
                    return Ok(MatchResolution::Cancelled { ticket });
                }

                msg = matched.recv() => match msg {
                    Some(ServerMessage::MatchmakerMatched {
                        ticket: matched_ticket,
                        match_id,
                        users,
                    }) => {
                        if matched_ticket != ticket {
                            debug!(%matched_ticket, "ignoring match for a foreign ticket");
                            continue;
                        }
                        let Some(match_id) = match_id else {
                            warn!(%ticket, "matched without a match id; still waiting");
                            continue;
                        };
                        guard.armed = false;
                        *self.phase() = Phase::Matched {
                            ticket: ticket.clone(),
                            match_id: match_id.clone(),
                        };
                        self.handle.release_search(self.owner);
                        info!(%ticket, %match_id, players = users.len(), "match found");
                        return Ok(MatchResolution::Matched { ticket, match_id });
                    }
                    Some(other) => {
                        debug!(kind = ?other.kind(), "unexpected message on matchmaker stream");
                    }
                    None => {
                        warn!(%ticket, "connection lost while matchmaking");
                        return Err(GameClientError::MatchmakingInterrupted);
                    }
                },
            }
        }
    }

    /// Withdraws `ticket` if it is the one pending.
    ///
    /// Best-effort and synchronous: the waiting [`find_match`](Self::find_match)
    /// returns [`MatchResolution::Cancelled`], no further match message reaches
    /// it, and the remove request is queued. Send failures are logged and
    /// swallowed. Resolved, unknown, or already-cancelled tickets are ignored.
    pub fn cancel(&self, ticket: &str) {
        let mut phase = self.phase();
        let owns_ticket =
            matches!(&*phase, Phase::Pending { ticket: pending, .. } if pending == ticket);
        if !owns_ticket {
            debug!(ticket, "cancel ignored: ticket is not pending");
            return;
        }
        let Phase::Pending {
            ticket,
            cancel_tx,
            subscription_id,
        } = std::mem::replace(&mut *phase, Phase::Idle)
        else {
            return;
        };
        drop(phase);
        self.handle.release_search(self.owner);

        let _ = cancel_tx.send(());
        self.handle
            .unsubscribe(MessageKind::MatchmakerMatched, subscription_id);
        self.withdraw(&ticket);
    }

    /// Cancels whatever is outstanding.
    ///
    /// A request whose ticket has not been issued yet is withdrawn as soon as
    /// the ticket arrives.
    pub fn cancel_pending(&self) {
        let ticket = {
            let mut phase = self.phase();
            match &mut *phase {
                Phase::Submitting { cancelled } => {
                    *cancelled = true;
                    return;
                }
                Phase::Pending { ticket, .. } => ticket.clone(),
                Phase::Idle | Phase::Matched { .. } => return,
            }
        };
        self.cancel(&ticket);
    }

    fn begin(&self) -> Result<()> {
        let mut phase = self.phase();
        match &*phase {
            Phase::Submitting { .. } => Err(GameClientError::MatchmakingPending { ticket: None }),
            Phase::Pending { ticket, .. } => Err(GameClientError::MatchmakingPending {
                ticket: Some(ticket.clone()),
            }),
            Phase::Idle | Phase::Matched { .. } => {
                self.handle.claim_search(self.owner)?;
                *phase = Phase::Submitting { cancelled: false };
                Ok(())
            }
        }
    }

    /// Moves Submitting to Pending. Returns `false` if cancelled meanwhile.
    fn promote(&self, ticket: &str, cancel_tx: oneshot::Sender<()>, subscription_id: u64) -> bool {
        let mut phase = self.phase();
        if matches!(&*phase, Phase::Submitting { cancelled: true }) {
            return false;
        }
        *phase = Phase::Pending {
            ticket: ticket.to_owned(),
            cancel_tx,
            subscription_id,
        };
        self.handle.note_ticket(self.owner, ticket);
        true
    }

    /// Resets to Idle after the find_match future went away mid-flight.
    fn abandon(&self) {
        let previous = std::mem::replace(&mut *self.phase(), Phase::Idle);
        self.handle.release_search(self.owner);
        match previous {
            Phase::Pending { ticket, .. } => {
                debug!(%ticket, "matchmaking abandoned; withdrawing ticket");
                self.withdraw(&ticket);
            }
            Phase::Submitting { .. } => debug!("matchmaking abandoned before a ticket was issued"),
            Phase::Idle | Phase::Matched { .. } => {}
        }
    }

    fn withdraw(&self, ticket: &str) {
        if let Err(e) = self.handle.send(ClientMessage::MatchmakerRemove {
            ticket: ticket.to_owned(),
        }) {
            debug!(ticket, "could not withdraw ticket: {e}");
        }
    }
}

impl std::fmt::Debug for Matchmaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matchmaker")
            .field("owner", &self.owner)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Matchmaker {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Resets the matchmaker if `find_match` exits early or its future is dropped.
struct SubmitGuard<'a> {
    matchmaker: &'a Matchmaker,
    armed: bool,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.matchmaker.abandon();
        }
    }
}

async fn next_ticket(tickets: &mut crate::router::Subscription) -> Option<Ticket> {
    loop {
        match tickets.recv().await? {
            ServerMessage::MatchmakerTicket { ticket } => return Some(ticket),
            other => debug!(kind = ?other.kind(), "unexpected message on ticket stream"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_query_matches_anyone_for_two() {
        let query = MatchmakerQuery::default();
        assert_eq!(query.query(), "*");
        assert_eq!((query.min_count(), query.max_count()), (2, 2));
    }

    #[test]
    fn counts_keep_max_at_least_min() {
        let query = MatchmakerQuery::new().with_counts(3, 1);
        assert_eq!((query.min_count(), query.max_count()), (3, 3));
    }

    #[test]
    fn resolution_accessors() {
        let matched = MatchResolution::Matched {
            ticket: "t".into(),
            match_id: "m".into(),
        };
        assert_eq!(matched.ticket(), "t");
        assert_eq!(matched.match_id(), Some("m"));

        let cancelled = MatchResolution::Cancelled { ticket: "t".into() };
        assert_eq!(cancelled.match_id(), None);
    }
}
