//! Joined-match state machine.
//!
//! [`MatchTracker`] is the sans-IO core: it keeps the last authoritative
//! [`GameState`], the cells whose fill has already been reported, and the
//! local player's mark. [`MatchSession`] wires a tracker to the connection:
//! it joins, feeds inbound state into the tracker, notifies a
//! [`ChangeListener`], and gates outgoing moves.
//!
//! The local copy is never mutated by a move. A submitted move only shows up
//! once the server broadcasts the state that contains it.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::SessionHandle;
use crate::error::{GameClientError, Result};
use crate::game::{GameState, Mark, MovePayload, OpCode, Outcome, BOARD_CELLS};
use crate::protocol::{ClientMessage, MatchId, MessageKind, Presence, ServerMessage, UserId};
use crate::reconcile::{diff, ChangeSet, FiredCells};
use crate::router::Subscription;

// ── Listener ────────────────────────────────────────────────────────

/// Receives every applied state together with what changed.
///
/// Implemented for any `FnMut(&GameState, &ChangeSet) + Send`.
pub trait ChangeListener: Send + 'static {
    fn on_change(&mut self, state: &GameState, changes: &ChangeSet);
}

impl<F> ChangeListener for F
where
    F: FnMut(&GameState, &ChangeSet) + Send + 'static,
{
    fn on_change(&mut self, state: &GameState, changes: &ChangeSet) {
        self(state, changes);
    }
}

// ── Moves ───────────────────────────────────────────────────────────

/// Why a move was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MoveRejection {
    #[error("no match joined")]
    NotJoined,
    #[error("no game state received yet")]
    NoState,
    #[error("position is off the board")]
    OutOfRange,
    #[error("game is over")]
    GameOver,
    #[error("not this player's turn")]
    NotYourTurn,
    #[error("cell is already occupied")]
    CellOccupied,
}

/// Result of [`MatchSession::submit_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The move was queued to the server. It is not applied until a state update shows it.
    Sent,
    /// The local gate refused the move; nothing was sent.
    Rejected(MoveRejection),
}

impl MoveOutcome {
    pub fn is_sent(self) -> bool {
        matches!(self, MoveOutcome::Sent)
    }
}

// ── Tracker ─────────────────────────────────────────────────────────

/// Authoritative state plus per-match bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct MatchTracker {
    previous: Option<GameState>,
    fired: FiredCells,
    local_user: Option<UserId>,
    local_mark: Option<Mark>,
}

impl MatchTracker {
    /// A tracker for `local_user`. Without a user id the local mark is never resolved.
    pub fn new(local_user: Option<UserId>) -> Self {
        Self {
            local_user,
            ..Self::default()
        }
    }

    /// Records `next` as the latest state and returns what changed.
    ///
    /// Every position is reported as newly filled at most once for the
    /// lifetime of the tracker, however often the server repeats a state.
    pub fn apply(&mut self, next: GameState) -> ChangeSet {
        if let Some(prev) = &self.previous {
            warn_on_regression(prev, &next);
        }

        if self.local_mark.is_none() {
            if let Some(mark) = self.local_user.as_deref().and_then(|u| next.mark_of(u)) {
                info!(%mark, "local mark assigned");
                self.local_mark = Some(mark);
            }
        }

        let changes = diff(self.previous.as_ref(), &next, &self.fired);
        self.fired.extend(changes.newly_filled.iter().copied());
        self.previous = Some(next);
        changes
    }

    /// Local admission check for a move at `position`. Does not change any state.
    ///
    /// # Errors
    ///
    /// Returns the first [`MoveRejection`] that applies.
    pub fn admit_move(&self, position: usize) -> std::result::Result<(), MoveRejection> {
        if position >= BOARD_CELLS {
            return Err(MoveRejection::OutOfRange);
        }
        let state = self.previous.as_ref().ok_or(MoveRejection::NoState)?;
        if state.game_over {
            return Err(MoveRejection::GameOver);
        }
        if self.local_mark != Some(state.current_turn) {
            return Err(MoveRejection::NotYourTurn);
        }
        if !state.board.is_empty_at(position) {
            return Err(MoveRejection::CellOccupied);
        }
        Ok(())
    }

    pub fn state(&self) -> Option<&GameState> {
        self.previous.as_ref()
    }

    /// The local player's mark, cached from the first state that names them.
    pub fn local_mark(&self) -> Option<Mark> {
        self.local_mark
    }

    pub fn fired(&self) -> FiredCells {
        self.fired
    }

    pub fn is_my_turn(&self) -> bool {
        match (&self.previous, self.local_mark) {
            (Some(state), Some(mark)) => !state.game_over && state.current_turn == mark,
            _ => false,
        }
    }

    /// Outcome for the local player once the game is over.
    pub fn outcome(&self) -> Option<Outcome> {
        self.previous.as_ref()?.outcome_for(self.local_mark?)
    }
}

fn warn_on_regression(prev: &GameState, next: &GameState) {
    if prev.game_over && !next.game_over {
        warn!("state went from terminal back to in-progress");
    }
    for (position, (before, after)) in prev
        .board
        .cells()
        .iter()
        .zip(next.board.cells().iter())
        .enumerate()
    {
        if let Some(mark) = before.mark() {
            if after.mark() != Some(mark) {
                warn!(position, %mark, "occupied cell changed");
            }
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct ActiveMatch {
    match_id: MatchId,
    data: Subscription,
    tracker: MatchTracker,
    listener: Box<dyn ChangeListener>,
    presences: Vec<Presence>,
}

/// The single active match on a connection.
///
/// Only one session per connection can hold a match at a time; a second
/// session's [`join`](Self::join) fails with [`GameClientError::AlreadyJoined`].
/// A match ends with the connection it was joined on: after a reconnect,
/// joining the same id again sends a fresh join.
///
/// ```rust,ignore
/// let mut session = MatchSession::new(client.handle());
/// session.join(&match_id, |state: &GameState, changes: &ChangeSet| {
///     for position in &changes.newly_filled {
///         println!("cell {position} is now {:?}", state.board.get(*position));
///     }
/// }).await?;
///
/// while let Some(_changes) = session.next_change().await {
///     if session.is_my_turn() {
///         session.submit_move(4)?;
///     }
/// }
/// session.leave();
/// ```
pub struct MatchSession {
    handle: SessionHandle,
    /// Identifies this session's claim on the connection's match slot.
    owner: u64,
    active: Option<ActiveMatch>,
}

impl MatchSession {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            owner: handle.owner_id(),
            handle,
            active: None,
        }
    }

    /// The active match, if it is still live on the current connection.
    fn live(&self) -> Option<&ActiveMatch> {
        self.active
            .as_ref()
            .filter(|_| self.handle.holds_match(self.owner))
    }

    /// Joins `match_id` and makes `listener` the receiver of its state changes.
    ///
    /// The match-data subscription is registered before the join request is
    /// sent, so the server's opening state is never missed. Joining the match
    /// that is already live does nothing.
    ///
    /// # Errors
    ///
    /// - [`GameClientError::AlreadyJoined`] if a different match is active on
    ///   this connection, through this or any other session.
    /// - [`GameClientError::JoinFailure`] if the connection is down, the server
    ///   refuses the join, or no answer arrives within the request timeout.
    pub async fn join<L: ChangeListener>(&mut self, match_id: &str, listener: L) -> Result<()> {
        if let Some(active) = self.live() {
            if active.match_id == match_id {
                debug!(match_id, "already in this match");
                return Ok(());
            }
            return Err(GameClientError::AlreadyJoined {
                active: active.match_id.clone(),
            });
        }
        if let Some(stale) = self.active.take() {
            debug!(match_id = %stale.match_id, "previous match ended with its connection");
        }

        self.handle
            .claim_match(self.owner, match_id)
            .map_err(|e| match e {
                GameClientError::AlreadyJoined { .. } => e,
                other => GameClientError::join(match_id, other.to_string()),
            })?;
        let mut claim = ClaimGuard {
            handle: self.handle.clone(),
            owner: self.owner,
            armed: true,
        };

        let data = self
            .handle
            .subscribe(MessageKind::MatchData)
            .map_err(|e| GameClientError::join(match_id, e.to_string()))?;
        let mut acks = self
            .handle
            .subscribe(MessageKind::MatchJoin)
            .map_err(|e| GameClientError::join(match_id, e.to_string()))?;

        self.handle
            .send(ClientMessage::MatchJoin {
                match_id: match_id.to_owned(),
            })
            .map_err(|e| GameClientError::join(match_id, e.to_string()))?;
        debug!(match_id, "join requested");

        let answer = tokio::time::timeout(
            self.handle.request_timeout(),
            await_join(&mut acks, match_id),
        );
        let presences = match answer.await {
            Ok(result) => result?,
            Err(_) => {
                // The server may still admit us; make sure it does not keep the seat.
                if let Err(e) = self.handle.send(ClientMessage::MatchLeave {
                    match_id: match_id.to_owned(),
                }) {
                    debug!(match_id, "leave after join timeout not sent: {e}");
                }
                return Err(GameClientError::join(
                    match_id,
                    "timed out waiting for the server",
                ));
            }
        };

        info!(match_id, players = presences.len(), "joined match");
        claim.armed = false;
        self.active = Some(ActiveMatch {
            match_id: match_id.to_owned(),
            data,
            tracker: MatchTracker::new(self.handle.user_id()),
            listener: Box::new(listener),
            presences,
        });
        Ok(())
    }

    /// Waits for the next authoritative state, applies it, and notifies the listener.
    ///
    /// Malformed payloads, data for other matches, and non-state op codes are
    /// logged and skipped. Returns `None` when no match is joined or the
    /// stream has ended (connection lost). The last state stays readable, but
    /// the match is no longer joined once its stream ends.
    ///
    /// Cancel-safe: a state is either fully applied or still queued.
    pub async fn next_change(&mut self) -> Option<ChangeSet> {
        let active = self.active.as_mut()?;
        loop {
            let Some(msg) = active.data.recv().await else {
                info!(match_id = %active.match_id, "match stream ended");
                self.handle.release_match(self.owner);
                return None;
            };
            let ServerMessage::MatchData {
                match_id,
                op_code,
                data,
                ..
            } = msg
            else {
                continue;
            };

            if match_id != active.match_id {
                debug!(%match_id, "dropping data for another match");
                continue;
            }
            let Some(op) = OpCode::from_code(op_code).filter(|op| op.carries_state()) else {
                debug!(op_code, "ignoring match data without state");
                continue;
            };
            let state = match GameState::from_slice(&data) {
                Ok(state) => state,
                Err(e) => {
                    let err = GameClientError::DecodeFailure(e.to_string());
                    warn!(?op, "dropping match data: {err}");
                    continue;
                }
            };

            let changes = active.tracker.apply(state);
            if let Some(state) = active.tracker.state() {
                active.listener.on_change(state, &changes);
            }
            debug!(?op, ?changes, "applied state");
            return Some(changes);
        }
    }

    /// Drives [`next_change`](Self::next_change) until the stream ends.
    pub async fn run(&mut self) {
        while self.next_change().await.is_some() {}
    }

    /// Sends a move at `position` if the local gate admits it.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] if the move passed the gate
    /// but the connection is down.
    pub fn submit_move(&self, position: usize) -> Result<MoveOutcome> {
        let Some(active) = self.live() else {
            return Ok(MoveOutcome::Rejected(MoveRejection::NotJoined));
        };
        if let Err(rejection) = active.tracker.admit_move(position) {
            debug!(position, %rejection, "move rejected locally");
            return Ok(MoveOutcome::Rejected(rejection));
        }
        let Ok(position) = u8::try_from(position) else {
            return Ok(MoveOutcome::Rejected(MoveRejection::OutOfRange));
        };

        let payload = serde_json::to_vec(&MovePayload { position })?;
        self.handle
            .send_match_data(&active.match_id, OpCode::Move, payload)?;
        debug!(position, "move sent");
        Ok(MoveOutcome::Sent)
    }

    /// Leaves the active match.
    ///
    /// Unsubscribes synchronously, so nothing received afterwards reaches the
    /// listener. Sends the leave notification once; calling again is a no-op.
    pub fn leave(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveMatch { match_id, data, .. } = active;
        data.dispose();

        // A match lost with its connection has nothing to leave.
        if !self.handle.holds_match(self.owner) {
            debug!(%match_id, "match already ended with its connection");
            return;
        }
        self.handle.release_match(self.owner);
        match self.handle.send(ClientMessage::MatchLeave {
            match_id: match_id.clone(),
        }) {
            Ok(()) => info!(%match_id, "left match"),
            Err(e) => debug!(%match_id, "leave notification not sent: {e}"),
        }
    }

    // ── Presentation flags ──────────────────────────────────────────

    /// Returns `true` while the match is live on the current connection.
    pub fn is_joined(&self) -> bool {
        self.live().is_some()
    }

    pub fn match_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.match_id.as_str())
    }

    /// Players reported by the server when the join was acknowledged.
    pub fn presences(&self) -> &[Presence] {
        self.active
            .as_ref()
            .map(|a| a.presences.as_slice())
            .unwrap_or(&[])
    }

    pub fn state(&self) -> Option<&GameState> {
        self.active.as_ref()?.tracker.state()
    }

    pub fn local_mark(&self) -> Option<Mark> {
        self.active.as_ref()?.tracker.local_mark()
    }

    pub fn is_my_turn(&self) -> bool {
        self.live().is_some_and(|a| a.tracker.is_my_turn())
    }

    /// Returns `true` if a move at `position` would pass the local gate.
    pub fn can_move(&self, position: usize) -> bool {
        self.live()
            .is_some_and(|a| a.tracker.admit_move(position).is_ok())
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.active.as_ref()?.tracker.outcome()
    }
}

impl std::fmt::Debug for MatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchSession")
            .field("match_id", &self.match_id())
            .field("local_mark", &self.local_mark())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for MatchSession {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Releases a match claim unless the join completed.
struct ClaimGuard {
    handle: SessionHandle,
    owner: u64,
    armed: bool,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.release_match(self.owner);
        }
    }
}

async fn await_join(acks: &mut Subscription, match_id: &str) -> Result<Vec<Presence>> {
    loop {
        match acks.recv().await {
            Some(ServerMessage::MatchJoined {
                match_id: joined,
                presences,
            }) if joined == match_id => return Ok(presences),
            Some(ServerMessage::MatchJoinFailed {
                match_id: failed,
                reason,
                error_code,
            }) if failed == match_id => {
                warn!(match_id, %reason, ?error_code, "join refused");
                return Err(GameClientError::join(match_id, reason));
            }
            Some(other) => debug!(kind = ?other.kind(), "ignoring join answer for another match"),
            None => return Err(GameClientError::join(match_id, "connection lost")),
        }
    }
}
