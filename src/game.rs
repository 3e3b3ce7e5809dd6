//! Client-side copy of the server-authoritative tic-tac-toe state.
//!
//! The wire format is the JSON object broadcast by the match handler:
//!
//! ```json
//! {
//!   "board": ["", "X", "", "", "O", "", "", "", ""],
//!   "currentTurn": "X",
//!   "winner": "",
//!   "gameOver": false,
//!   "players": { "user-a": "X", "user-b": "O" }
//! }
//! ```
//!
//! Nothing here enforces game rules. The server decides legality, turns and
//! outcomes; this module only decodes what it says.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::UserId;

/// Number of cells on the board.
pub const BOARD_CELLS: usize = 9;

/// One of the two symbols a player is assigned in a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mark {
    /// Moves first.
    X,
    /// Moves second.
    O,
}

impl Mark {
    /// Returns the other mark.
    pub fn opponent(self) -> Self {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mark::X => "X",
            Mark::O => "O",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "X" => Some(Mark::X),
            "O" => Some(Mark::O),
            _ => None,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single board cell. Encoded as `""`, `"X"` or `"O"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cell {
    /// No mark yet.
    #[default]
    Empty,
    /// Occupied by a player's mark.
    Marked(Mark),
}

impl Cell {
    /// Returns `true` if no mark has been placed.
    pub fn is_empty(self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Returns the mark in this cell, if any.
    pub fn mark(self) -> Option<Mark> {
        match self {
            Cell::Empty => None,
            Cell::Marked(mark) => Some(mark),
        }
    }
}

impl From<Option<Mark>> for Cell {
    fn from(mark: Option<Mark>) -> Self {
        mark.map_or(Cell::Empty, Cell::Marked)
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.mark().map_or("", Mark::as_str))
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_mark_or_empty(&raw)
            .map(Cell::from)
            .map_err(serde::de::Error::custom)
    }
}

fn parse_mark_or_empty(raw: &str) -> Result<Option<Mark>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    Mark::parse(raw)
        .map(Some)
        .ok_or_else(|| format!("invalid mark {raw:?}, expected \"\", \"X\" or \"O\""))
}

/// The 3x3 board in row-major order (positions `0..=8`).
///
/// Always exactly nine cells; a payload with any other length fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board([Cell; BOARD_CELLS]);

impl Board {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a board from its cells.
    pub fn from_cells(cells: [Cell; BOARD_CELLS]) -> Self {
        Self(cells)
    }

    /// Returns the cell at `position`, or `None` when out of range.
    pub fn get(&self, position: usize) -> Option<Cell> {
        self.0.get(position).copied()
    }

    /// Returns a copy of this board with `mark` placed at `position`.
    ///
    /// Out-of-range positions leave the board unchanged.
    #[must_use]
    pub fn with_mark(mut self, position: usize, mark: Mark) -> Self {
        if let Some(cell) = self.0.get_mut(position) {
            *cell = Cell::Marked(mark);
        }
        self
    }

    /// Returns `true` if `position` is on the board and unoccupied.
    pub fn is_empty_at(&self, position: usize) -> bool {
        matches!(self.get(position), Some(Cell::Empty))
    }

    /// All cells in position order.
    pub fn cells(&self) -> &[Cell; BOARD_CELLS] {
        &self.0
    }

    /// Positions that hold a mark.
    pub fn filled_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(position, _)| position)
    }

    /// Returns `true` when every cell is occupied.
    pub fn is_full(&self) -> bool {
        self.0.iter().all(|cell| !cell.is_empty())
    }
}

/// Authoritative game state as last broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Board cells, row-major.
    pub board: Board,
    /// Which mark moves next.
    pub current_turn: Mark,
    /// Winning mark; only meaningful once `game_over` is set. `""` on the wire means none.
    #[serde(default, with = "winner_field")]
    pub winner: Option<Mark>,
    /// Terminal flag. Never goes back to `false` within a match.
    pub game_over: bool,
    /// Assigned mark per user id.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub players: BTreeMap<UserId, Mark>,
}

impl GameState {
    /// The opening state the server creates for a fresh match.
    pub fn initial() -> Self {
        Self {
            board: Board::new(),
            current_turn: Mark::X,
            winner: None,
            game_over: false,
            players: BTreeMap::new(),
        }
    }

    /// Decodes a match-data payload.
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Returns the mark assigned to `user_id`, if the server has assigned one.
    pub fn mark_of(&self, user_id: &str) -> Option<Mark> {
        self.players.get(user_id).copied()
    }

    /// Outcome from the point of view of `mark`, once the game is over.
    pub fn outcome_for(&self, mark: Mark) -> Option<Outcome> {
        if !self.game_over {
            return None;
        }
        Some(match self.winner {
            Some(winner) if winner == mark => Outcome::Won,
            Some(_) => Outcome::Lost,
            None => Outcome::Draw,
        })
    }
}

/// How a finished match ended for the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost,
    Draw,
}

/// Message-kind tags used on the match data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Client → server move submission.
    Move,
    /// State after a move was applied.
    Update,
    /// Terminal state (win, draw, or forfeit by leaving).
    GameOver,
    /// Initial state once both players are present.
    PlayerJoin,
}

impl OpCode {
    /// Wire value of this op code.
    pub fn code(self) -> i64 {
        match self {
            OpCode::Move => 1,
            OpCode::Update => 2,
            OpCode::GameOver => 3,
            OpCode::PlayerJoin => 4,
        }
    }

    /// Maps a wire value back to an op code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(OpCode::Move),
            2 => Some(OpCode::Update),
            3 => Some(OpCode::GameOver),
            4 => Some(OpCode::PlayerJoin),
            _ => None,
        }
    }

    /// Returns `true` for op codes whose payload is a [`GameState`].
    pub fn carries_state(self) -> bool {
        matches!(self, OpCode::Update | OpCode::GameOver | OpCode::PlayerJoin)
    }
}

/// Payload of an [`OpCode::Move`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub position: u8,
}

mod winner_field {
    use super::{parse_mark_or_empty, Mark};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        winner: &Option<Mark>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(winner.map_or("", Mark::as_str))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Mark>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) => parse_mark_or_empty(&raw).map_err(serde::de::Error::custom),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<UserId, Mark>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<UserId, Mark>>::deserialize(deserializer)?.unwrap_or_default())
}
