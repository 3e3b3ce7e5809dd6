//! Change detection between consecutive authoritative states.
//!
//! [`diff`] is pure: it compares two states and reports what a presentation
//! layer needs to react to. Per-cell at-most-once delivery is enforced by the
//! caller passing in the [`FiredCells`] already reported for the match.

use std::collections::BTreeSet;

use crate::game::{GameState, BOARD_CELLS};

/// What changed between two consecutive states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Cells that went from empty (or unknown) to marked and have not been reported before.
    pub newly_filled: BTreeSet<usize>,
    /// The side to move differs from the previous state, or there was no previous state.
    pub turn_changed: bool,
    /// The game just became terminal.
    pub became_game_over: bool,
}

impl ChangeSet {
    /// Returns `true` if nothing needs to be reacted to.
    pub fn is_empty(&self) -> bool {
        self.newly_filled.is_empty() && !self.turn_changed && !self.became_game_over
    }
}

/// Board positions whose fill event has already been emitted in the current match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiredCells(u16);

impl FiredCells {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, position: usize) -> bool {
        position < BOARD_CELLS && self.0 & (1 << position) != 0
    }

    /// Records `position`. Returns `false` if it was already recorded or is off the board.
    pub fn insert(&mut self, position: usize) -> bool {
        if position >= BOARD_CELLS || self.contains(position) {
            return false;
        }
        self.0 |= 1 << position;
        true
    }

    /// Records every position in `positions`.
    pub fn extend<I: IntoIterator<Item = usize>>(&mut self, positions: I) {
        for position in positions {
            self.insert(position);
        }
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Compares `prev` with `next`.
///
/// - `newly_filled`: positions empty (or absent) in `prev`, marked in `next`,
///   and not yet in `fired`.
/// - `turn_changed`: `prev` is `None` or its `current_turn` differs.
/// - `became_game_over`: `next` is terminal and `prev` is `None` or was not.
pub fn diff(prev: Option<&GameState>, next: &GameState, fired: &FiredCells) -> ChangeSet {
    let newly_filled = next
        .board
        .filled_positions()
        .filter(|&position| {
            prev.is_none_or(|prev| prev.board.is_empty_at(position)) && !fired.contains(position)
        })
        .collect();

    let turn_changed = prev.is_none_or(|prev| prev.current_turn != next.current_turn);
    let became_game_over = next.game_over && prev.is_none_or(|prev| !prev.game_over);

    ChangeSet {
        newly_filled,
        turn_changed,
        became_game_over,
    }
}
