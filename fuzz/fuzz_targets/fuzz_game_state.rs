#![no_main]

use libfuzzer_sys::fuzz_target;
use tictactoe_session_client::{GameState, MatchTracker};

fuzz_target!(|data: &[u8]| {
    let Ok(state) = GameState::from_slice(data) else {
        return;
    };

    // Decoded boards always have nine cells, so diffing and gating must not panic.
    let mut tracker = MatchTracker::new(state.players.keys().next().cloned());
    let first = tracker.apply(state.clone());
    let again = tracker.apply(state);

    assert!(again.newly_filled.is_empty());
    assert!(first.newly_filled.len() <= 9);
    for position in 0..10 {
        let _ = tracker.admit_move(position);
    }
});
