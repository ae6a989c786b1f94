//! Adaptive difficulty over the rolling five-result window.

use chrono::Utc;

use crate::models::progress::{Outcome, Progress, ResultWindow};
use crate::models::session::Difficulty;

/// At least this many correct in a full window steps the tier up.
pub const STEP_UP_MIN_CORRECT: usize = 4;
/// At most this many correct in a full window steps the tier down.
pub const STEP_DOWN_MAX_CORRECT: usize = 2;

/// Tier implied by a window. Only a full window can move the tier.
pub fn next_difficulty(current: Difficulty, window: &ResultWindow) -> Difficulty {
    if !window.is_full() {
        return current;
    }
    match window.correct_count() {
        n if n >= STEP_UP_MIN_CORRECT => current.step_up(),
        n if n <= STEP_DOWN_MAX_CORRECT => current.step_down(),
        _ => current,
    }
}

/// Folds one graded result into `progress`, returning the new record.
///
/// The version is bumped so the result can be written back with a
/// compare-and-swap against the version it was computed from.
pub fn apply_result(progress: &Progress, is_correct: bool) -> Progress {
    let mut next = progress.clone();

    next.total_problems += 1;
    if is_correct {
        next.correct_problems += 1;
        next.current_streak += 1;
    } else {
        next.current_streak = 0;
    }
    next.longest_streak = next.longest_streak.max(next.current_streak);

    next.last_five_results.push(Outcome::from(is_correct));
    next.current_difficulty = next_difficulty(progress.current_difficulty, &next.last_five_results);

    next.version = progress.version + 1;
    next.updated_at = Utc::now();
    next
}
