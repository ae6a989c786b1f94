use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::Difficulty;

pub const WINDOW_SIZE: usize = 5;

/// Submission ids remembered per user to keep result application idempotent.
pub const APPLIED_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Correct,
    Incorrect,
}

impl From<bool> for Outcome {
    fn from(is_correct: bool) -> Self {
        if is_correct {
            Outcome::Correct
        } else {
            Outcome::Incorrect
        }
    }
}

/// Last five grading outcomes, newest last.
///
/// Deserialization keeps only the newest entries so a stored row can never
/// hand back more than [`WINDOW_SIZE`] results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Outcome>", into = "Vec<Outcome>")]
pub struct ResultWindow(Vec<Outcome>);

impl ResultWindow {
    pub fn push(&mut self, outcome: Outcome) {
        self.0.push(outcome);
        if self.0.len() > WINDOW_SIZE {
            let overflow = self.0.len() - WINDOW_SIZE;
            self.0.drain(..overflow);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.0.len() == WINDOW_SIZE
    }

    pub fn correct_count(&self) -> usize {
        self.0.iter().filter(|o| **o == Outcome::Correct).count()
    }

    pub fn as_slice(&self) -> &[Outcome] {
        &self.0
    }
}

impl From<Vec<Outcome>> for ResultWindow {
    fn from(outcomes: Vec<Outcome>) -> Self {
        let mut window = ResultWindow(Vec::with_capacity(WINDOW_SIZE));
        for outcome in outcomes {
            window.push(outcome);
        }
        window
    }
}

impl From<ResultWindow> for Vec<Outcome> {
    fn from(window: ResultWindow) -> Self {
        window.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(rename = "_id")]
    pub user_id: String,
    pub total_problems: u32,
    pub correct_problems: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_five_results: ResultWindow,
    pub current_difficulty: Difficulty,
    /// Newest last; written in the same conditional update as the counters.
    #[serde(default)]
    pub applied_submissions: Vec<String>,
    /// Compare-and-swap token for conditional writes.
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            total_problems: 0,
            correct_problems: 0,
            current_streak: 0,
            longest_streak: 0,
            last_five_results: ResultWindow::default(),
            current_difficulty: Difficulty::default(),
            applied_submissions: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn has_applied(&self, submission_id: &str) -> bool {
        self.applied_submissions.iter().any(|id| id == submission_id)
    }

    pub fn remember_applied(&mut self, submission_id: &str) {
        self.applied_submissions.push(submission_id.to_string());
        if self.applied_submissions.len() > APPLIED_HISTORY {
            let overflow = self.applied_submissions.len() - APPLIED_HISTORY;
            self.applied_submissions.drain(..overflow);
        }
    }

    pub fn accuracy_percent(&self) -> u32 {
        if self.total_problems == 0 {
            0
        } else {
            ((self.correct_problems as f64 / self.total_problems as f64) * 100.0).round() as u32
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub total_problems: u32,
    pub correct_problems: u32,
    pub accuracy: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_five_results: Vec<Outcome>,
    pub current_difficulty: Difficulty,
}

impl From<&Progress> for ProgressView {
    fn from(progress: &Progress) -> Self {
        Self {
            total_problems: progress.total_problems,
            correct_problems: progress.correct_problems,
            accuracy: progress.accuracy_percent(),
            current_streak: progress.current_streak,
            longest_streak: progress.longest_streak,
            last_five_results: progress.last_five_results.as_slice().to_vec(),
            current_difficulty: progress.current_difficulty,
        }
    }
}
