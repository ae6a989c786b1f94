use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Phase, Trackable};

pub const PROBLEM_PLACEHOLDER: &str = "Generating problem...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// One tier harder; HARD is the ceiling.
    pub fn step_up(self) -> Self {
        match self {
            Difficulty::Easy => Difficulty::Medium,
            Difficulty::Medium => Difficulty::Hard,
            Difficulty::Hard => Difficulty::Hard,
        }
    }

    /// One tier easier; EASY is the floor.
    pub fn step_down(self) -> Self {
        match self {
            Difficulty::Hard => Difficulty::Medium,
            Difficulty::Medium => Difficulty::Easy,
            Difficulty::Easy => Difficulty::Easy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::Medium
    }
}

/// Lifecycle of one problem-generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: GenerationStatus,
    pub to: GenerationStatus,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Processing => "processing",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }

    /// States a session may be in right before entering `self`.
    ///
    /// `processing -> processing` and `failed -> processing` cover a retried
    /// job being leased again after a failed attempt. `completed` is never
    /// left, and `failed` is final once the job has no attempts left.
    /// `pending -> failed` covers a job that could not be queued or exhausted
    /// before any worker marked it processing.
    pub fn allowed_sources(&self) -> &'static [GenerationStatus] {
        match self {
            GenerationStatus::Pending => &[],
            GenerationStatus::Processing => &[
                GenerationStatus::Pending,
                GenerationStatus::Processing,
                GenerationStatus::Failed,
            ],
            GenerationStatus::Completed => &[GenerationStatus::Processing],
            GenerationStatus::Failed => &[GenerationStatus::Pending, GenerationStatus::Processing],
        }
    }

    pub fn transition(self, to: GenerationStatus) -> Result<GenerationStatus, TransitionError> {
        if to.allowed_sources().contains(&self) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            GenerationStatus::Pending => Phase::Pending,
            GenerationStatus::Processing => Phase::Running,
            GenerationStatus::Completed => Phase::Succeeded,
            GenerationStatus::Failed => Phase::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub problem_text: String,
    /// Authoritative only once `job_status` is `completed`.
    pub correct_answer: f64,
    pub difficulty_level: Difficulty,
    pub job_status: GenerationStatus,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_pending(id: String, user_id: String, difficulty_level: Difficulty) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            problem_text: PROBLEM_PLACEHOLDER.to_string(),
            correct_answer: 0.0,
            difficulty_level,
            job_status: GenerationStatus::Pending,
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Trackable for Session {
    fn phase(&self) -> Phase {
        self.job_status.phase()
    }
}

/// A state change applied to a stored session by the worker owning its job.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionTransition {
    Processing,
    Completed {
        problem_text: String,
        correct_answer: f64,
    },
    Failed,
}

impl SessionTransition {
    pub fn target(&self) -> GenerationStatus {
        match self {
            SessionTransition::Processing => GenerationStatus::Processing,
            SessionTransition::Completed { .. } => GenerationStatus::Completed,
            SessionTransition::Failed => GenerationStatus::Failed,
        }
    }

    pub fn apply(&self, session: &mut Session) -> Result<(), TransitionError> {
        session.job_status = session.job_status.transition(self.target())?;
        if let SessionTransition::Completed {
            problem_text,
            correct_answer,
        } = self
        {
            session.problem_text = problem_text.clone();
            session.correct_answer = *correct_answer;
        }
        session.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateProblemResponse {
    pub success: bool,
    pub session_id: String,
    pub job_id: String,
    pub status: GenerationStatus,
    pub message: String,
}

/// Session projected through the read boundary.
///
/// `correct_answer` is only filled in once the problem is generated and the
/// student has answered at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub user_id: String,
    pub problem_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<f64>,
    pub difficulty_level: Difficulty,
    pub job_status: GenerationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submission_count: usize,
}

impl SessionView {
    pub fn project(session: &Session, submission_count: usize) -> Self {
        let answer_visible =
            session.job_status == GenerationStatus::Completed && submission_count > 0;
        Self {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            problem_text: session.problem_text.clone(),
            correct_answer: answer_visible.then_some(session.correct_answer),
            difficulty_level: session.difficulty_level,
            job_status: session.job_status,
            created_at: session.created_at,
            submission_count,
        }
    }
}

impl Trackable for SessionView {
    fn phase(&self) -> Phase {
        self.job_status.phase()
    }
}
