use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{Phase, Trackable};

pub const FEEDBACK_PLACEHOLDER: &str = "Generating feedback...";

/// Absolute difference under which an answer counts as correct.
pub const ANSWER_TOLERANCE: f64 = 0.01;

pub fn is_answer_correct(user_answer: f64, correct_answer: f64) -> bool {
    (user_answer - correct_answer).abs() < ANSWER_TOLERANCE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Ready,
    Failed,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Ready => "ready",
            FeedbackStatus::Failed => "failed",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            FeedbackStatus::Pending => Phase::Running,
            FeedbackStatus::Ready => Phase::Succeeded,
            FeedbackStatus::Failed => Phase::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_answer: f64,
    pub is_correct: bool,
    pub feedback_text: String,
    pub feedback_status: FeedbackStatus,
    #[serde(default)]
    pub progress_applied: bool,
    pub time_taken_seconds: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn new_pending(
        id: String,
        session_id: String,
        user_id: String,
        user_answer: f64,
        correct_answer: f64,
        time_taken_seconds: Option<u32>,
    ) -> Self {
        Self {
            id,
            session_id,
            user_id,
            user_answer,
            is_correct: is_answer_correct(user_answer, correct_answer),
            feedback_text: FEEDBACK_PLACEHOLDER.to_string(),
            feedback_status: FeedbackStatus::Pending,
            progress_applied: false,
            time_taken_seconds,
            created_at: Utc::now(),
        }
    }
}

impl Trackable for Submission {
    fn phase(&self) -> Phase {
        self.feedback_status.phase()
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerRequest {
    #[validate(length(min = 1, max = 64))]
    pub session_id: String,
    pub user_answer: f64,
    #[validate(range(max = 86400))]
    pub time_taken: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerResponse {
    pub success: bool,
    pub submission_id: String,
    pub is_correct: bool,
    pub correct_answer: f64,
    pub job_id: String,
    pub status: FeedbackStatus,
    pub message: String,
}

/// Submission as returned to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionView {
    pub id: String,
    pub session_id: String,
    pub user_answer: f64,
    pub is_correct: bool,
    pub feedback_text: String,
    pub feedback_status: FeedbackStatus,
    pub time_taken: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl From<&Submission> for SubmissionView {
    fn from(submission: &Submission) -> Self {
        Self {
            id: submission.id.clone(),
            session_id: submission.session_id.clone(),
            user_answer: submission.user_answer,
            is_correct: submission.is_correct,
            feedback_text: submission.feedback_text.clone(),
            feedback_status: submission.feedback_status,
            time_taken: submission.time_taken_seconds,
            created_at: submission.created_at,
        }
    }
}

impl Trackable for SubmissionView {
    fn phase(&self) -> Phase {
        self.feedback_status.phase()
    }
}
