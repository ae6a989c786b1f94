use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::Difficulty;
use crate::utils::retry::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "problem-generation")]
    ProblemGeneration,
    #[serde(rename = "feedback-generation")]
    FeedbackGeneration,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::ProblemGeneration, QueueName::FeedbackGeneration];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ProblemGeneration => "problem-generation",
            QueueName::FeedbackGeneration => "feedback-generation",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            QueueName::ProblemGeneration => "Problem Generation",
            QueueName::FeedbackGeneration => "Feedback Generation",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            QueueName::ProblemGeneration => 0,
            QueueName::FeedbackGeneration => 1,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "problem-generation" => Ok(QueueName::ProblemGeneration),
            "feedback-generation" => Ok(QueueName::FeedbackGeneration),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateProblemPayload {
    pub user_id: String,
    pub session_id: String,
    pub difficulty_level: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateFeedbackPayload {
    pub user_id: String,
    pub session_id: String,
    pub submission_id: String,
    pub problem_text: String,
    pub correct_answer: f64,
    pub user_answer: f64,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum JobPayload {
    #[serde(rename = "generate-problem")]
    GenerateProblem(GenerateProblemPayload),
    #[serde(rename = "generate-feedback")]
    GenerateFeedback(GenerateFeedbackPayload),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::GenerateProblem(_) => QueueName::ProblemGeneration,
            JobPayload::GenerateFeedback(_) => QueueName::FeedbackGeneration,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::GenerateProblem(_) => "generate-problem",
            JobPayload::GenerateFeedback(_) => "generate-feedback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// What the queue does with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { next_attempt_at: DateTime<Utc> },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    payload: JobPayload,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Deadline of the current or most recent lease. Only the holder of
    /// this exact deadline may acknowledge the job.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, payload: JobPayload, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: payload.queue(),
            payload,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Waiting,
            next_attempt_at: now,
            last_error: None,
            lease_expires_at: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Payload is fixed at enqueue time.
    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// 1-based number of the attempt currently running.
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count + 1
    }

    pub fn mark_active(&mut self, lease_until: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.lease_expires_at = Some(lease_until);
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease_expires_at.is_some_and(|until| until <= now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.last_error = None;
    }

    pub fn record_failure(
        &mut self,
        error: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());

        let policy = BackoffPolicy {
            max_attempts: self.max_attempts,
            ..*policy
        };

        if policy.is_exhausted(self.attempt_count) {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            return FailureOutcome::Exhausted;
        }

        let delay = policy.delay_after(self.attempt_count);
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        self.status = JobStatus::Waiting;
        self.next_attempt_at = now + delay;
        FailureOutcome::Retry {
            next_attempt_at: self.next_attempt_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub name: &'static str,
    pub queue_name: QueueName,
    #[serde(flatten)]
    pub counts: QueueCounts,
}
