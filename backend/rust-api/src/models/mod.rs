use serde::{Deserialize, Serialize};

pub mod badge;
pub mod events;
pub mod job;
pub mod progress;
pub mod session;
pub mod submission;
pub mod user;

pub use badge::{BadgeRule, BadgeType, UserBadge};
pub use job::{Job, JobPayload, JobStatus, QueueName};
pub use progress::{Outcome, Progress};
pub use session::{Difficulty, GenerationStatus, Session, SessionTransition};
pub use submission::{FeedbackStatus, Submission};
pub use user::{Identity, UserRole};

/// Coarse lifecycle shared by every record a client waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Single terminal-state predicate used by both the push path and the poller.
pub trait Trackable {
    fn phase(&self) -> Phase;

    fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}
