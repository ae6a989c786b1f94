use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RecordStore;
use crate::error::StoreError;
use crate::models::badge::UserBadge;
use crate::models::progress::Progress;
use crate::models::session::{Session, SessionTransition};
use crate::models::submission::{FeedbackStatus, Submission};

/// In-process store used by tests and single-binary dev runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    sessions: RwLock<HashMap<String, Session>>,
    submissions: RwLock<HashMap<String, Submission>>,
    progress: RwLock<HashMap<String, Progress>>,
    badges: RwLock<HashMap<String, UserBadge>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn submissions_for_user(&self, user_id: &str) -> Vec<Submission> {
        self.submissions
            .read()
            .await
            .values()
            .filter(|submission| submission.user_id == user_id)
            .cloned()
            .collect()
    }
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate {
                entity: "session",
                id: session.id.clone(),
            });
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn set_session_job(&self, id: &str, job_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found("session", id))?;
        session.job_id = Some(job_id.to_string());
        Ok(())
    }

    async fn transition_session(
        &self,
        id: &str,
        transition: &SessionTransition,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found("session", id))?;
        let mut next = session.clone();
        transition.apply(&mut next)?;
        *session = next.clone();
        Ok(next)
    }

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut submissions = self.submissions.write().await;
        if submissions.contains_key(&submission.id) {
            return Err(StoreError::Duplicate {
                entity: "submission",
                id: submission.id.clone(),
            });
        }
        submissions.insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions.read().await.get(id).cloned())
    }

    async fn count_submissions(&self, session_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.session_id == session_id)
            .count() as u64)
    }

    async fn complete_feedback(
        &self,
        submission_id: &str,
        feedback_text: &str,
    ) -> Result<Submission, StoreError> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(submission_id)
            .ok_or_else(|| not_found("submission", submission_id))?;
        if submission.feedback_status != FeedbackStatus::Pending {
            return Err(StoreError::Conflict {
                entity: "submission",
                id: submission_id.to_string(),
            });
        }
        submission.feedback_text = feedback_text.to_string();
        submission.feedback_status = FeedbackStatus::Ready;
        Ok(submission.clone())
    }

    async fn fail_feedback(&self, submission_id: &str) -> Result<bool, StoreError> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(submission_id)
            .ok_or_else(|| not_found("submission", submission_id))?;
        if submission.feedback_status != FeedbackStatus::Pending {
            return Ok(false);
        }
        submission.feedback_status = FeedbackStatus::Failed;
        Ok(true)
    }

    async fn mark_progress_applied(&self, submission_id: &str) -> Result<bool, StoreError> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(submission_id)
            .ok_or_else(|| not_found("submission", submission_id))?;
        if submission.progress_applied {
            return Ok(false);
        }
        submission.progress_applied = true;
        Ok(true)
    }

    async fn get_progress(&self, user_id: &str) -> Result<Option<Progress>, StoreError> {
        Ok(self.progress.read().await.get(user_id).cloned())
    }

    async fn compare_and_swap_progress(
        &self,
        expected_version: Option<u64>,
        next: &Progress,
    ) -> Result<bool, StoreError> {
        let mut progress = self.progress.write().await;
        let current = progress.get(&next.user_id).map(|p| p.version);
        if current != expected_version {
            return Ok(false);
        }
        progress.insert(next.user_id.clone(), next.clone());
        Ok(true)
    }

    async fn insert_badge(&self, badge: &UserBadge) -> Result<bool, StoreError> {
        let mut badges = self.badges.write().await;
        if badges.contains_key(&badge.id) {
            return Ok(false);
        }
        badges.insert(badge.id.clone(), badge.clone());
        Ok(true)
    }

    async fn list_badges(&self, user_id: &str) -> Result<Vec<UserBadge>, StoreError> {
        let mut owned: Vec<UserBadge> = self
            .badges
            .read()
            .await
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by_key(|b| b.earned_at);
        Ok(owned)
    }
}
