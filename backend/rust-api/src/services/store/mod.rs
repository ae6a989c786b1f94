//! Record Store: durable state for sessions, submissions, progress and badge
//! awards. Every mutation the pipeline relies on for correctness is a
//! conditional write, so concurrent workers cannot clobber one another.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::badge::UserBadge;
use crate::models::progress::Progress;
use crate::models::session::{Session, SessionTransition};
use crate::models::submission::Submission;

pub mod memory;
pub mod mongo;

pub use memory::MemoryRecordStore;
pub use mongo::MongoRecordStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn set_session_job(&self, id: &str, job_id: &str) -> Result<(), StoreError>;

    /// Applies `transition` only if the session is currently in one of the
    /// target's allowed source states. Returns the updated session.
    async fn transition_session(
        &self,
        id: &str,
        transition: &SessionTransition,
    ) -> Result<Session, StoreError>;

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError>;

    async fn count_submissions(&self, session_id: &str) -> Result<u64, StoreError>;

    /// pending -> ready, writing the final feedback text.
    async fn complete_feedback(
        &self,
        submission_id: &str,
        feedback_text: &str,
    ) -> Result<Submission, StoreError>;

    /// pending -> failed. A submission that already left `pending` is left
    /// untouched and `false` is returned.
    async fn fail_feedback(&self, submission_id: &str) -> Result<bool, StoreError>;

    /// Records that the submission's result reached its user's progress.
    /// Returns `false` if it was already marked.
    async fn mark_progress_applied(&self, submission_id: &str) -> Result<bool, StoreError>;

    async fn get_progress(&self, user_id: &str) -> Result<Option<Progress>, StoreError>;

    /// Writes `next` if the stored version still equals `expected_version`
    /// (`None`: no row may exist yet). Returns `false` when another writer won.
    async fn compare_and_swap_progress(
        &self,
        expected_version: Option<u64>,
        next: &Progress,
    ) -> Result<bool, StoreError>;

    /// Returns `false` if the user already holds this badge.
    async fn insert_badge(&self, badge: &UserBadge) -> Result<bool, StoreError>;

    async fn list_badges(&self, user_id: &str) -> Result<Vec<UserBadge>, StoreError>;
}

/// Reads the user's progress, creating the initial MEDIUM record if absent.
pub async fn get_or_create_progress(
    store: &dyn RecordStore,
    user_id: &str,
) -> Result<Progress, StoreError> {
    if let Some(progress) = store.get_progress(user_id).await? {
        return Ok(progress);
    }

    let fresh = Progress::new(user_id);
    if store.compare_and_swap_progress(None, &fresh).await? {
        return Ok(fresh);
    }

    // Lost the creation race; the winner's row is there now.
    store
        .get_progress(user_id)
        .await?
        .ok_or_else(|| StoreError::Conflict {
            entity: "progress",
            id: user_id.to_string(),
        })
}
