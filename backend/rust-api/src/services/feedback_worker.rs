use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;

use crate::models::events::{FeedbackReady, HubEvent};
use crate::models::job::{Job, JobPayload, QueueName};
use crate::models::Trackable;
use crate::services::content_generator::ContentGenerator;
use crate::services::notification_hub::{NotificationHub, Room};
use crate::services::progress_service::ProgressService;
use crate::services::store::RecordStore;
use crate::services::worker_pool::JobHandler;

/// Writes feedback for a graded submission and folds the result into the
/// student's progress exactly once.
pub struct FeedbackGenerationHandler {
    store: Arc<dyn RecordStore>,
    generator: Arc<dyn ContentGenerator>,
    progress: Arc<ProgressService>,
    hub: Arc<NotificationHub>,
}

impl FeedbackGenerationHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        generator: Arc<dyn ContentGenerator>,
        progress: Arc<ProgressService>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            store,
            generator,
            progress,
            hub,
        }
    }
}

#[async_trait]
impl JobHandler for FeedbackGenerationHandler {
    fn queue(&self) -> QueueName {
        QueueName::FeedbackGeneration
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let JobPayload::GenerateFeedback(payload) = job.payload() else {
            return Err(anyhow!("unexpected {} job on feedback queue", job.payload().name()));
        };

        let submission = self
            .store
            .get_submission(&payload.submission_id)
            .await?
            .ok_or_else(|| anyhow!("submission {} not found", payload.submission_id))?;
        if submission.is_terminal() {
            tracing::info!(
                submission_id = %submission.id,
                status = submission.feedback_status.as_str(),
                "Feedback already final, skipping job"
            );
            return Ok(());
        }

        let feedback = self
            .generator
            .generate_feedback(payload)
            .await
            .context("generating feedback")?;

        // Progress is applied before feedback turns ready, so a client that
        // sees `ready` also sees the updated progress. A retry after a failed
        // update runs it again; the progress row itself ignores a result it
        // has already counted.
        let new_badges = if submission.progress_applied {
            Vec::new()
        } else {
            let update = self
                .progress
                .record_result(&payload.user_id, &payload.submission_id, payload.is_correct)
                .await
                .context("updating progress")?;
            self.store
                .mark_progress_applied(&payload.submission_id)
                .await
                .context("marking progress applied")?;
            update.new_badges
        };

        let submission = self
            .store
            .complete_feedback(&payload.submission_id, &feedback)
            .await
            .context("storing feedback")?;

        tracing::info!(
            submission_id = %submission.id,
            user_id = %submission.user_id,
            is_correct = submission.is_correct,
            badges = new_badges.len(),
            "Feedback generated"
        );

        self.hub
            .publish(
                Room::Student(submission.user_id.clone()),
                HubEvent::FeedbackReady(FeedbackReady {
                    submission_id: submission.id,
                    session_id: submission.session_id,
                    feedback: submission.feedback_text,
                    is_correct: submission.is_correct,
                    new_badges,
                }),
            )
            .await;
        Ok(())
    }

    async fn on_exhausted(&self, job: &Job, error: &str) {
        let JobPayload::GenerateFeedback(payload) = job.payload() else {
            return;
        };
        match self.store.fail_feedback(&payload.submission_id).await {
            Ok(true) => {
                tracing::error!(submission_id = %payload.submission_id, error, "Feedback failed")
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(
                submission_id = %payload.submission_id,
                error = %e,
                "Could not mark feedback failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::Utc;

    use crate::config::HubSettings;
    use crate::error::{GeneratorError, StoreError};
    use crate::models::badge::UserBadge;
    use crate::models::job::GenerateFeedbackPayload;
    use crate::models::progress::Progress;
    use crate::models::session::{Difficulty, Session, SessionTransition};
    use crate::models::submission::{FeedbackStatus, Submission};
    use crate::services::badge_engine::BadgeEngine;
    use crate::services::content_generator::GeneratedProblem;
    use crate::services::store::MemoryRecordStore;

    struct CountingGenerator {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentGenerator for CountingGenerator {
        async fn generate_problem(
            &self,
            _difficulty: Difficulty,
        ) -> Result<GeneratedProblem, GeneratorError> {
            Err(GeneratorError::Empty)
        }

        async fn generate_feedback(
            &self,
            _payload: &GenerateFeedbackPayload,
        ) -> Result<String, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GeneratorError::Timeout(std::time::Duration::from_secs(30)));
            }
            Ok("Great work, 42 is right.".into())
        }
    }

    /// Memory store whose first versioned progress write fails.
    struct FlakyProgressStore {
        inner: MemoryRecordStore,
        fail_next_update: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for FlakyProgressStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
            self.inner.insert_session(session).await
        }

        async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.get_session(id).await
        }

        async fn set_session_job(&self, id: &str, job_id: &str) -> Result<(), StoreError> {
            self.inner.set_session_job(id, job_id).await
        }

        async fn transition_session(
            &self,
            id: &str,
            transition: &SessionTransition,
        ) -> Result<Session, StoreError> {
            self.inner.transition_session(id, transition).await
        }

        async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
            self.inner.insert_submission(submission).await
        }

        async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
            self.inner.get_submission(id).await
        }

        async fn count_submissions(&self, session_id: &str) -> Result<u64, StoreError> {
            self.inner.count_submissions(session_id).await
        }

        async fn complete_feedback(
            &self,
            submission_id: &str,
            feedback_text: &str,
        ) -> Result<Submission, StoreError> {
            self.inner.complete_feedback(submission_id, feedback_text).await
        }

        async fn fail_feedback(&self, submission_id: &str) -> Result<bool, StoreError> {
            self.inner.fail_feedback(submission_id).await
        }

        async fn mark_progress_applied(&self, submission_id: &str) -> Result<bool, StoreError> {
            self.inner.mark_progress_applied(submission_id).await
        }

        async fn get_progress(&self, user_id: &str) -> Result<Option<Progress>, StoreError> {
            self.inner.get_progress(user_id).await
        }

        async fn compare_and_swap_progress(
            &self,
            expected_version: Option<u64>,
            next: &Progress,
        ) -> Result<bool, StoreError> {
            if expected_version.is_some() && self.fail_next_update.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("transient".into()));
            }
            self.inner.compare_and_swap_progress(expected_version, next).await
        }

        async fn insert_badge(&self, badge: &UserBadge) -> Result<bool, StoreError> {
            self.inner.insert_badge(badge).await
        }

        async fn list_badges(&self, user_id: &str) -> Result<Vec<UserBadge>, StoreError> {
            self.inner.list_badges(user_id).await
        }
    }

    fn feedback_job() -> Job {
        Job::new(
            "j1".into(),
            JobPayload::GenerateFeedback(GenerateFeedbackPayload {
                user_id: "u1".into(),
                session_id: "s1".into(),
                submission_id: "sub1".into(),
                problem_text: "What is 7 x 6?".into(),
                correct_answer: 42.0,
                user_answer: 42.0,
                is_correct: true,
            }),
            3,
            Utc::now(),
        )
    }

    async fn handler_over<S: RecordStore + 'static>(
        store: Arc<S>,
        fail: bool,
    ) -> FeedbackGenerationHandler {
        store
            .insert_submission(&Submission::new_pending(
                "sub1".into(),
                "s1".into(),
                "u1".into(),
                42.0,
                42.0,
                None,
            ))
            .await
            .unwrap();

        let record_store: Arc<dyn RecordStore> = store;
        let progress = Arc::new(ProgressService::new(record_store.clone(), BadgeEngine::default()));
        FeedbackGenerationHandler::new(
            record_store,
            Arc::new(CountingGenerator {
                fail,
                calls: AtomicUsize::new(0),
            }),
            progress,
            Arc::new(NotificationHub::new(&HubSettings::default())),
        )
    }

    async fn fixture(fail: bool) -> (Arc<MemoryRecordStore>, FeedbackGenerationHandler, Job) {
        let store = Arc::new(MemoryRecordStore::new());
        let handler = handler_over(store.clone(), fail).await;
        (store, handler, feedback_job())
    }

    #[tokio::test]
    async fn ready_feedback_applies_progress_once() {
        let (store, handler, job) = fixture(false).await;

        handler.handle(&job).await.unwrap();
        handler.handle(&job).await.unwrap();

        let submission = store.get_submission("sub1").await.unwrap().unwrap();
        assert_eq!(submission.feedback_status, FeedbackStatus::Ready);
        assert!(submission.progress_applied);
        let progress = store.get_progress("u1").await.unwrap().unwrap();
        assert_eq!(progress.total_problems, 1);
        assert_eq!(progress.correct_problems, 1);
    }

    #[tokio::test]
    async fn exhausted_feedback_fails_without_touching_progress() {
        let (store, handler, job) = fixture(true).await;

        assert!(handler.handle(&job).await.is_err());
        handler.on_exhausted(&job, "timeout").await;

        let submission = store.get_submission("sub1").await.unwrap().unwrap();
        assert_eq!(submission.feedback_status, FeedbackStatus::Failed);
        assert!(!submission.progress_applied);
        assert!(store.get_progress("u1").await.unwrap().is_none());
        assert!(store.list_badges("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_progress_update_is_applied_on_retry() {
        let store = Arc::new(FlakyProgressStore {
            inner: MemoryRecordStore::new(),
            fail_next_update: AtomicBool::new(true),
        });
        let handler = handler_over(store.clone(), false).await;
        let job = feedback_job();

        let err = handler.handle(&job).await.unwrap_err();
        assert!(format!("{err:#}").contains("updating progress"));
        let submission = store.get_submission("sub1").await.unwrap().unwrap();
        assert_eq!(submission.feedback_status, FeedbackStatus::Pending);
        assert!(!submission.progress_applied);

        handler.handle(&job).await.unwrap();

        let submission = store.get_submission("sub1").await.unwrap().unwrap();
        assert_eq!(submission.feedback_status, FeedbackStatus::Ready);
        assert!(submission.progress_applied);
        let progress = store.get_progress("u1").await.unwrap().unwrap();
        assert_eq!(progress.total_problems, 1);
        assert_eq!(progress.current_streak, 1);
    }

    #[tokio::test]
    async fn result_counted_before_a_lost_mark_is_not_counted_again() {
        let (store, handler, job) = fixture(false).await;
        // A previous attempt updated progress but died before marking the submission.
        handler
            .progress
            .record_result("u1", "sub1", true)
            .await
            .unwrap();

        handler.handle(&job).await.unwrap();

        let progress = store.get_progress("u1").await.unwrap().unwrap();
        assert_eq!(progress.total_problems, 1);
        assert!(store.get_submission("sub1").await.unwrap().unwrap().progress_applied);
    }
}
