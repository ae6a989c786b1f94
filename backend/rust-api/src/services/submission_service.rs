use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::ANSWERS_SUBMITTED_TOTAL;
use crate::models::events::{ActivityKind, HubEvent, StudentActivity};
use crate::models::job::{GenerateFeedbackPayload, JobPayload};
use crate::models::session::GenerationStatus;
use crate::models::submission::{
    Submission, SubmissionView, SubmitAnswerRequest, SubmitAnswerResponse,
};
use crate::models::user::Identity;
use crate::services::notification_hub::{NotificationHub, Room};
use crate::services::queue::JobQueue;
use crate::services::store::RecordStore;

pub struct SubmissionService {
    store: Arc<dyn RecordStore>,
    queue: Arc<JobQueue>,
    hub: Arc<NotificationHub>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<JobQueue>, hub: Arc<NotificationHub>) -> Self {
        Self { store, queue, hub }
    }

    /// Grades the answer immediately and queues feedback generation.
    pub async fn submit(
        &self,
        identity: &Identity,
        request: SubmitAnswerRequest,
    ) -> Result<SubmitAnswerResponse, AppError> {
        if !request.user_answer.is_finite() {
            return Err(AppError::BadRequest("Answer must be a finite number".to_string()));
        }

        let session = self
            .store
            .get_session(&request.session_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
        if session.user_id != identity.user_id {
            return Err(AppError::Forbidden);
        }
        if session.job_status != GenerationStatus::Completed {
            return Err(AppError::Conflict("Problem is still being generated".to_string()));
        }

        let submission = Submission::new_pending(
            Uuid::new_v4().to_string(),
            session.id.clone(),
            identity.user_id.clone(),
            request.user_answer,
            session.correct_answer,
            request.time_taken,
        );
        self.store.insert_submission(&submission).await?;

        let queued = self
            .queue
            .enqueue(JobPayload::GenerateFeedback(GenerateFeedbackPayload {
                user_id: identity.user_id.clone(),
                session_id: session.id.clone(),
                submission_id: submission.id.clone(),
                problem_text: session.problem_text.clone(),
                correct_answer: session.correct_answer,
                user_answer: submission.user_answer,
                is_correct: submission.is_correct,
            }))
            .await;
        let job = match queued {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(submission_id = %submission.id, error = %e, "Could not queue feedback generation");
                if let Err(mark) = self.store.fail_feedback(&submission.id).await {
                    tracing::warn!(submission_id = %submission.id, error = %mark, "Could not mark feedback failed");
                }
                return Err(e.into());
            }
        };

        ANSWERS_SUBMITTED_TOTAL
            .with_label_values(&[if submission.is_correct { "true" } else { "false" }])
            .inc();
        tracing::info!(
            submission_id = %submission.id,
            session_id = %session.id,
            job_id = %job.id,
            is_correct = submission.is_correct,
            "Answer submitted"
        );

        self.hub
            .publish_to(
                &[Room::Teachers, Room::Admins],
                HubEvent::StudentActivity(StudentActivity {
                    user_id: identity.user_id.clone(),
                    user_name: identity.name.clone(),
                    action: ActivityKind::SubmittedAnswer,
                    timestamp: Utc::now(),
                    is_correct: Some(submission.is_correct),
                }),
            )
            .await;

        Ok(SubmitAnswerResponse {
            success: true,
            submission_id: submission.id,
            is_correct: submission.is_correct,
            correct_answer: session.correct_answer,
            job_id: job.id,
            status: submission.feedback_status,
            message: "Answer submitted. Feedback is being generated.".to_string(),
        })
    }

    pub async fn submission_view(
        &self,
        identity: &Identity,
        submission_id: &str,
    ) -> Result<SubmissionView, AppError> {
        let submission = self
            .store
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Submission not found".to_string()))?;
        if submission.user_id != identity.user_id {
            return Err(AppError::Forbidden);
        }
        Ok(SubmissionView::from(&submission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubSettings, QueueSettings};
    use crate::models::job::QueueName;
    use crate::models::session::{Difficulty, Session, SessionTransition};
    use crate::models::submission::{FeedbackStatus, FEEDBACK_PLACEHOLDER};
    use crate::models::user::UserRole;
    use crate::services::queue::{JobBackend, MemoryJobBackend, UnreachableJobBackend};
    use crate::services::store::MemoryRecordStore;

    async fn setup(completed: bool) -> (Arc<MemoryRecordStore>, Arc<JobQueue>, SubmissionService) {
        setup_over(completed, Arc::new(MemoryJobBackend::new(&QueueSettings::default()))).await
    }

    async fn setup_over(
        completed: bool,
        backend: Arc<dyn JobBackend>,
    ) -> (Arc<MemoryRecordStore>, Arc<JobQueue>, SubmissionService) {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .insert_session(&Session::new_pending("s1".into(), "u1".into(), Difficulty::Medium))
            .await
            .unwrap();
        if completed {
            store
                .transition_session("s1", &SessionTransition::Processing)
                .await
                .unwrap();
            store
                .transition_session(
                    "s1",
                    &SessionTransition::Completed {
                        problem_text: "What is 6 x 7?".into(),
                        correct_answer: 42.0,
                    },
                )
                .await
                .unwrap();
        }
        let queue = Arc::new(JobQueue::new(backend, &QueueSettings::default()));
        let hub = Arc::new(NotificationHub::new(&HubSettings::default()));
        let service = SubmissionService::new(store.clone(), queue.clone(), hub);
        (store, queue, service)
    }

    fn answer(value: f64) -> SubmitAnswerRequest {
        SubmitAnswerRequest {
            session_id: "s1".into(),
            user_answer: value,
            time_taken: Some(12),
        }
    }

    #[tokio::test]
    async fn grades_with_tolerance_and_queues_feedback() {
        let (store, queue, service) = setup(true).await;
        let owner = Identity::new("u1", "Ann", UserRole::Student);

        let close = service.submit(&owner, answer(41.995)).await.unwrap();
        assert!(close.is_correct);
        assert_eq!(close.status, FeedbackStatus::Pending);
        let off = service.submit(&owner, answer(41.98)).await.unwrap();
        assert!(!off.is_correct);

        let stored = store.get_submission(&close.submission_id).await.unwrap().unwrap();
        assert_eq!(stored.feedback_text, FEEDBACK_PLACEHOLDER);
        assert_eq!(stored.time_taken_seconds, Some(12));
        let counts = queue.counts(QueueName::FeedbackGeneration).await.unwrap();
        assert_eq!(counts.waiting, 2);
    }

    #[tokio::test]
    async fn pending_session_rejects_answers() {
        let (_, _, service) = setup(false).await;
        let owner = Identity::new("u1", "Ann", UserRole::Student);
        assert!(matches!(
            service.submit(&owner, answer(42.0)).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn only_the_owner_may_answer_or_read() {
        let (_, _, service) = setup(true).await;
        let owner = Identity::new("u1", "Ann", UserRole::Student);
        let other = Identity::new("u2", "Bob", UserRole::Student);
        assert!(matches!(
            service.submit(&other, answer(42.0)).await,
            Err(AppError::Forbidden)
        ));

        let submitted = service.submit(&owner, answer(42.0)).await.unwrap();
        assert!(service.submission_view(&owner, &submitted.submission_id).await.is_ok());
        let teacher = Identity::new("t1", "Teacher", UserRole::Teacher);
        assert!(matches!(
            service.submission_view(&teacher, &submitted.submission_id).await,
            Err(AppError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn non_finite_answer_is_rejected() {
        let (_, _, service) = setup(true).await;
        let owner = Identity::new("u1", "Ann", UserRole::Student);
        assert!(matches!(
            service.submit(&owner, answer(f64::NAN)).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn unqueued_submission_is_marked_failed() {
        let (store, _, service) = setup_over(true, Arc::new(UnreachableJobBackend)).await;
        let owner = Identity::new("u1", "Ann", UserRole::Student);

        assert!(matches!(
            service.submit(&owner, answer(42.0)).await,
            Err(AppError::Queue(_))
        ));

        let submissions = store.submissions_for_user("u1").await;
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].feedback_status, FeedbackStatus::Failed);
        assert!(!submissions[0].progress_applied);
    }
}
