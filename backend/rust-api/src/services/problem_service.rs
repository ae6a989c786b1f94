use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::SESSIONS_TOTAL;
use crate::models::events::{ActivityKind, HubEvent, StudentActivity};
use crate::models::job::{GenerateProblemPayload, JobPayload};
use crate::models::session::{GenerateProblemResponse, Session, SessionTransition, SessionView};
use crate::models::user::Identity;
use crate::services::notification_hub::{NotificationHub, Room};
use crate::services::queue::JobQueue;
use crate::services::store::{get_or_create_progress, RecordStore};

pub struct ProblemService {
    store: Arc<dyn RecordStore>,
    queue: Arc<JobQueue>,
    hub: Arc<NotificationHub>,
}

impl ProblemService {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<JobQueue>, hub: Arc<NotificationHub>) -> Self {
        Self { store, queue, hub }
    }

    /// Creates a pending Session at the student's current tier and queues its
    /// generation. Returns as soon as the job is durable.
    pub async fn generate(&self, identity: &Identity) -> Result<GenerateProblemResponse, AppError> {
        let progress = get_or_create_progress(self.store.as_ref(), &identity.user_id).await?;

        let session = Session::new_pending(
            Uuid::new_v4().to_string(),
            identity.user_id.clone(),
            progress.current_difficulty,
        );
        self.store.insert_session(&session).await?;

        let queued = self
            .queue
            .enqueue(JobPayload::GenerateProblem(GenerateProblemPayload {
                user_id: identity.user_id.clone(),
                session_id: session.id.clone(),
                difficulty_level: session.difficulty_level,
            }))
            .await;
        let job = match queued {
            Ok(job) => job,
            Err(e) => {
                // Nothing will ever pick the session up.
                tracing::error!(session_id = %session.id, error = %e, "Could not queue problem generation");
                if let Err(mark) = self
                    .store
                    .transition_session(&session.id, &SessionTransition::Failed)
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = %mark, "Could not mark session failed");
                }
                return Err(e.into());
            }
        };
        // The job is durable at this point; the link is informational.
        if let Err(e) = self.store.set_session_job(&session.id, &job.id).await {
            tracing::warn!(session_id = %session.id, job_id = %job.id, error = %e, "Could not link job to session");
        }

        SESSIONS_TOTAL.with_label_values(&["created"]).inc();
        tracing::info!(
            session_id = %session.id,
            job_id = %job.id,
            user_id = %identity.user_id,
            difficulty = session.difficulty_level.as_str(),
            "Problem generation queued"
        );

        self.hub
            .publish_to(
                &[Room::Teachers, Room::Admins],
                HubEvent::StudentActivity(StudentActivity {
                    user_id: identity.user_id.clone(),
                    user_name: identity.name.clone(),
                    action: ActivityKind::GeneratedProblem,
                    timestamp: Utc::now(),
                    is_correct: None,
                }),
            )
            .await;

        Ok(GenerateProblemResponse {
            success: true,
            session_id: session.id,
            job_id: job.id,
            status: session.job_status,
            message: "Problem generation started. You will be notified when ready.".to_string(),
        })
    }

    /// Session as the caller is allowed to see it. Staff may read any session;
    /// students only their own.
    pub async fn session_view(&self, identity: &Identity, session_id: &str) -> Result<SessionView, AppError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

        if session.user_id != identity.user_id && !identity.role.is_staff() {
            return Err(AppError::Forbidden);
        }

        let submissions = self.store.count_submissions(&session.id).await?;
        Ok(SessionView::project(&session, submissions as usize))
    }
}
