use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;

use crate::error::StoreError;
use crate::metrics::SESSIONS_TOTAL;
use crate::models::events::{HubEvent, ProblemGenerated};
use crate::models::job::{GenerateProblemPayload, Job, JobPayload, QueueName};
use crate::models::session::{GenerationStatus, Session, SessionTransition};
use crate::services::content_generator::ContentGenerator;
use crate::services::notification_hub::{NotificationHub, Room};
use crate::services::store::RecordStore;
use crate::services::worker_pool::JobHandler;

/// Turns a pending Session into a completed one.
pub struct ProblemGenerationHandler {
    store: Arc<dyn RecordStore>,
    generator: Arc<dyn ContentGenerator>,
    hub: Arc<NotificationHub>,
}

impl ProblemGenerationHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        generator: Arc<dyn ContentGenerator>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            store,
            generator,
            hub,
        }
    }

    async fn generate_and_store(
        &self,
        payload: &GenerateProblemPayload,
    ) -> anyhow::Result<Session> {
        let problem = self
            .generator
            .generate_problem(payload.difficulty_level)
            .await
            .context("generating problem")?;

        self.store
            .transition_session(
                &payload.session_id,
                &SessionTransition::Completed {
                    problem_text: problem.problem_text,
                    correct_answer: problem.final_answer,
                },
            )
            .await
            .context("storing generated problem")
    }
}

#[async_trait]
impl JobHandler for ProblemGenerationHandler {
    fn queue(&self) -> QueueName {
        QueueName::ProblemGeneration
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let JobPayload::GenerateProblem(payload) = job.payload() else {
            return Err(anyhow!("unexpected {} job on problem queue", job.payload().name()));
        };

        match self
            .store
            .transition_session(&payload.session_id, &SessionTransition::Processing)
            .await
        {
            Ok(_) => {}
            // A redelivered job for a session that already completed has nothing left to do.
            Err(StoreError::Transition(e)) if e.from == GenerationStatus::Completed => {
                tracing::info!(session_id = %payload.session_id, "Session already completed, skipping job");
                return Ok(());
            }
            Err(e) => return Err(e).context("marking session processing"),
        }

        let session = self.generate_and_store(payload).await?;
        SESSIONS_TOTAL.with_label_values(&["completed"]).inc();
        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            difficulty = session.difficulty_level.as_str(),
            "Problem generated"
        );

        self.hub
            .publish(
                Room::Student(session.user_id.clone()),
                HubEvent::ProblemGenerated(ProblemGenerated {
                    session_id: session.id,
                    problem_text: session.problem_text,
                    difficulty_level: session.difficulty_level,
                }),
            )
            .await;
        Ok(())
    }

    /// Readers see a failed attempt right away; a retry leases the job again
    /// and moves the session back to processing.
    async fn on_attempt_failed(&self, job: &Job, error: &str) {
        let JobPayload::GenerateProblem(payload) = job.payload() else {
            return;
        };
        match self
            .store
            .transition_session(&payload.session_id, &SessionTransition::Failed)
            .await
        {
            Ok(_) => tracing::debug!(session_id = %payload.session_id, error, "Recorded failed attempt"),
            Err(StoreError::Transition(_)) => {}
            Err(e) => {
                tracing::warn!(session_id = %payload.session_id, error = %e, "Could not record failed attempt")
            }
        }
    }

    async fn on_exhausted(&self, job: &Job, error: &str) {
        let JobPayload::GenerateProblem(payload) = job.payload() else {
            return;
        };
        // Usually written by the last failed attempt already.
        match self
            .store
            .transition_session(&payload.session_id, &SessionTransition::Failed)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Transition(e)) if e.from == GenerationStatus::Failed => {}
            Err(e) => {
                tracing::warn!(session_id = %payload.session_id, error = %e, "Could not mark session failed");
                return;
            }
        }
        SESSIONS_TOTAL.with_label_values(&["failed"]).inc();
        tracing::error!(session_id = %payload.session_id, error, "Session failed");
    }
}
