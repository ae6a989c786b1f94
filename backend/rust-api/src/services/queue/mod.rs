//! Durable job queues with at-least-once delivery.
//!
//! A job is leased by exactly one worker at a time, until its lease
//! deadline. A failed attempt is rescheduled with exponential backoff until
//! its attempt budget runs out, after which it lands in the failed set. A
//! lease that runs out before the job is acknowledged is handed to another
//! worker, which records it as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::metrics::JOBS_ENQUEUED_TOTAL;
use crate::models::job::{FailureOutcome, Job, JobPayload, QueueCounts, QueueName};
use crate::utils::retry::BackoffPolicy;

pub mod memory;
pub mod redis_backend;

pub use memory::MemoryJobBackend;
pub use redis_backend::RedisJobBackend;

/// Persistence for job records and their schedule.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn ping(&self) -> Result<(), QueueError>;

    /// Stores `job` and schedules it at `job.next_attempt_at`.
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Atomically moves the earliest due job of `queue` to the active set,
    /// leased until `lease_until`.
    async fn claim_due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Atomically re-leases the active job whose lease expired first to the
    /// caller, until `lease_until`. The previous holder can no longer
    /// acknowledge it.
    async fn reclaim_expired(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// The complete, reschedule and fail calls reject a `job` whose lease
    /// deadline is no longer the current one.
    async fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Active job goes back to the schedule at `job.next_attempt_at`.
    async fn reschedule(&self, job: &Job) -> Result<(), QueueError>;

    async fn fail(&self, job: &Job) -> Result<(), QueueError>;

    async fn counts(&self, queue: QueueName, now: DateTime<Utc>)
        -> Result<QueueCounts, QueueError>;
}

pub struct JobQueue {
    backend: Arc<dyn JobBackend>,
    policy: BackoffPolicy,
    lease_poll: Duration,
    lease_timeout: Duration,
    wakeups: [Notify; 2],
}

impl JobQueue {
    pub fn new(backend: Arc<dyn JobBackend>, settings: &QueueSettings) -> Self {
        Self {
            backend,
            policy: settings.backoff_policy(),
            lease_poll: settings.lease_poll(),
            lease_timeout: settings.lease_timeout(),
            wakeups: [Notify::new(), Notify::new()],
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<Job, QueueError> {
        let job = Job::new(
            Uuid::new_v4().to_string(),
            payload,
            self.policy.max_attempts,
            Utc::now(),
        );
        self.backend.push(&job).await?;

        JOBS_ENQUEUED_TOTAL
            .with_label_values(&[job.queue.as_str()])
            .inc();
        tracing::info!(
            job_id = %job.id,
            queue = %job.queue,
            name = job.payload().name(),
            "Job enqueued"
        );

        self.wakeups[job.queue.index()].notify_one();
        Ok(job)
    }

    pub async fn try_lease(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        self.backend
            .claim_due(queue, now, self.lease_deadline(now))
            .await
    }

    /// Takes over one job whose lease ran out. The caller owns the returned
    /// job and is expected to [`nack`](Self::nack) it.
    pub async fn reclaim_stalled(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let job = self
            .backend
            .reclaim_expired(queue, now, self.lease_deadline(now))
            .await?;
        if let Some(job) = &job {
            tracing::warn!(
                job_id = %job.id,
                queue = %queue,
                attempt = job.current_attempt(),
                "Reclaimed job with expired lease"
            );
        }
        Ok(job)
    }

    /// Waits up to `max_wait` for a due job. Returns `None` on timeout.
    ///
    /// Dropping the returned future before it resolves leaves the queue
    /// untouched: the claim itself is a single backend call.
    pub async fn lease(
        &self,
        queue: QueueName,
        max_wait: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(job) = self.try_lease(queue).await? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Delayed jobs become due without a notification; poll for them.
            let nap = self.lease_poll.min(deadline - now);
            let _ = tokio::time::timeout(nap, self.wakeups[queue.index()].notified()).await;
        }
    }

    pub async fn ack(&self, job: &mut Job) -> Result<(), QueueError> {
        job.mark_completed(Utc::now());
        self.backend.complete(job).await
    }

    /// Records a failed attempt and either reschedules the job or moves it
    /// to the failed set.
    pub async fn nack(&self, job: &mut Job, error: &str) -> Result<FailureOutcome, QueueError> {
        let outcome = job.record_failure(error, &self.policy, Utc::now());
        match outcome {
            FailureOutcome::Retry { .. } => self.backend.reschedule(job).await?,
            FailureOutcome::Exhausted => self.backend.fail(job).await?,
        }
        Ok(outcome)
    }

    pub async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        self.backend.counts(queue, Utc::now()).await
    }
}

/// Backend whose every call fails, for exercising enqueue errors.
#[cfg(test)]
pub(crate) struct UnreachableJobBackend;

#[cfg(test)]
#[async_trait]
impl JobBackend for UnreachableJobBackend {
    async fn ping(&self) -> Result<(), QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn push(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn claim_due(
        &self,
        _queue: QueueName,
        _now: DateTime<Utc>,
        _lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn reclaim_expired(
        &self,
        _queue: QueueName,
        _now: DateTime<Utc>,
        _lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn complete(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn reschedule(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn fail(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }

    async fn counts(
        &self,
        _queue: QueueName,
        _now: DateTime<Utc>,
    ) -> Result<QueueCounts, QueueError> {
        Err(QueueError::Backend("connection refused".into()))
    }
}
