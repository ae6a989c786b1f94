use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::metrics::record_job_attempt;
use crate::models::events::{HubEvent, QueueUpdate};
use crate::models::job::{FailureOutcome, Job, QueueName};
use crate::services::notification_hub::{NotificationHub, Room};
use crate::services::queue::JobQueue;
use crate::utils::retry::{retry_async_with_config, RetryConfig};

/// How long an idle worker waits for a job before re-checking for shutdown
/// and stalled leases.
const IDLE_LEASE_WAIT: Duration = Duration::from_millis(500);

const LEASE_EXPIRED: &str = "lease expired before the job was acknowledged";

/// Domain work for one queue. Handlers never touch retry state; the pool
/// acks on `Ok`, nacks on `Err`, and calls [`JobHandler::on_exhausted`] once
/// the job's attempt budget is spent.
///
/// A lease that expires while its worker is stuck counts as a failed
/// attempt too. It goes through the same hooks, from whichever worker
/// reclaims it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job) -> anyhow::Result<()>;

    /// Runs for every failed attempt, before the queue records it.
    async fn on_attempt_failed(&self, _job: &Job, _error: &str) {}

    async fn on_exhausted(&self, job: &Job, error: &str);
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers for every handler.
    pub fn spawn(
        queue: Arc<JobQueue>,
        hub: Arc<NotificationHub>,
        handlers: Vec<Arc<dyn JobHandler>>,
        concurrency: usize,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for handler in handlers {
            let queue_name = handler.queue();
            info!(queue = %queue_name, concurrency, "Starting worker pool");
            for worker_id in 0..concurrency.max(1) {
                let worker = Worker {
                    queue: queue.clone(),
                    hub: hub.clone(),
                    handler: handler.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                let span = tracing::info_span!("worker", queue = %queue_name, worker = worker_id);
                handles.push(tokio::spawn(worker.run().instrument(span)));
            }
        }

        Self { handles, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker to stop and waits for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pools stopped");
    }
}

struct Worker {
    queue: Arc<JobQueue>,
    hub: Arc<NotificationHub>,
    handler: Arc<dyn JobHandler>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        let queue_name = self.handler.queue();
        // A lease is never raced against shutdown: a claimed job is always
        // handled and acknowledged before the flag is looked at again.
        while !*self.shutdown.borrow() {
            match self.queue.reclaim_stalled(queue_name).await {
                Ok(Some(job)) => {
                    let elapsed = self.queue.lease_timeout().as_secs_f64();
                    self.record_failure(job, LEASE_EXPIRED.to_string(), elapsed)
                        .await;
                    self.publish_counts(queue_name).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Could not check for stalled jobs"),
            }

            match self.queue.lease(queue_name, IDLE_LEASE_WAIT).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Lease failed, backing off");
                    tokio::time::sleep(IDLE_LEASE_WAIT).await;
                }
            }
        }
    }

    async fn process(&self, job: Job) {
        let queue_name = job.queue;
        let attempt = job.current_attempt();
        let started = Instant::now();
        info!(job_id = %job.id, attempt, name = job.payload().name(), "Processing job");

        let result = AssertUnwindSafe(self.handler.handle(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("job handler panicked")));
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                let queue = &*self.queue;
                let acked = retry_async_with_config(RetryConfig::default(), || {
                    let mut job = job.clone();
                    async move { queue.ack(&mut job).await }
                })
                .await;
                match acked {
                    Ok(()) => {
                        record_job_attempt(queue_name.as_str(), "completed", elapsed);
                        info!(job_id = %job.id, attempt, "Job completed");
                    }
                    Err(e) => error!(job_id = %job.id, error = %e, "Failed to acknowledge job"),
                }
            }
            Err(err) => self.record_failure(job, format!("{err:#}"), elapsed).await,
        }

        self.publish_counts(queue_name).await;
    }

    /// Lets the handler see the failed attempt, then reschedules the job or
    /// moves it to the failed set.
    async fn record_failure(&self, job: Job, message: String, elapsed: f64) {
        let queue_name = job.queue;
        let attempt = job.current_attempt();
        self.handler.on_attempt_failed(&job, &message).await;

        let queue = &*self.queue;
        let nacked = retry_async_with_config(RetryConfig::default(), || {
            let mut job = job.clone();
            let message = message.clone();
            async move { queue.nack(&mut job, &message).await.map(|o| (o, job)) }
        })
        .await;

        match nacked {
            Ok((FailureOutcome::Retry { next_attempt_at }, _)) => {
                record_job_attempt(queue_name.as_str(), "retried", elapsed);
                warn!(
                    job_id = %job.id,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %message,
                    "Job failed, retry scheduled"
                );
            }
            Ok((FailureOutcome::Exhausted, failed)) => {
                record_job_attempt(queue_name.as_str(), "exhausted", elapsed);
                error!(
                    job_id = %job.id,
                    attempts = failed.attempt_count,
                    error = %message,
                    "Job exhausted its attempts"
                );
                self.handler.on_exhausted(&failed, &message).await;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
        }
    }

    async fn publish_counts(&self, queue_name: QueueName) {
        match self.queue.counts(queue_name).await {
            Ok(counts) => {
                self.hub
                    .publish(
                        Room::Admins,
                        HubEvent::QueueUpdate(QueueUpdate {
                            queue_name,
                            counts,
                        }),
                    )
                    .await;
            }
            Err(e) => warn!(error = %e, "Could not read queue counts"),
        }
    }
}
