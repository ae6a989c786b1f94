use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::JobBackend;
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::models::job::{Job, QueueCounts, QueueName};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Ordered by due time, then by insertion.
    schedule: BTreeMap<(DateTime<Utc>, u64), String>,
    active: HashSet<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    seq: u64,
}

impl QueueState {
    fn schedule(&mut self, job: &Job) {
        self.seq += 1;
        self.schedule
            .insert((job.next_attempt_at, self.seq), job.id.clone());
        self.jobs.insert(job.id.clone(), job.clone());
    }

    /// Releases the lease held by `job`. A copy carrying an older lease
    /// deadline was reclaimed and no longer owns the job.
    fn take_active(&mut self, job: &Job) -> Result<(), QueueError> {
        let owned = self.active.contains(&job.id)
            && self
                .jobs
                .get(&job.id)
                .is_some_and(|stored| stored.lease_expires_at == job.lease_expires_at);
        if !owned {
            return Err(QueueError::NotLeased(job.id.clone()));
        }
        self.active.remove(&job.id);
        Ok(())
    }

    fn finish(&mut self, job: &Job, failed: bool, retain: usize) {
        self.jobs.insert(job.id.clone(), job.clone());
        let list = if failed {
            &mut self.failed
        } else {
            &mut self.completed
        };
        list.push_front(job.id.clone());
        let mut evicted = Vec::new();
        while list.len() > retain.max(1) {
            if let Some(id) = list.pop_back() {
                evicted.push(id);
            }
        }
        for id in evicted {
            self.jobs.remove(&id);
        }
    }
}

/// In-process backend for tests and dev runs without Redis.
pub struct MemoryJobBackend {
    queues: [Mutex<QueueState>; 2],
    retain_completed: usize,
    retain_failed: usize,
}

impl MemoryJobBackend {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            queues: [
                Mutex::new(QueueState::default()),
                Mutex::new(QueueState::default()),
            ],
            retain_completed: settings.retain_completed,
            retain_failed: settings.retain_failed,
        }
    }

    fn state(&self, queue: QueueName) -> &Mutex<QueueState> {
        &self.queues[queue.index()]
    }
}

#[async_trait]
impl JobBackend for MemoryJobBackend {
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.state(job.queue).lock().await.schedule(job);
        Ok(())
    }

    async fn claim_due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut state = self.state(queue).lock().await;
        let is_due = matches!(state.schedule.first_key_value(), Some(((at, _), _)) if *at <= now);
        if !is_due {
            return Ok(None);
        }
        let Some((_, id)) = state.schedule.pop_first() else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::UnknownJob(id.clone()))?;
        job.mark_active(lease_until);
        let job = job.clone();
        state.active.insert(id);
        Ok(Some(job))
    }

    async fn reclaim_expired(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut state = self.state(queue).lock().await;
        let state = &mut *state;
        let stalled = state
            .active
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.lease_expired(now))
            .min_by_key(|job| job.lease_expires_at)
            .map(|job| job.id.clone());
        let Some(id) = stalled else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::UnknownJob(id.clone()))?;
        job.mark_active(lease_until);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state(job.queue).lock().await;
        state.take_active(job)?;
        state.finish(job, false, self.retain_completed);
        Ok(())
    }

    async fn reschedule(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state(job.queue).lock().await;
        state.take_active(job)?;
        state.schedule(job);
        Ok(())
    }

    async fn fail(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state(job.queue).lock().await;
        state.take_active(job)?;
        state.finish(job, true, self.retain_failed);
        Ok(())
    }

    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<QueueCounts, QueueError> {
        let state = self.state(queue).lock().await;
        let waiting = state.schedule.keys().filter(|(at, _)| *at <= now).count() as u64;
        Ok(QueueCounts {
            waiting,
            delayed: state.schedule.len() as u64 - waiting,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
        })
    }
}
