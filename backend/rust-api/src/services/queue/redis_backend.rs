use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;

use super::JobBackend;
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::models::job::{Job, QueueCounts, QueueName};

/// Moves the earliest due id from the schedule to the active set, scored by
/// its lease deadline (ARGV[2] millis), and stamps the stored job as active
/// with `lease_expires_at` = ARGV[3]. Returns the updated job JSON, or nil
/// when nothing is due.
const CLAIM_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
    if #ids == 0 then
        return false
    end
    local id = ids[1]
    redis.call('ZREM', KEYS[1], id)
    local body = redis.call('HGET', KEYS[3], id)
    if not body then
        return false
    end
    local job = cjson.decode(body)
    job['status'] = 'active'
    job['lease_expires_at'] = ARGV[3]
    body = cjson.encode(job)
    redis.call('HSET', KEYS[3], id, body)
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    return body
"#;

/// Hands the active job with the oldest expired lease (score <= ARGV[1]) to
/// the caller under a new deadline. Same arguments and reply as the claim.
const RECLAIM_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
    if #ids == 0 then
        return false
    end
    local id = ids[1]
    local body = redis.call('HGET', KEYS[2], id)
    if not body then
        redis.call('ZREM', KEYS[1], id)
        return false
    end
    local job = cjson.decode(body)
    job['lease_expires_at'] = ARGV[3]
    body = cjson.encode(job)
    redis.call('HSET', KEYS[2], id, body)
    redis.call('ZADD', KEYS[1], ARGV[2], id)
    return body
"#;

/// Active -> schedule at ARGV[3] (epoch millis). Only the lease holder,
/// identified by its deadline ARGV[4], may move the job.
const RESCHEDULE_SCRIPT: &str = r#"
    local lease = redis.call('ZSCORE', KEYS[1], ARGV[1])
    if not lease or tonumber(lease) ~= tonumber(ARGV[4]) then
        return 0
    end
    redis.call('ZREM', KEYS[1], ARGV[1])
    redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
    return 1
"#;

/// Active -> history list, then prune the list to ARGV[3] entries and drop
/// the evicted job bodies. Lease check as in the reschedule.
const FINISH_SCRIPT: &str = r#"
    local lease = redis.call('ZSCORE', KEYS[1], ARGV[1])
    if not lease or tonumber(lease) ~= tonumber(ARGV[4]) then
        return 0
    end
    redis.call('ZREM', KEYS[1], ARGV[1])
    local retain = tonumber(ARGV[3])
    redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
    redis.call('LPUSH', KEYS[2], ARGV[1])
    local evicted = redis.call('LRANGE', KEYS[2], retain, -1)
    for _, id in ipairs(evicted) do
        redis.call('HDEL', KEYS[3], id)
    end
    redis.call('LTRIM', KEYS[2], 0, retain - 1)
    return 1
"#;

/// Score of a lease in the active set, or -1 for a job never leased.
fn lease_score(job: &Job) -> i64 {
    job.lease_expires_at
        .map(|until| until.timestamp_millis())
        .unwrap_or(-1)
}

/// Millisecond RFC 3339, so the stored deadline matches its score exactly.
fn lease_stamp(lease_until: DateTime<Utc>) -> String {
    lease_until.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct QueueKeys {
    jobs: String,
    schedule: String,
    active: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn for_queue(queue: QueueName) -> Self {
        let prefix = format!("mathquest:queue:{}", queue.as_str());
        Self {
            jobs: format!("{prefix}:jobs"),
            schedule: format!("{prefix}:schedule"),
            active: format!("{prefix}:active"),
            completed: format!("{prefix}:completed"),
            failed: format!("{prefix}:failed"),
        }
    }
}

pub struct RedisJobBackend {
    redis: ConnectionManager,
    retain_completed: usize,
    retain_failed: usize,
    claim: redis::Script,
    reclaim: redis::Script,
    reschedule: redis::Script,
    finish: redis::Script,
}

impl RedisJobBackend {
    pub fn new(redis: ConnectionManager, settings: &QueueSettings) -> Self {
        Self {
            redis,
            retain_completed: settings.retain_completed.max(1),
            retain_failed: settings.retain_failed.max(1),
            claim: redis::Script::new(CLAIM_SCRIPT),
            reclaim: redis::Script::new(RECLAIM_SCRIPT),
            reschedule: redis::Script::new(RESCHEDULE_SCRIPT),
            finish: redis::Script::new(FINISH_SCRIPT),
        }
    }

    async fn finish_job(&self, job: &Job, failed: bool) -> Result<(), QueueError> {
        let keys = QueueKeys::for_queue(job.queue);
        let (history, retain) = if failed {
            (&keys.failed, self.retain_failed)
        } else {
            (&keys.completed, self.retain_completed)
        };

        let mut conn = self.redis.clone();
        let moved: u32 = self
            .finish
            .key(&keys.active)
            .key(history)
            .key(&keys.jobs)
            .arg(&job.id)
            .arg(serde_json::to_string(job)?)
            .arg(retain)
            .arg(lease_score(job))
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            return Err(QueueError::NotLeased(job.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobBackend for RedisJobBackend {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let keys = QueueKeys::for_queue(job.queue);
        let body = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&keys.jobs)
            .arg(&job.id)
            .arg(body)
            .ignore()
            .cmd("ZADD")
            .arg(&keys.schedule)
            .arg(job.next_attempt_at.timestamp_millis())
            .arg(&job.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.redis.clone();

        let body: Option<String> = self
            .claim
            .key(&keys.schedule)
            .key(&keys.active)
            .key(&keys.jobs)
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(lease_stamp(lease_until))
            .invoke_async(&mut conn)
            .await?;

        Ok(body.map(|body| serde_json::from_str(&body)).transpose()?)
    }

    async fn reclaim_expired(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.redis.clone();

        let body: Option<String> = self
            .reclaim
            .key(&keys.active)
            .key(&keys.jobs)
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(lease_stamp(lease_until))
            .invoke_async(&mut conn)
            .await?;

        Ok(body.map(|body| serde_json::from_str(&body)).transpose()?)
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        self.finish_job(job, false).await
    }

    async fn reschedule(&self, job: &Job) -> Result<(), QueueError> {
        let keys = QueueKeys::for_queue(job.queue);
        let mut conn = self.redis.clone();

        let moved: u32 = self
            .reschedule
            .key(&keys.active)
            .key(&keys.schedule)
            .key(&keys.jobs)
            .arg(&job.id)
            .arg(serde_json::to_string(job)?)
            .arg(job.next_attempt_at.timestamp_millis())
            .arg(lease_score(job))
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            return Err(QueueError::NotLeased(job.id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, job: &Job) -> Result<(), QueueError> {
        self.finish_job(job, true).await
    }

    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<QueueCounts, QueueError> {
        let keys = QueueKeys::for_queue(queue);
        let now_ms = now.timestamp_millis();
        let mut conn = self.redis.clone();

        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("ZCOUNT")
                .arg(&keys.schedule)
                .arg("-inf")
                .arg(now_ms)
                .cmd("ZCOUNT")
                .arg(&keys.schedule)
                .arg(format!("({}", now_ms))
                .arg("+inf")
                .cmd("ZCARD")
                .arg(&keys.active)
                .cmd("LLEN")
                .arg(&keys.completed)
                .cmd("LLEN")
                .arg(&keys.failed)
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = QueueKeys::for_queue(QueueName::FeedbackGeneration);
        assert_eq!(keys.schedule, "mathquest:queue:feedback-generation:schedule");
        assert_eq!(keys.jobs, "mathquest:queue:feedback-generation:jobs");
        assert_ne!(
            QueueKeys::for_queue(QueueName::ProblemGeneration).active,
            keys.active
        );
    }

    #[test]
    fn lease_stamp_round_trips_to_its_score() {
        let until = DateTime::parse_from_rfc3339("2026-03-01T10:15:30.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let stamp = lease_stamp(until);
        assert_eq!(stamp, "2026-03-01T10:15:30.123Z");

        let parsed = DateTime::parse_from_rfc3339(&stamp).unwrap().with_timezone(&Utc);
        assert_eq!(parsed.timestamp_millis(), until.timestamp_millis());
    }
}
