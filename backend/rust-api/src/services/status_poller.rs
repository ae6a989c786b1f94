//! Client-side fallback that watches a Session or Submission until it settles.
//!
//! The poller decides "done" with the same [`Trackable`] predicate the workers
//! publish on, so push and poll always agree on the terminal state.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::PollSettings;
use crate::error::StoreError;
use crate::metrics::STATUS_POLLS_TOTAL;
use crate::models::session::{Session, SessionView};
use crate::models::submission::{Submission, SubmissionView};
use crate::models::{Phase, Trackable};
use crate::services::store::RecordStore;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status request returned {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Total checks, the immediate one included.
    pub max_attempts: u32,
}

impl From<&PollSettings> for PollConfig {
    fn from(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded,
    /// The record reached its failed state; generation will not be retried.
    Failed,
    /// No terminal state was seen; the job may still be running.
    TimedOut,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOutcome::Succeeded => "succeeded",
            PollOutcome::Failed => "failed",
            PollOutcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollReport<R> {
    pub outcome: PollOutcome,
    pub checks: u32,
    pub last: Option<R>,
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    type Record: Trackable + Send;

    /// `Ok(None)` when the record does not exist.
    async fn fetch(&self, id: &str) -> Result<Option<Self::Record>, PollError>;
}

/// Checks once immediately, then every `interval` until the record is
/// terminal or `max_attempts` checks have been made.
///
/// A failed fetch counts as a check and polling continues; a missing record
/// ends the poll with [`PollError::NotFound`].
pub async fn poll_until_terminal<S: StatusSource>(
    source: &S,
    id: &str,
    config: &PollConfig,
) -> Result<PollReport<S::Record>, PollError> {
    let mut last = None;
    let mut checks = 0;

    while checks < config.max_attempts.max(1) {
        if checks > 0 {
            tokio::time::sleep(config.interval).await;
        }
        checks += 1;

        match source.fetch(id).await {
            Ok(Some(record)) => {
                let outcome = match record.phase() {
                    Phase::Succeeded => Some(PollOutcome::Succeeded),
                    Phase::Failed => Some(PollOutcome::Failed),
                    Phase::Pending | Phase::Running => None,
                };
                last = Some(record);
                if let Some(outcome) = outcome {
                    return Ok(finish(outcome, checks, last));
                }
            }
            Ok(None) => return Err(PollError::NotFound(id.to_string())),
            Err(e) => tracing::warn!(id, check = checks, error = %e, "Status check failed"),
        }
    }

    Ok(finish(PollOutcome::TimedOut, checks, last))
}

fn finish<R>(outcome: PollOutcome, checks: u32, last: Option<R>) -> PollReport<R> {
    STATUS_POLLS_TOTAL
        .with_label_values(&[outcome.as_str()])
        .inc();
    tracing::debug!(outcome = outcome.as_str(), checks, "Status poll finished");
    PollReport {
        outcome,
        checks,
        last,
    }
}

/// Reads Sessions straight from the record store.
pub struct StoreSessionSource(pub Arc<dyn RecordStore>);

#[async_trait]
impl StatusSource for StoreSessionSource {
    type Record = Session;

    async fn fetch(&self, id: &str) -> Result<Option<Session>, PollError> {
        Ok(self.0.get_session(id).await?)
    }
}

/// Reads Submissions straight from the record store.
pub struct StoreSubmissionSource(pub Arc<dyn RecordStore>);

#[async_trait]
impl StatusSource for StoreSubmissionSource {
    type Record = Submission;

    async fn fetch(&self, id: &str) -> Result<Option<Submission>, PollError> {
        Ok(self.0.get_submission(id).await?)
    }
}

/// Reads a record through the public read endpoints with a bearer token.
pub struct HttpStatusSource<R> {
    client: Client,
    base_url: String,
    path: &'static str,
    token: String,
    _record: PhantomData<fn() -> R>,
}

impl<R> HttpStatusSource<R> {
    fn new(client: Client, base_url: &str, path: &'static str, token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            path,
            token: token.to_string(),
            _record: PhantomData,
        }
    }

    fn url(&self, id: &str) -> String {
        format!("{}{}{}", self.base_url, self.path, id)
    }
}

impl HttpStatusSource<SessionView> {
    pub fn sessions(client: Client, base_url: &str, token: &str) -> Self {
        Self::new(client, base_url, "/api/v1/problems/", token)
    }
}

impl HttpStatusSource<SubmissionView> {
    pub fn submissions(client: Client, base_url: &str, token: &str) -> Self {
        Self::new(client, base_url, "/api/v1/problems/submission/", token)
    }
}

#[async_trait]
impl<R> StatusSource for HttpStatusSource<R>
where
    R: DeserializeOwned + Trackable + Send + 'static,
{
    type Record = R;

    async fn fetch(&self, id: &str) -> Result<Option<R>, PollError> {
        let response = self
            .client
            .get(self.url(id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<R>().await?)),
            status => Err(PollError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports `Running` until the given check, then `settle`.
    struct Scripted {
        settle_on: u32,
        settle: Phase,
        calls: AtomicU32,
    }

    struct Snapshot(Phase);

    impl Trackable for Snapshot {
        fn phase(&self) -> Phase {
            self.0
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        type Record = Snapshot;

        async fn fetch(&self, _id: &str) -> Result<Option<Snapshot>, PollError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.settle_on {
                Ok(Some(Snapshot(self.settle)))
            } else {
                Ok(Some(Snapshot(Phase::Running)))
            }
        }
    }

    fn fast(max_attempts: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn finished_record_is_seen_on_the_immediate_check() {
        let source = Scripted {
            settle_on: 1,
            settle: Phase::Succeeded,
            calls: AtomicU32::new(0),
        };
        let config = PollConfig {
            interval: Duration::from_secs(60),
            max_attempts: 20,
        };
        let report = poll_until_terminal(&source, "s1", &config).await.unwrap();
        assert_eq!(report.outcome, PollOutcome::Succeeded);
        assert_eq!(report.checks, 1);
    }

    #[tokio::test]
    async fn failure_is_distinct_from_timeout() {
        let failing = Scripted {
            settle_on: 3,
            settle: Phase::Failed,
            calls: AtomicU32::new(0),
        };
        let report = poll_until_terminal(&failing, "s1", &fast(20)).await.unwrap();
        assert_eq!(report.outcome, PollOutcome::Failed);
        assert_eq!(report.checks, 3);

        let stuck = Scripted {
            settle_on: u32::MAX,
            settle: Phase::Failed,
            calls: AtomicU32::new(0),
        };
        let report = poll_until_terminal(&stuck, "s1", &fast(5)).await.unwrap();
        assert_eq!(report.outcome, PollOutcome::TimedOut);
        assert_eq!(report.checks, 5);
        assert_eq!(report.last.map(|s| s.0), Some(Phase::Running));
    }

    #[tokio::test]
    async fn missing_record_is_an_error() {
        let store: Arc<dyn RecordStore> = Arc::new(crate::services::store::MemoryRecordStore::new());
        let source = StoreSessionSource(store);
        assert!(matches!(
            poll_until_terminal(&source, "nope", &fast(3)).await,
            Err(PollError::NotFound(_))
        ));
    }

    #[test]
    fn config_defaults_follow_settings() {
        let config = PollConfig::from(&PollSettings::default());
        assert_eq!(config.interval, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 20);
    }
}
