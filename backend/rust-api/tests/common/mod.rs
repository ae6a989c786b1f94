#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use mathquest_api::{
    config::Config,
    create_router,
    error::GeneratorError,
    middlewares::auth::{JwtClaims, JwtService},
    models::{
        job::GenerateFeedbackPayload,
        progress::{Outcome, Progress, ResultWindow},
        session::{Difficulty, Session},
        user::{Identity, UserRole},
    },
    services::{
        content_generator::{ContentGenerator, GeneratedProblem},
        queue::MemoryJobBackend,
        status_poller::PollConfig,
        store::{MemoryRecordStore, RecordStore},
        worker_pool::WorkerPool,
        AppState,
    },
};

pub const ANSWER: f64 = 42.0;

/// Content generator with scripted failures and call counters.
#[derive(Default)]
pub struct ScriptedGenerator {
    /// Problem calls that still fail before one succeeds.
    pub problem_failures: AtomicUsize,
    pub feedback_failures: AtomicUsize,
    pub problem_calls: AtomicUsize,
    pub feedback_calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn reliable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_problems(failures: usize) -> Arc<Self> {
        let generator = Self::default();
        generator.problem_failures.store(failures, Ordering::SeqCst);
        Arc::new(generator)
    }

    pub fn failing_feedback(failures: usize) -> Arc<Self> {
        let generator = Self::default();
        generator.feedback_failures.store(failures, Ordering::SeqCst);
        Arc::new(generator)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                if left == 0 {
                    None
                } else if left == usize::MAX {
                    Some(left)
                } else {
                    Some(left - 1)
                }
            })
            .is_ok()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate_problem(
        &self,
        difficulty: Difficulty,
    ) -> Result<GeneratedProblem, GeneratorError> {
        self.problem_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.problem_failures) {
            return Err(GeneratorError::Malformed("no JSON object in reply".into()));
        }
        Ok(GeneratedProblem {
            problem_text: format!("[{}] What is 6 x 7?", difficulty.as_str()),
            final_answer: ANSWER,
        })
    }

    async fn generate_feedback(
        &self,
        payload: &GenerateFeedbackPayload,
    ) -> Result<String, GeneratorError> {
        self.feedback_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.feedback_failures) {
            return Err(GeneratorError::Provider("overloaded".into()));
        }
        Ok(if payload.is_correct {
            "Great job, that is exactly right!".to_string()
        } else {
            format!("Not quite. The answer is {}.", payload.correct_answer)
        })
    }
}

/// In-memory configuration with millisecond-scale timings.
pub fn test_config() -> Config {
    let mut config = Config::in_memory();
    config.queue.backoff_base_ms = 20;
    config.queue.lease_poll_ms = 5;
    config.poll.interval_ms = 25;
    config.poll.max_attempts = 200;
    config
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub generator: Arc<ScriptedGenerator>,
    pub store: Arc<MemoryRecordStore>,
}

impl TestApp {
    pub fn new(config: Config, generator: Arc<ScriptedGenerator>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let store = Arc::new(MemoryRecordStore::new());
        let backend = Arc::new(MemoryJobBackend::new(&config.queue));
        let state = Arc::new(AppState::from_parts(
            config,
            store.clone(),
            backend,
            generator.clone(),
        ));
        let router = create_router(state.clone());
        Self {
            state,
            router,
            generator,
            store,
        }
    }

    pub fn start_workers(&self) -> WorkerPool {
        self.state.spawn_workers()
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::from(&self.state.config.poll)
    }

    pub fn token(&self, identity: &Identity) -> String {
        JwtService::new(&self.state.config.jwt_secret)
            .generate_token(&JwtClaims::for_identity(identity, 3600))
            .unwrap()
    }

    /// Sends a request and returns the status plus the JSON body (`Null` if empty).
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn store_session(&self, id: &str) -> Session {
        self.store.get_session(id).await.unwrap().unwrap()
    }

    /// Stores a progress row as if `outcomes` had already been graded.
    pub async fn seed_progress(
        &self,
        user_id: &str,
        difficulty: Difficulty,
        total: u32,
        outcomes: &[bool],
    ) {
        let mut progress = Progress::new(user_id);
        progress.current_difficulty = difficulty;
        progress.total_problems = total;
        progress.correct_problems = outcomes.iter().filter(|c| **c).count() as u32;
        progress.last_five_results =
            ResultWindow::from(outcomes.iter().map(|c| Outcome::from(*c)).collect::<Vec<_>>());
        assert!(self
            .store
            .compare_and_swap_progress(None, &progress)
            .await
            .unwrap());
    }
}

pub fn student(id: &str) -> Identity {
    Identity::new(id, format!("Student {id}"), UserRole::Student)
}

pub fn teacher() -> Identity {
    Identity::new("teacher-1", "Ms. Teacher", UserRole::Teacher)
}

pub fn admin() -> Identity {
    Identity::new("admin-1", "Admin", UserRole::Admin)
}

/// Waits for `check` to hold, giving up after a few seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
