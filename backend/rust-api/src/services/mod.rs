use std::sync::Arc;
use std::time::Duration;

use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use crate::config::{Config, QueueBackend, StoreBackend};
use crate::services::badge_engine::BadgeEngine;
use crate::services::content_generator::{ContentGenerator, HttpContentGenerator};
use crate::services::feedback_worker::FeedbackGenerationHandler;
use crate::services::notification_hub::NotificationHub;
use crate::services::problem_service::ProblemService;
use crate::services::problem_worker::ProblemGenerationHandler;
use crate::services::progress_service::ProgressService;
use crate::services::queue::{JobBackend, JobQueue, MemoryJobBackend, RedisJobBackend};
use crate::services::store::{MemoryRecordStore, MongoRecordStore, RecordStore};
use crate::services::submission_service::SubmissionService;
use crate::services::worker_pool::{JobHandler, WorkerPool};

pub mod badge_engine;
pub mod content_generator;
pub mod difficulty;
pub mod feedback_worker;
pub mod notification_hub;
pub mod problem_service;
pub mod problem_worker;
pub mod progress_service;
pub mod queue;
pub mod status_poller;
pub mod store;
pub mod submission_service;
pub mod worker_pool;

/// Everything a request handler or worker needs, built once per process.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub queue: Arc<JobQueue>,
    pub hub: Arc<NotificationHub>,
    pub generator: Arc<dyn ContentGenerator>,
    pub progress: Arc<ProgressService>,
    pub problems: ProblemService,
    pub submissions: SubmissionService,
}

impl AppState {
    /// Connects the configured backends.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = match config.store_backend {
            StoreBackend::Mongo => {
                tracing::info!("Connecting to MongoDB...");
                let client = MongoClient::with_uri_str(&config.mongo_uri).await?;
                let store = MongoRecordStore::new(client.database(&config.mongo_database));
                store.ensure_indexes().await?;
                tracing::info!("MongoDB connection established");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory record store, data is lost on restart");
                Arc::new(MemoryRecordStore::new())
            }
        };

        let backend: Arc<dyn JobBackend> = match config.queue.backend {
            QueueBackend::Redis => {
                tracing::info!("Attempting to connect to Redis...");
                let client = redis::Client::open(config.redis_uri.as_str())?;
                let redis = tokio::time::timeout(
                    Duration::from_secs(30),
                    ConnectionManager::new(client),
                )
                .await
                .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

                let mut conn = redis.clone();
                tokio::time::timeout(
                    Duration::from_secs(5),
                    redis::cmd("PING").query_async::<String>(&mut conn),
                )
                .await
                .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

                tracing::info!("Redis connection established successfully");
                Arc::new(RedisJobBackend::new(redis, &config.queue))
            }
            QueueBackend::Memory => {
                tracing::warn!("Using in-memory job queue, jobs are lost on restart");
                Arc::new(MemoryJobBackend::new(&config.queue))
            }
        };

        let generator = Arc::new(HttpContentGenerator::new(config.generator.clone())?);

        Ok(Self::from_parts(config, store, backend, generator))
    }

    /// Assembles the state around already-built backends.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn JobBackend>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(backend, &config.queue));
        let hub = Arc::new(NotificationHub::new(&config.hub));
        let progress = Arc::new(ProgressService::new(
            store.clone(),
            BadgeEngine::new(config.badge_rules.clone()),
        ));

        Self {
            problems: ProblemService::new(store.clone(), queue.clone(), hub.clone()),
            submissions: SubmissionService::new(store.clone(), queue.clone(), hub.clone()),
            config,
            store,
            queue,
            hub,
            generator,
            progress,
        }
    }

    pub fn job_handlers(&self) -> Vec<Arc<dyn JobHandler>> {
        vec![
            Arc::new(ProblemGenerationHandler::new(
                self.store.clone(),
                self.generator.clone(),
                self.hub.clone(),
            )),
            Arc::new(FeedbackGenerationHandler::new(
                self.store.clone(),
                self.generator.clone(),
                self.progress.clone(),
                self.hub.clone(),
            )),
        ]
    }

    /// Starts `queue.concurrency` workers on each queue.
    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(
            self.queue.clone(),
            self.hub.clone(),
            self.job_handlers(),
            self.config.queue.concurrency,
        )
    }
}
