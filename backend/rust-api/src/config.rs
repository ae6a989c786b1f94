use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::models::badge::BadgeRule;
use crate::utils::retry::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    /// Workers per queue.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub lease_poll_ms: u64,
    /// A leased job not acknowledged within this window counts as a failed attempt.
    pub lease_timeout_ms: u64,
    pub retain_completed: usize,
    pub retain_failed: usize,
}

impl QueueSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn lease_poll(&self) -> Duration {
        Duration::from_millis(self.lease_poll_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 2000,
            lease_poll_ms: 250,
            lease_timeout_ms: 120_000,
            retain_completed: 100,
            retain_failed: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_attempts: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Outbound events buffered per connection before new ones are dropped.
    pub connection_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            connection_buffer: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            api_key: None,
            timeout_secs: 30,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub store_backend: StoreBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub jwt_secret: String,
    pub metrics_auth: String,
    pub queue: QueueSettings,
    pub poll: PollSettings,
    pub hub: HubSettings,
    pub generator: GeneratorSettings,
    /// The API process also runs the worker pools.
    pub workers_embedded: bool,
    pub badge_rules: Vec<BadgeRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            store_backend: StoreBackend::Mongo,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            mongo_database: "mathquest".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            jwt_secret: "dev-secret-only-for-local-testing".to_string(),
            metrics_auth: "admin:changeme".to_string(),
            queue: QueueSettings::default(),
            poll: PollSettings::default(),
            hub: HubSettings::default(),
            generator: GeneratorSettings::default(),
            workers_embedded: true,
            badge_rules: BadgeRule::default_rules(),
        }
    }
}

impl Config {
    /// Fully in-process configuration: memory store, memory queue.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.store_backend = StoreBackend::Memory;
        config.queue.backend = QueueBackend::Memory;
        config
    }

    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml, then APP__SECTION__KEY overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Config::default();

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!("Using default JWT_SECRET (dev mode only)");
                defaults.jwt_secret.clone()
            }
        };

        let queue = QueueSettings {
            backend: settings.get("queue.backend").unwrap_or(defaults.queue.backend),
            concurrency: settings
                .get("queue.concurrency")
                .unwrap_or(defaults.queue.concurrency),
            max_attempts: settings
                .get("queue.max_attempts")
                .unwrap_or(defaults.queue.max_attempts),
            backoff_base_ms: settings
                .get("queue.backoff_base_ms")
                .unwrap_or(defaults.queue.backoff_base_ms),
            lease_poll_ms: settings
                .get("queue.lease_poll_ms")
                .unwrap_or(defaults.queue.lease_poll_ms),
            lease_timeout_ms: settings
                .get("queue.lease_timeout_ms")
                .unwrap_or(defaults.queue.lease_timeout_ms),
            retain_completed: settings
                .get("queue.retain_completed")
                .unwrap_or(defaults.queue.retain_completed),
            retain_failed: settings
                .get("queue.retain_failed")
                .unwrap_or(defaults.queue.retain_failed),
        };
        if queue.concurrency == 0 || queue.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "queue.concurrency and queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if queue.lease_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "queue.lease_timeout_ms must be positive".to_string(),
            ));
        }

        let poll = PollSettings {
            interval_ms: settings
                .get("poll.interval_ms")
                .unwrap_or(defaults.poll.interval_ms),
            max_attempts: settings
                .get("poll.max_attempts")
                .unwrap_or(defaults.poll.max_attempts),
        };

        let hub = HubSettings {
            connection_buffer: settings
                .get("hub.connection_buffer")
                .unwrap_or(defaults.hub.connection_buffer),
        };

        let generator = GeneratorSettings {
            endpoint: settings
                .get_string("generator.endpoint")
                .unwrap_or(defaults.generator.endpoint),
            model: settings
                .get_string("generator.model")
                .unwrap_or(defaults.generator.model),
            api_key: settings
                .get_string("generator.api_key")
                .or_else(|_| env::var("ANTHROPIC_API_KEY"))
                .ok(),
            timeout_secs: settings
                .get("generator.timeout_secs")
                .unwrap_or(defaults.generator.timeout_secs),
            max_tokens: settings
                .get("generator.max_tokens")
                .unwrap_or(defaults.generator.max_tokens),
        };

        let badge_rules = match settings.get::<Vec<BadgeRule>>("badges.rules") {
            Ok(rules) => rules,
            Err(config::ConfigError::NotFound(_)) => defaults.badge_rules.clone(),
            Err(err) => return Err(err),
        };

        Ok(Config {
            bind_addr: settings
                .get_string("server.bind_addr")
                .or_else(|_| env::var("BIND_ADDR"))
                .unwrap_or(defaults.bind_addr),
            store_backend: settings
                .get("store.backend")
                .unwrap_or(defaults.store_backend),
            mongo_uri: settings
                .get_string("database.mongo_uri")
                .or_else(|_| env::var("MONGO_URI"))
                .unwrap_or(defaults.mongo_uri),
            mongo_database: settings
                .get_string("database.mongo_database")
                .or_else(|_| env::var("MONGO_DATABASE"))
                .unwrap_or(defaults.mongo_database),
            redis_uri: settings
                .get_string("redis.uri")
                .or_else(|_| env::var("REDIS_URI"))
                .unwrap_or(defaults.redis_uri),
            jwt_secret,
            metrics_auth: env::var("METRICS_AUTH").unwrap_or(defaults.metrics_auth),
            queue,
            poll,
            hub,
            generator,
            workers_embedded: settings
                .get_bool("workers.embedded")
                .unwrap_or(defaults.workers_embedded),
            badge_rules,
        })
    }
}
