//! Configuration management.
//!
//! Values come from an optional file followed by `ROLLUP__*` environment
//! variables, e.g. `ROLLUP__REDIS__URL` or `ROLLUP__WORKER__CONCURRENCY`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Result, RollupError};

const ENV_PREFIX: &str = "ROLLUP";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub updater: UpdaterConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis connection URL (cache, queue and broker stream)
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Table holding one row per observation
    #[serde(default = "default_table")]
    pub table: String,

    /// Column referencing the aggregated entity
    #[serde(default = "default_entity_column")]
    pub entity_column: String,

    /// Column holding the observation value
    #[serde(default = "default_value_column")]
    pub value_column: String,

    /// Primary key column, used for counting
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            table: default_table(),
            entity_column: default_entity_column(),
            value_column: default_value_column(),
            id_column: default_id_column(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Stream carrying domain events
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group name
    #[serde(default = "default_group")]
    pub group: String,

    /// Consumer name inside the group; must be stable across restarts and
    /// unique per replica. Defaults to the host name. It also names the
    /// worker's processing list, so replicas sharing a name recover each
    /// other's in-flight jobs.
    #[serde(default = "default_consumer")]
    pub consumer: String,

    /// How long a read blocks waiting for new entries
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default)]
    pub events: EventNamesConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group: default_group(),
            consumer: default_consumer(),
            block_ms: default_block_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            events: EventNamesConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Broker keys (and job names) for the three event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventNamesConfig {
    #[serde(default = "default_added_event")]
    pub added: String,

    #[serde(default = "default_updated_event")]
    pub updated: String,

    #[serde(default = "default_removed_event")]
    pub removed: String,
}

impl Default for EventNamesConfig {
    fn default() -> Self {
        Self {
            added: default_added_event(),
            updated: default_updated_event(),
            removed: default_removed_event(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    /// Logical queue name
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Prefix for every Redis key the queue owns
    #[serde(default = "default_queue_key_prefix")]
    pub key_prefix: String,

    /// Deliveries before a job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Dead-letter list is trimmed to this length
    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            key_prefix: default_queue_key_prefix(),
            max_attempts: default_max_attempts(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            dead_letter_max_size: default_dead_letter_max_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    /// Maximum concurrent handler executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A handler running longer than this fails with a retryable error
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// How often delayed jobs are checked for promotion
    #[serde(default = "default_promote_interval_ms")]
    pub promote_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            handler_timeout_secs: default_handler_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            promote_interval_ms: default_promote_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Cache entries live at `{key_prefix}:{entity_id}`
    #[serde(default = "default_cache_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_cache_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdaterConfig {
    /// Compare-and-set attempts per job before giving up with a retryable error
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json, pretty or compact
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus scrape address, e.g. `0.0.0.0:9090`
    #[serde(default)]
    pub metrics_endpoint: Option<String>,

    /// OTLP collector endpoint
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_endpoint: None,
            otlp_endpoint: None,
        }
    }
}

// Default value functions

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/reviews".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_table() -> String {
    "review".to_string()
}

fn default_entity_column() -> String {
    "productId".to_string()
}

fn default_value_column() -> String {
    "rating".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_topic() -> String {
    "review-events".to_string()
}

fn default_group() -> String {
    "review-consumer".to_string()
}

fn default_consumer() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "rollup-1".to_string())
}

fn default_block_ms() -> u64 {
    5000
}

fn default_reconnect_backoff_ms() -> u64 {
    2000
}

fn default_added_event() -> String {
    "review-added".to_string()
}

fn default_updated_event() -> String {
    "review-updated".to_string()
}

fn default_removed_event() -> String {
    "review-deleted".to_string()
}

fn default_queue_name() -> String {
    "review-processing".to_string()
}

fn default_queue_key_prefix() -> String {
    "rollup:queue:review-processing".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_dead_letter_max_size() -> usize {
    10_000
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_handler_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_promote_interval_ms() -> u64 {
    1000
}

fn default_cache_key_prefix() -> String {
    "product".to_string()
}

fn default_max_cas_retries() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment variables layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` when given, otherwise from the environment alone.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(RollupError::configuration("worker.concurrency must be at least 1"));
        }
        if self.worker.handler_timeout_secs == 0 {
            return Err(RollupError::configuration("worker.handler_timeout_secs must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(RollupError::configuration("queue.max_attempts must be at least 1"));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(RollupError::configuration("broker.topic must not be empty"));
        }
        if self.broker.consumer.trim().is_empty() {
            return Err(RollupError::configuration("broker.consumer must not be empty"));
        }

        let events = &self.broker.events;
        let names: HashSet<&str> = [
            events.added.as_str(),
            events.updated.as_str(),
            events.removed.as_str(),
        ]
        .into_iter()
        .collect();
        if names.len() != 3 || names.iter().any(|n| n.is_empty()) {
            return Err(RollupError::configuration(
                "broker.events names must be non-empty and distinct",
            ));
        }

        if self.queue.backoff_multiplier < 1.0 {
            return Err(RollupError::configuration("queue.backoff_multiplier must be >= 1.0"));
        }

        Ok(())
    }

    /// A copy safe to print: credentials are stripped from connection URLs.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.redis.url = redact_url(&config.redis.url);
        config.database.url = redact_url(&config.database.url);
        config
    }
}

/// Strip credentials from a connection URL.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}
