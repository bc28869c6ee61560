//! Configuration for launchpad.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::markers::{self, MarkerRule, MarkerSet};

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Deployment store database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event store configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Event stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Task scheduler client configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Log ingestion pipeline configuration.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Stale-deployment reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Webhook trigger configuration.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Admission policy.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// API presentation settings.
    #[serde(default)]
    pub api: ApiConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `launchpad.toml` in the current directory (if present)
    /// 3. Environment variables with `LAUNCHPAD_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("launchpad.toml")
    }

    /// Load configuration from a specific TOML file, with environment overrides.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAUNCHPAD_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check constraints that span sections.
    ///
    /// A dispatch must resolve before the HTTP layer gives up on the request,
    /// otherwise the caller sees a timeout for a deployment that later starts.
    pub fn validate(&self) -> ControlResult<()> {
        if self.scheduler.timeout_secs >= self.server.request_timeout_secs {
            return Err(ControlError::Config(format!(
                "scheduler.timeout_secs ({}) must be below server.request_timeout_secs ({})",
                self.scheduler.timeout_secs, self.server.request_timeout_secs
            )));
        }
        if self.stream.partitions == 0 {
            return Err(ControlError::Config(
                "stream.partitions must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Which implementation backs a store or the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process, non-durable. For tests and single-node runs.
    #[default]
    Memory,
    /// PostgreSQL.
    Postgres,
}

/// Storage backend selection for the deployment and event stores.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Backend for both stores.
    #[serde(default)]
    pub backend: Backend,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Open a connection pool to `url`, or to the configured URL when `None`.
    pub async fn connect(&self, url: Option<&str>) -> ControlResult<sqlx::PgPool> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .connect(url.unwrap_or(&self.url))
            .await?;
        Ok(pool)
    }
}

fn default_database_url() -> String {
    "postgres://localhost/launchpad".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Separate database for log events. Falls back to `database.url`.
    #[serde(default)]
    pub url: Option<String>,

    /// Capacity of the live-log broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

const fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            url: None,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream backend.
    #[serde(default)]
    pub backend: Backend,

    /// Database URL for the postgres backend. Falls back to `database.url`.
    #[serde(default)]
    pub url: Option<String>,

    /// Number of partitions in the topic.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Consumer group whose position is committed.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

const fn default_partitions() -> u32 {
    4
}

fn default_consumer_group() -> String {
    "launchpad-ingest".to_owned()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: None,
            partitions: default_partitions(),
            consumer_group: default_consumer_group(),
        }
    }
}

/// Task scheduler client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Base URL for the scheduler HTTP API.
    #[serde(default = "default_scheduler_url")]
    pub url: String,

    /// Launch request timeout in seconds.
    #[serde(default = "default_scheduler_timeout_secs")]
    pub timeout_secs: u64,

    /// Task definition the build worker runs from.
    #[serde(default = "default_task_definition")]
    pub task_definition: String,

    /// Cluster to launch the task in.
    #[serde(default = "default_cluster")]
    pub cluster: String,
}

fn default_scheduler_url() -> String {
    "http://localhost:8082".to_owned()
}

const fn default_scheduler_timeout_secs() -> u64 {
    10
}

fn default_task_definition() -> String {
    "build-worker".to_owned()
}

fn default_cluster() -> String {
    "builds".to_owned()
}

impl SchedulerConfig {
    /// The launch timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            url: default_scheduler_url(),
            timeout_secs: default_scheduler_timeout_secs(),
            task_definition: default_task_definition(),
            cluster: default_cluster(),
        }
    }
}

/// Log ingestion pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Maximum messages fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between polls when a partition is idle, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Partition lease lifetime in seconds. Heartbeats extend it.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// First backoff delay for transient failures, in milliseconds.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Backoff ceiling, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Ordered marker rules. First match wins.
    #[serde(default = "markers::default_rules")]
    pub markers: Vec<MarkerRule>,
}

const fn default_batch_size() -> usize {
    100
}

const fn default_poll_interval_ms() -> u64 {
    200
}

const fn default_lease_ttl_secs() -> u64 {
    30
}

const fn default_retry_initial_ms() -> u64 {
    100
}

const fn default_retry_max_ms() -> u64 {
    10_000
}

impl IngestionConfig {
    /// Build the marker set from the configured rules.
    #[must_use]
    pub fn marker_set(&self) -> MarkerSet {
        MarkerSet::new(self.markers.clone())
    }

    /// Idle poll delay.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lease lifetime.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            markers: markers::default_rules(),
        }
    }
}

/// Stale-deployment reaper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Whether the reaper runs at all.
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    /// Age in seconds after which an in-flight deployment is failed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

const fn default_reaper_enabled() -> bool {
    true
}

const fn default_reaper_interval_secs() -> u64 {
    60
}

const fn default_stale_after_secs() -> u64 {
    30 * 60
}

impl ReaperConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Stale threshold.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Webhook trigger configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret. When unset every delivery is rejected.
    #[serde(default)]
    pub secret: Option<SecretString>,
}

/// Admission policy.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AdmissionConfig {
    /// Require the caller to own the project.
    #[serde(default)]
    pub enforce_ownership: bool,
}

/// API presentation settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ApiConfig {
    /// Log lines included with a FAILED deployment.
    #[serde(default = "default_failure_tail_lines")]
    pub failure_tail_lines: usize,
}

const fn default_failure_tail_lines() -> usize {
    20
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            failure_tail_lines: default_failure_tail_lines(),
        }
    }
}
