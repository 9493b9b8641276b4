//! Engine configuration types.
//!
//! `EngineConfig` represents the `dagflow.toml` file. Every field has a
//! default so an empty (or missing) file yields a runnable engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageBackend,
    /// SQLite URL. Defaults to `{data_dir}/dagflow.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub timeout_checker: TimeoutCheckerConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
    #[serde(default)]
    pub observe: ObserveConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::default(),
            database_url: None,
            bus: BusConfig::default(),
            lock: LockConfig::default(),
            executor: ExecutorConfig::default(),
            poller: PollerConfig::default(),
            timeout_checker: TimeoutCheckerConfig::default(),
            archiver: ArchiverConfig::default(),
            observe: ObserveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    /// Volatile in-process store (development only).
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Sqlite
    }
}

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Partitions (consumer tasks) per channel.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Deliveries before a message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Bounded queue size per partition.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_partitions() -> usize {
    4
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            max_deliveries: default_max_deliveries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length; an abandoned lock frees itself after this long.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_retry_attempts() -> u32 {
    5
}

fn default_lock_retry_backoff_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            retry_attempts: default_lock_retry_attempts(),
            retry_backoff_ms: default_lock_retry_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Decide/run rounds per drive before yielding back to the bus.
    #[serde(default = "default_max_sync_steps")]
    pub max_sync_steps: u32,
}

fn default_max_sync_steps() -> u32 {
    64
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_sync_steps: default_max_sync_steps(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sweepers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Re-poll delay for nodes that do not declare `poll_interval_secs`.
    #[serde(default = "default_node_poll_secs")]
    pub default_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_node_poll_secs() -> u64 {
    10
}

fn default_sweep_batch() -> u32 {
    100
}

fn default_workers() -> usize {
    8
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            batch_size: default_sweep_batch(),
            workers: default_workers(),
            default_interval_secs: default_node_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutCheckerConfig {
    #[serde(default = "default_timeout_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_timeout_interval_secs() -> u64 {
    5
}

impl Default for TimeoutCheckerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_timeout_interval_secs(),
            batch_size: default_sweep_batch(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_archive_interval_secs")]
    pub interval_secs: u64,
    /// Terminal instances older than this are moved to history.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
}

fn default_archive_interval_secs() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    30
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_archive_interval_secs(),
            retention_days: default_retention_days(),
            batch_size: default_sweep_batch(),
        }
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_filter() -> String {
    "info,dagflow=debug".to_string()
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json: false,
            otel: false,
        }
    }
}
