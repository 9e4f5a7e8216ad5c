//! Runtime configuration.
//!
//! Everything that used to be embedded in the migration scripts (connection
//! details, batch sizes, thresholds, webhook target) is supplied here at
//! startup, either from a JSON file or from the defaults below.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default migration window size.
pub const DEFAULT_BATCH_SIZE: i64 = 5000;

/// Default pause between migration batches in milliseconds.
pub const DEFAULT_BATCH_DELAY_MS: u64 = 100;

/// Default latency bound for the validator's representative query.
pub const DEFAULT_VALIDATION_LATENCY_MS: u64 = 100;

/// Default latency bound for the health check's representative query.
pub const DEFAULT_HEALTH_LATENCY_MS: u64 = 1000;

/// Default monitoring interval in seconds.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 300;

/// Default wait after a failed monitoring cycle in seconds.
pub const DEFAULT_MONITOR_BACKOFF_SECS: u64 = 60;

/// Default alert cooldown in seconds (15 minutes).
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 15 * 60;

/// Default webhook timeout in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Environment variable consulted for the PostgreSQL password.
pub const PASSWORD_ENV: &str = "FATURE_DB_PASSWORD";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migration: MigrationConfig,
    pub validation: ValidationConfig,
    pub rollback: RollbackConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load a JSON configuration file. Missing sections take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.batch_size <= 0 {
            return Err(ConfigError::Invalid(format!(
                "migration.batch_size must be positive, got {}",
                self.migration.batch_size
            )));
        }
        if self.migration.max_hierarchy_depth == Some(0) {
            return Err(ConfigError::Invalid(
                "migration.max_hierarchy_depth must be at least 1 when set".to_string(),
            ));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.monitor.thresholds.critical_backlog_multiple < 1 {
            return Err(ConfigError::Invalid(
                "monitor.thresholds.critical_backlog_multiple must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the database configuration.
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Set the webhook target.
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.monitor.webhook_url = Some(url.into());
        self
    }
}

/// Which store to connect to.
#[derive(Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DatabaseConfig {
    /// SQLite file. The derived schema lives in a second, attached file.
    Sqlite {
        path: PathBuf,
        /// Defaults to `<path>.fature_v2`.
        #[serde(default)]
        derived_path: Option<PathBuf>,
    },
    /// PostgreSQL server.
    Postgres {
        host: String,
        #[serde(default = "default_pg_port")]
        port: u16,
        database: String,
        user: String,
        /// Falls back to `FATURE_DB_PASSWORD`.
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: u64,
    },
}

fn default_pg_port() -> u16 {
    5432
}

fn default_statement_timeout_ms() -> u64 {
    300_000
}

impl DatabaseConfig {
    /// SQLite store at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig::Sqlite {
            path: path.into(),
            derived_path: None,
        }
    }

    /// Connection URL for the PostgreSQL adapter, resolving the password from
    /// the environment when the config does not carry one.
    pub fn postgres_url(&self) -> Option<String> {
        match self {
            DatabaseConfig::Postgres {
                host,
                port,
                database,
                user,
                password,
                ..
            } => {
                let password = password
                    .clone()
                    .or_else(|| std::env::var(PASSWORD_ENV).ok())
                    .unwrap_or_default();
                Some(format!(
                    "postgres://{user}:{password}@{host}:{port}/{database}"
                ))
            }
            DatabaseConfig::Sqlite { .. } => None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::sqlite("./fature.db")
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseConfig::Sqlite { path, derived_path } => f
                .debug_struct("Sqlite")
                .field("path", path)
                .field("derived_path", derived_path)
                .finish(),
            DatabaseConfig::Postgres {
                host,
                port,
                database,
                user,
                password,
                statement_timeout_ms,
            } => f
                .debug_struct("Postgres")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .field("statement_timeout_ms", statement_timeout_ms)
                .finish(),
        }
    }
}

/// Batch migration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Identifier window per batch.
    pub batch_size: i64,
    /// Pause between batches, yielding to other writers.
    pub batch_delay_ms: u64,
    /// Retries of a batch after a transient store error. Zero makes any
    /// connection-level failure fatal.
    pub max_batch_retries: u32,
    /// Base backoff between batch retries, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
    /// Snapshot the original tables before migrating.
    pub backup_before_migrate: bool,
    /// Compute the closure in-process instead of with a store-side query.
    pub in_process_closure: bool,
    /// Longest distance kept in the closure. `None` indexes every ancestor.
    pub max_hierarchy_depth: Option<u32>,
}

impl MigrationConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Set the window size.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the inter-batch pause.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enable bounded batch retry.
    pub fn with_batch_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_batch_retries = retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            max_batch_retries: 0,
            retry_backoff_ms: 1000,
            backup_before_migrate: true,
            in_process_closure: false,
            max_hierarchy_depth: None,
        }
    }
}

/// Consistency validator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_query_latency_ms: u64,
}

impl ValidationConfig {
    pub fn max_query_latency(&self) -> Duration {
        Duration::from_millis(self.max_query_latency_ms)
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_query_latency_ms: DEFAULT_VALIDATION_LATENCY_MS,
        }
    }
}

/// Rollback settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Drop the derived schema as the last step of a full rollback.
    pub drop_derived_schema: bool,
    /// Latency bound for the health check's representative query.
    pub health_latency_ms: u64,
    /// Rows shown by the rollback report.
    pub report_limit: u32,
}

impl RollbackConfig {
    pub fn health_latency(&self) -> Duration {
        Duration::from_millis(self.health_latency_ms)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            drop_derived_schema: true,
            health_latency_ms: DEFAULT_HEALTH_LATENCY_MS,
            report_limit: 50,
        }
    }
}

/// Alert thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// A logged query slower than this counts as slow.
    pub slow_query_ms: u64,
    /// Slow queries tolerated per hour.
    pub max_slow_queries: u64,
    /// Pending commissions tolerated before a WARNING.
    pub max_pending_commissions: u64,
    /// Multiple of `max_pending_commissions` that escalates to CRITICAL.
    pub critical_backlog_multiple: u64,
    /// Minimum transactions per second over the trailing hour.
    pub min_throughput_per_second: f64,
    /// Database growth ratio between samples that raises an alert.
    pub max_growth_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            slow_query_ms: 100,
            max_slow_queries: 10,
            max_pending_commissions: 1000,
            critical_backlog_multiple: 10,
            min_throughput_per_second: 100.0,
            max_growth_ratio: 0.10,
        }
    }
}

/// Monitoring loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub error_backoff_secs: u64,
    pub alert_cooldown_secs: u64,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub thresholds: AlertThresholds,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn alert_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.alert_cooldown_secs as i64)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// Set the loop interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs().max(1);
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            error_backoff_secs: DEFAULT_MONITOR_BACKOFF_SECS,
            alert_cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            webhook_url: None,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            thresholds: AlertThresholds::default(),
        }
    }
}
