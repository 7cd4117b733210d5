use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the appstats service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Event reporting and stats API server.
    #[serde(default)]
    pub server: ServerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Event store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Report window defaults and limits.
    #[serde(default)]
    pub report: ReportConfig,
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Which event store implementation backs the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store. Data is lost on restart.
    #[default]
    Memory,
    /// ClickHouse over the native TCP protocol.
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

impl StoreBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::ClickHouse => "clickhouse",
        }
    }
}

/// Event store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Backend to use. Default: memory.
    #[serde(default)]
    pub backend: StoreBackend,

    /// ClickHouse connection, used when `backend` is `clickhouse`.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Upper bound on a single store query. Default: 10s.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Report window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Window length used when a request does not name one. Default: 7.
    #[serde(default = "default_window_days")]
    pub window_days: u32,

    /// Longest window a request may ask for. Default: 366.
    #[serde(default = "default_max_window_days")]
    pub max_window_days: u32,

    /// Categories kept by the region breakdown before folding the tail
    /// into "other". Default: 5.
    #[serde(default = "default_region_top_n")]
    pub region_top_n: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_clickhouse_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_window_days() -> u32 {
    7
}

/// Upper bound accepted for `report.max_window_days` (about ten years).
pub const MAX_WINDOW_DAYS_LIMIT: u32 = 3660;

fn default_max_window_days() -> u32 {
    366
}

fn default_region_top_n() -> usize {
    5
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            health: HealthConfig::default(),
            store: StoreConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_clickhouse_endpoint(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            query_timeout: default_query_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            max_window_days: default_max_window_days(),
            region_top_n: default_region_top_n(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Returns the log filter to use: the command-line value when given,
    /// otherwise `log_level` from the file.
    pub fn effective_log_level<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.filter(|level| !level.is_empty())
            .unwrap_or(self.log_level.as_str())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        if self.report.max_window_days == 0 {
            bail!("report.max_window_days must be positive");
        }

        if self.report.max_window_days > MAX_WINDOW_DAYS_LIMIT {
            bail!(
                "report.max_window_days ({}) must not exceed {MAX_WINDOW_DAYS_LIMIT}",
                self.report.max_window_days
            );
        }

        if self.report.window_days == 0 {
            bail!("report.window_days must be positive");
        }

        if self.report.window_days > self.report.max_window_days {
            bail!(
                "report.window_days ({}) must not exceed report.max_window_days ({})",
                self.report.window_days,
                self.report.max_window_days
            );
        }

        if self.report.region_top_n == 0 {
            bail!("report.region_top_n must be positive");
        }

        if self.store.backend == StoreBackend::ClickHouse {
            let ch = &self.store.clickhouse;
            if ch.endpoint.is_empty() {
                bail!("store.clickhouse.endpoint is required when store.backend is clickhouse");
            }
            if ch.database.is_empty() {
                bail!("store.clickhouse.database is required when store.backend is clickhouse");
            }
            if ch.query_timeout.is_zero() {
                bail!("store.clickhouse.query_timeout must be positive");
            }
        }

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
