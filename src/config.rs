use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use croner::Cron;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};
use tracing::{trace, warn};

use crate::alerts::AlertThresholds;
use crate::engine::EngineKind;
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "db_config.yaml";

const SMTP_PASSWORD: &str = "SMTP_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub databases: BTreeMap<String, DatabaseConfig>,
    pub monitoring: MonitoringConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(alias = "engine")]
    pub db_type: EngineKind,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_enabled", deserialize_with = "deserialize_flag")]
    pub enabled: bool,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db_type", &self.db_type)
            .field("connection_pool_size", &self.connection_pool_size)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between health ticks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Seconds a tick may run before its checks are abandoned
    pub tick_timeout: Option<u64>,
    /// Seconds between repeated alerts for the same target and metric
    pub alert_cooldown: Option<u64>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    pub email_alerts: Option<EmailConfig>,
    pub webhook: Option<Webhook>,
    pub discord: Option<Discord>,
    #[serde(default)]
    pub metrics: MetricsServerConfig,
}

impl MonitoringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout.unwrap_or(self.check_interval))
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown.unwrap_or(self.check_interval))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

#[derive(Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub alert_recipients: Vec<String>,
    /// Taken from `SMTP_PASSWORD`, never from the file
    #[serde(skip)]
    pub password: Option<String>,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("enabled", &self.enabled)
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("from_email", &self.from_email)
            .field("alert_recipients", &self.alert_recipients)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsServerConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_backup_path")]
    pub backup_path: PathBuf,
    #[serde(default = "default_enabled")]
    pub compression: bool,
    #[serde(default = "default_parallel_jobs")]
    pub parallel_jobs: usize,
    /// Seconds before the dump utility is killed
    #[serde(default = "default_backup_timeout")]
    pub timeout: u64,
}

impl BackupConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_optimize_schedule")]
    pub schedule: String,
    #[serde(default = "default_vacuum_scale_factor")]
    pub vacuum_scale_factor: f64,
    #[serde(default = "default_vacuum_threshold")]
    pub vacuum_threshold: f64,
    #[serde(default = "default_analyze_scale_factor")]
    pub analyze_scale_factor: f64,
    #[serde(default = "default_analyze_threshold")]
    pub analyze_threshold: f64,
    /// Fragmentation percent above which an index is reorganized
    #[serde(default = "default_reorganize_threshold")]
    pub reorganize_threshold: f64,
    /// Fragmentation percent above which an index is rebuilt
    #[serde(default = "default_rebuild_threshold")]
    pub rebuild_threshold: f64,
    /// Smaller indexes are never touched
    #[serde(default = "default_min_page_count")]
    pub min_page_count: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            schedule: default_optimize_schedule(),
            vacuum_scale_factor: default_vacuum_scale_factor(),
            vacuum_threshold: default_vacuum_threshold(),
            analyze_scale_factor: default_analyze_scale_factor(),
            analyze_threshold: default_analyze_threshold(),
            reorganize_threshold: default_reorganize_threshold(),
            rebuild_threshold: default_rebuild_threshold(),
            min_page_count: default_min_page_count(),
        }
    }
}

/// A parsed cron expression evaluated in local time
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let cron = Cron::new(expression).parse().map_err(|e| {
            Error::ConfigInvalid(format!("invalid cron expression '{expression}': {e}"))
        })?;

        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .find_next_occurrence(&after.with_timezone(&Local), false)
            .ok()
            .map(|next| next.with_timezone(&Utc))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Config {
    pub fn backup_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.backup.schedule)
    }

    pub fn optimize_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.performance.schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(Error::ConfigInvalid("no databases configured".to_string()));
        }

        for (name, db) in &self.databases {
            if db.connection_pool_size == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "{name}: connection_pool_size must be at least 1"
                )));
            }
            if db.host.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!("{name}: host is empty")));
            }
            if db.port == 0 {
                return Err(Error::ConfigInvalid(format!("{name}: port must not be 0")));
            }
        }

        if self.monitoring.check_interval == 0 {
            return Err(Error::ConfigInvalid(
                "monitoring.check_interval must be at least 1 second".to_string(),
            ));
        }

        if self.monitoring.tick_timeout == Some(0) {
            return Err(Error::ConfigInvalid(
                "monitoring.tick_timeout must be at least 1 second".to_string(),
            ));
        }

        if let Some(tick_timeout) = self.monitoring.tick_timeout {
            if tick_timeout > self.monitoring.check_interval {
                return Err(Error::ConfigInvalid(format!(
                    "monitoring.tick_timeout ({tick_timeout}s) must not exceed check_interval ({}s)",
                    self.monitoring.check_interval
                )));
            }
        }

        if self.backup.parallel_jobs == 0 {
            return Err(Error::ConfigInvalid(
                "backup.parallel_jobs must be at least 1".to_string(),
            ));
        }

        let perf = &self.performance;
        if perf.rebuild_threshold <= perf.reorganize_threshold {
            return Err(Error::ConfigInvalid(format!(
                "performance.rebuild_threshold ({}) must be above reorganize_threshold ({})",
                perf.rebuild_threshold, perf.reorganize_threshold
            )));
        }

        self.backup_schedule()?;
        self.optimize_schedule()?;

        Ok(())
    }

    /// Configuration used when no file exists: one local instance per engine
    pub fn default_template() -> Config {
        let yaml = r#"
databases:
  postgres_primary:
    host: localhost
    port: 5432
    database: postgres
    username: postgres
    password: password
    db_type: postgresql
  sqlserver_primary:
    host: localhost
    port: 1433
    database: master
    username: sa
    password: password
    db_type: sqlserver
monitoring:
  check_interval: 300
  alert_thresholds:
    cpu_usage: 80
    memory_usage: 85
    disk_usage: 90
    connection_count: 100
backup:
  schedule: "0 2 * * *"
  retention_days: 7
  backup_path: /var/backups/postgres
"#;
        parse_config(yaml, |_| None).expect("built-in template parses")
    }
}

/// Read, substitute and validate the configuration file
///
/// A missing file falls back to [`Config::default_template`]; everything
/// else that goes wrong is `ConfigInvalid`.
pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    if !path.exists() {
        warn!(
            "configuration file {} not found, using default configuration",
            path.display()
        );
        return Ok(Config::default_template());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
    })?;

    let config = parse_config(&content, |name| std::env::var(name).ok())?;
    config.validate()?;

    trace!("loaded config: {config:?}");
    Ok(config)
}

/// Parse a YAML document after substituting `$VAR`/`${VAR}` via `lookup`
///
/// Per-target `{NAME}_PASSWORD` and `SMTP_PASSWORD` are resolved through the
/// same lookup.
pub fn parse_config(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let expanded = expand_env(content, &lookup);
    let mut config: Config = serde_yaml::from_str(&expanded)?;

    for (name, db) in config.databases.iter_mut() {
        if let Some(password) = lookup(&format!("{}_PASSWORD", name.to_uppercase())) {
            db.password = password;
        }
    }

    if let Some(email) = config.monitoring.email_alerts.as_mut() {
        email.password = lookup(SMTP_PASSWORD).filter(|p| !p.is_empty());
    }

    Ok(config)
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("environment reference pattern compiles")
});

/// Replace environment references; unknown variables are left as written
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_VAR
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Text(text) => text.trim().eq_ignore_ascii_case("true"),
    })
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_history_size() -> usize {
    100
}

fn default_smtp_port() -> u16 {
    587
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    8000
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_backup_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("/var/backups")
}

fn default_parallel_jobs() -> usize {
    2
}

fn default_backup_timeout() -> u64 {
    3600
}

fn default_optimize_schedule() -> String {
    "0 1 * * 0".to_string()
}

fn default_vacuum_scale_factor() -> f64 {
    0.2
}

fn default_vacuum_threshold() -> f64 {
    50.0
}

fn default_analyze_scale_factor() -> f64 {
    0.1
}

fn default_analyze_threshold() -> f64 {
    50.0
}

fn default_reorganize_threshold() -> f64 {
    10.0
}

fn default_rebuild_threshold() -> f64 {
    30.0
}

fn default_min_page_count() -> f64 {
    1000.0
}
