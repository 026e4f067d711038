//! Health reports and the status summary printed by the CLI

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::backup::recent_artifacts;
use crate::error::{Error, Result};
use crate::health::HealthResult;
use crate::optimize::OptimizationResult;
use crate::target::{DatabaseTarget, TargetRegistry, TargetSummary};
use crate::util::file_timestamp;

pub const REPORT_DIR: &str = "reports";
const RECENT_BACKUPS: usize = 5;
const SUMMARY_BACKUPS: usize = 3;

/// Metrics shown in the text summary, with their labels
const SUMMARY_METRICS: &[(&str, &str)] = &[
    ("connection_count", "Active Connections"),
    ("active_queries", "Active Queries"),
    ("long_running_queries", "Long Running Queries"),
    ("query_duration_minutes", "Longest Query (minutes)"),
    ("database_size_bytes", "Database Size (MB)"),
    ("replication_lag_seconds", "Replication Lag (seconds)"),
];

/// Everything known about one target at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub target: TargetSummary,
    pub health: HealthResult,
    pub optimization: OptimizationResult,
    pub recent_backups: Vec<PathBuf>,
}

impl HealthReport {
    pub async fn build(
        target: &DatabaseTarget,
        health: HealthResult,
        optimization: OptimizationResult,
        backup_dir: &Path,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            target: target.summary(),
            health,
            optimization,
            recent_backups: recent_artifacts(backup_dir, target.name(), RECENT_BACKUPS).await,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "health_report_{}_{}.json",
            self.target.name,
            file_timestamp(self.generated_at)
        )
    }

    /// Write the report as pretty JSON into `dir`, creating it if needed
    #[instrument(skip_all, fields(db = %self.target.name))]
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        tokio::fs::write(&path, json).await?;

        info!("health report written to {}", path.display());
        Ok(path)
    }

    pub fn summary_file_name(&self) -> String {
        format!(
            "health_summary_{}_{}.txt",
            self.target.name,
            file_timestamp(self.generated_at)
        )
    }

    /// Plain-text digest for people: status, key metrics, maintenance and
    /// the newest backups
    pub fn render_summary(&self) -> String {
        let target = &self.target;
        let mut lines = vec![
            "Database Health Report Summary".to_string(),
            "=".repeat(40),
            String::new(),
            format!("Database: {}", target.name),
            format!("Report Generated: {}", self.generated_at.to_rfc3339()),
            format!("Database Type: {}", target.engine),
            format!("Host: {}:{}", target.host, target.port),
            String::new(),
            format!("Health Status: {}", self.health.status),
        ];
        if let Some(error) = &self.health.error {
            lines.push(format!("Error: {error}"));
        }
        lines.push(String::new());

        for (metric, label) in SUMMARY_METRICS {
            let Some(value) = self.health.metrics.get(*metric) else {
                continue;
            };
            let value = if *metric == "database_size_bytes" {
                format!("{:.2}", value / (1024.0 * 1024.0))
            } else {
                value.to_string()
            };
            lines.push(format!("{label}: {value}"));
        }

        if !self.recent_backups.is_empty() {
            lines.push(String::new());
            lines.push("Recent Backups:".to_string());
            for backup in self.recent_backups.iter().take(SUMMARY_BACKUPS) {
                let name = backup
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| backup.display().to_string());
                lines.push(format!("  - {name}"));
            }
        }

        let optimization = &self.optimization;
        lines.push(String::new());
        lines.push(format!(
            "Optimization Status: {}",
            if optimization.is_success() { "success" } else { "failed" }
        ));
        if let Some(error) = &optimization.error {
            lines.push(format!("Optimization Error: {error}"));
        }
        if !optimization.actions.is_empty() {
            lines.push("Maintenance Actions:".to_string());
            for action in &optimization.actions {
                let outcome = match &action.error {
                    None => "ok".to_string(),
                    Some(e) => format!("failed: {e}"),
                };
                lines.push(format!("  - {} ({outcome})", action.statement));
            }
        }
        if !optimization.recommendations.is_empty() {
            lines.push("Recommendations:".to_string());
            for recommendation in &optimization.recommendations {
                lines.push(format!("  - {recommendation}"));
            }
        }

        let mut summary = lines.join("\n");
        summary.push('\n');
        summary
    }

    /// Write [`render_summary`](Self::render_summary) next to the JSON report
    #[instrument(skip_all, fields(db = %self.target.name))]
    pub async fn write_summary(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(self.summary_file_name());
        tokio::fs::write(&path, self.render_summary()).await?;

        info!("health summary written to {}", path.display());
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Error,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub engine: String,
    pub status: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub config_file: PathBuf,
    pub databases: Vec<TargetStatus>,
}

/// Open (or reuse) a pooled connection and ping it
pub async fn test_connection(target: &DatabaseTarget) -> Result<()> {
    let mut conn = target.pool().acquire(target.acquire_timeout()).await?;
    conn.ping().await
}

pub async fn target_status(target: &DatabaseTarget) -> TargetStatus {
    let (status, error) = if !target.is_enabled() {
        (ConnectionState::Disabled, None)
    } else {
        match test_connection(target).await {
            Ok(()) => (ConnectionState::Connected, None),
            Err(e) => (ConnectionState::Error, Some(e.to_string())),
        }
    };

    TargetStatus {
        name: target.name().to_string(),
        engine: target.kind().to_string(),
        status,
        error,
    }
}

pub async fn status_summary(
    registry: &TargetRegistry,
    config_file: &Path,
    started_at: DateTime<Utc>,
) -> StatusSummary {
    let mut databases = Vec::with_capacity(registry.len());
    for target in registry.all() {
        databases.push(target_status(target).await);
    }

    StatusSummary {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - started_at).num_seconds(),
        config_file: config_file.to_path_buf(),
        databases,
    }
}
