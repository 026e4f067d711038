//! Threshold evaluation and alert deduplication

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, instrument};

use crate::backup::{BackupOutcome, BackupResult};
use crate::health::{HealthResult, HealthStatus};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ConnectionCount,
    QueryDurationMinutes,
    DiskUsage,
    CpuUsage,
    MemoryUsage,
    Deadlocks,
    /// The target could not be reached at all
    Availability,
    /// A backup run failed
    Backup,
    /// Totals of a batch of backups started together
    BackupSummary,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::ConnectionCount => "connection_count",
            AlertMetric::QueryDurationMinutes => "query_duration_minutes",
            AlertMetric::DiskUsage => "disk_usage",
            AlertMetric::CpuUsage => "cpu_usage",
            AlertMetric::MemoryUsage => "memory_usage",
            AlertMetric::Deadlocks => "deadlocks",
            AlertMetric::Availability => "availability",
            AlertMetric::Backup => "backup",
            AlertMetric::BackupSummary => "backup_summary",
        }
    }

    /// Key of the health metric this threshold is compared against
    pub fn health_metric(&self) -> Option<&'static str> {
        match self {
            AlertMetric::ConnectionCount => Some("connection_count"),
            AlertMetric::QueryDurationMinutes => Some("query_duration_minutes"),
            AlertMetric::DiskUsage => Some("disk_usage_percent"),
            AlertMetric::CpuUsage => Some("cpu_usage_percent"),
            AlertMetric::MemoryUsage => Some("memory_usage_percent"),
            AlertMetric::Deadlocks => Some("deadlocks"),
            AlertMetric::Availability | AlertMetric::Backup | AlertMetric::BackupSummary => None,
        }
    }
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit and the severity reported when it is exceeded
///
/// Written in YAML either as a bare number (warning) or as
/// `{ limit: 90, severity: critical }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdRule {
    pub limit: f64,
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn warning(limit: f64) -> Self {
        Self {
            limit,
            severity: Severity::Warning,
        }
    }

    pub fn critical(limit: f64) -> Self {
        Self {
            limit,
            severity: Severity::Critical,
        }
    }

    pub fn exceeded_by(&self, value: f64) -> bool {
        value > self.limit
    }
}

impl<'de> Deserialize<'de> for ThresholdRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Limit(f64),
            Rule {
                limit: f64,
                #[serde(default)]
                severity: Severity,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Limit(limit) => ThresholdRule::warning(limit),
            Raw::Rule { limit, severity } => ThresholdRule { limit, severity },
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AlertThresholds {
    pub connection_count: Option<ThresholdRule>,
    pub query_duration_minutes: Option<ThresholdRule>,
    pub disk_usage: Option<ThresholdRule>,
    pub cpu_usage: Option<ThresholdRule>,
    pub memory_usage: Option<ThresholdRule>,
    pub deadlocks: Option<ThresholdRule>,
}

/// One threshold exceeded by one observed value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub metric: AlertMetric,
    pub value: f64,
    pub rule: ThresholdRule,
}

impl AlertThresholds {
    pub fn rules(&self) -> impl Iterator<Item = (AlertMetric, ThresholdRule)> + '_ {
        [
            (AlertMetric::ConnectionCount, self.connection_count),
            (AlertMetric::QueryDurationMinutes, self.query_duration_minutes),
            (AlertMetric::DiskUsage, self.disk_usage),
            (AlertMetric::CpuUsage, self.cpu_usage),
            (AlertMetric::MemoryUsage, self.memory_usage),
            (AlertMetric::Deadlocks, self.deadlocks),
        ]
        .into_iter()
        .filter_map(|(metric, rule)| rule.map(|rule| (metric, rule)))
    }

    /// Every configured threshold the given metrics exceed
    ///
    /// Metrics that were not collected never breach.
    pub fn breaches(&self, metrics: &BTreeMap<String, f64>) -> Vec<Breach> {
        self.rules()
            .filter_map(|(metric, rule)| {
                let key = metric.health_metric()?;
                let value = *metrics.get(key)?;
                rule.exceeded_by(value).then_some(Breach {
                    metric,
                    value,
                    rule,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub target: String,
    pub severity: Severity,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl AlertEvent {
    /// One-line summary used as email subject and embed title
    pub fn subject(&self) -> String {
        match self.metric {
            AlertMetric::Availability => format!("{} is unreachable", self.target),
            AlertMetric::Backup => format!("Backup failed for {}", self.target),
            AlertMetric::BackupSummary => "Backup run summary".to_string(),
            metric => format!("{metric} threshold exceeded on {}", self.target),
        }
    }
}

/// Turns health and backup results into alert events
///
/// The only state kept between calls is the time of the last alert per
/// (target, metric), used to suppress repeats within the cooldown window.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    cooldown: chrono::Duration,
    last_alert: HashMap<(String, AlertMetric), DateTime<Utc>>,
}

impl AlertEvaluator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_alert: HashMap::new(),
        }
    }

    #[instrument(skip_all, fields(db = %result.target))]
    pub fn evaluate(
        &mut self,
        result: &HealthResult,
        thresholds: &AlertThresholds,
    ) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        if result.status == HealthStatus::Down {
            let message = format!(
                "{} is down: {}",
                result.target,
                result.error.as_deref().unwrap_or("health check failed")
            );
            events.extend(self.admit(AlertEvent {
                target: result.target.clone(),
                severity: Severity::Critical,
                metric: AlertMetric::Availability,
                value: 0.0,
                threshold: 1.0,
                timestamp: result.timestamp,
                message,
            }));
            return events;
        }

        for breach in thresholds.breaches(&result.metrics) {
            let message = format!(
                "{}: {} is {:.2}, above the limit of {}",
                result.target, breach.metric, breach.value, breach.rule.limit
            );
            events.extend(self.admit(AlertEvent {
                target: result.target.clone(),
                severity: breach.rule.severity,
                metric: breach.metric,
                value: breach.value,
                threshold: breach.rule.limit,
                timestamp: result.timestamp,
                message,
            }));
        }

        events
    }

    /// Critical alert for a failed backup, subject to the same cooldown
    pub fn evaluate_backup(&mut self, result: &BackupResult) -> Option<AlertEvent> {
        if result.outcome != BackupOutcome::Failed {
            return None;
        }

        self.admit(AlertEvent {
            target: result.target.clone(),
            severity: Severity::Critical,
            metric: AlertMetric::Backup,
            value: 0.0,
            threshold: 1.0,
            timestamp: result.timestamp,
            message: format!(
                "backup of {} failed: {}",
                result.target,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        })
    }

    fn admit(&mut self, event: AlertEvent) -> Option<AlertEvent> {
        let key = (event.target.clone(), event.metric);

        if let Some(last) = self.last_alert.get(&key) {
            if event.timestamp.signed_duration_since(*last) < self.cooldown {
                debug!(metric = %event.metric, "alert suppressed by cooldown");
                return None;
            }
        }

        self.last_alert.insert(key, event.timestamp);
        Some(event)
    }
}
