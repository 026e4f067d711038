//! Exported counters, histograms and gauges
//!
//! Everything is registered on a `prometheus::Registry` handed in by the
//! caller, so tests and the daemon each get their own isolated set.
//! Prometheus collectors are internally synchronized; concurrent writers
//! and the exposition handler never block each other for longer than an
//! atomic update.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::trace;

use crate::alerts::AlertEvent;
use crate::backup::{BackupOutcome, BackupResult};
use crate::error::Result;
use crate::health::{HealthResult, HealthStatus};
use crate::optimize::OptimizationResult;

/// Bucket boundaries for check and query durations, in seconds
pub const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Content type of [`MetricsRegistry::snapshot`]
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    connections_total: CounterVec,
    query_duration_seconds: HistogramVec,
    health_status: GaugeVec,
    health_metric: GaugeVec,
    backups_total: CounterVec,
    backup_size_bytes: GaugeVec,
    optimization_actions_total: CounterVec,
    alerts_total: CounterVec,
    /// Health metric names last exported per database
    exported_health_metrics: Arc<Mutex<HashMap<String, BTreeSet<String>>>>,
}

impl MetricsRegistry {
    pub fn new(registry: Registry) -> Result<Self> {
        let connections_total = CounterVec::new(
            Opts::new("db_connections_total", "Connection attempts by database and status"),
            &["database", "status"],
        )?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "db_query_duration_seconds",
                "Duration of checks and maintenance operations in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["database", "query_type"],
        )?;

        let health_status = GaugeVec::new(
            Opts::new(
                "db_health_status",
                "Database health (1 healthy, 0.5 degraded, 0 down)",
            ),
            &["database"],
        )?;

        let health_metric = GaugeVec::new(
            Opts::new("db_health_metric", "Latest value of each collected health metric"),
            &["database", "metric"],
        )?;

        let backups_total = CounterVec::new(
            Opts::new("db_backups_total", "Backup operations by database and status"),
            &["database", "status"],
        )?;

        let backup_size_bytes = GaugeVec::new(
            Opts::new("db_backup_size_bytes", "Size of the last successful backup"),
            &["database"],
        )?;

        let optimization_actions_total = CounterVec::new(
            Opts::new(
                "db_optimization_actions_total",
                "Maintenance actions by database, action and outcome",
            ),
            &["database", "action", "outcome"],
        )?;

        let alerts_total = CounterVec::new(
            Opts::new("db_alerts_total", "Alerts raised by database, metric and severity"),
            &["database", "metric", "severity"],
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(query_duration_seconds.clone()))?;
        registry.register(Box::new(health_status.clone()))?;
        registry.register(Box::new(health_metric.clone()))?;
        registry.register(Box::new(backups_total.clone()))?;
        registry.register(Box::new(backup_size_bytes.clone()))?;
        registry.register(Box::new(optimization_actions_total.clone()))?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            query_duration_seconds,
            health_status,
            health_metric,
            backups_total,
            backup_size_bytes,
            optimization_actions_total,
            alerts_total,
            exported_health_metrics: Arc::default(),
        })
    }

    pub fn record_health(&self, result: &HealthResult) {
        let database = result.target.as_str();
        let connected = if result.status == HealthStatus::Down {
            "failed"
        } else {
            "success"
        };

        self.connections_total
            .with_label_values(&[database, connected])
            .inc();
        self.query_duration_seconds
            .with_label_values(&[database, "health_check"])
            .observe(result.duration.as_secs_f64());
        self.health_status
            .with_label_values(&[database])
            .set(result.status.gauge_value());

        // a metric missing from this result must not keep its old value
        let mut exported = self
            .exported_health_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = exported.entry(database.to_string()).or_default();
        for stale in previous.iter().filter(|m| !result.metrics.contains_key(*m)) {
            if let Err(e) = self
                .health_metric
                .remove_label_values(&[database, stale.as_str()])
            {
                trace!(database, metric = %stale, "no gauge to remove: {e}");
            }
        }
        *previous = result.metrics.keys().cloned().collect();

        for (metric, value) in &result.metrics {
            self.health_metric
                .with_label_values(&[database, metric.as_str()])
                .set(*value);
        }

        trace!(database, status = %result.status, "recorded health");
    }

    pub fn record_backup(&self, result: &BackupResult) {
        let database = result.target.as_str();

        self.backups_total
            .with_label_values(&[database, result.outcome.as_str()])
            .inc();
        self.query_duration_seconds
            .with_label_values(&[database, "backup"])
            .observe(result.duration.as_secs_f64());

        if result.outcome == BackupOutcome::Success {
            self.backup_size_bytes
                .with_label_values(&[database])
                .set(result.size_bytes as f64);
        }
    }

    /// Count a backup request turned away because one was already running
    pub fn record_backup_rejected(&self, database: &str) {
        self.backups_total
            .with_label_values(&[database, "rejected"])
            .inc();
    }

    pub fn record_optimization(&self, result: &OptimizationResult) {
        let database = result.target.as_str();

        self.query_duration_seconds
            .with_label_values(&[database, "optimization"])
            .observe(result.duration.as_secs_f64());

        for action in &result.actions {
            let outcome = if action.succeeded() { "success" } else { "failed" };
            self.optimization_actions_total
                .with_label_values(&[database, action.kind.as_str(), outcome])
                .inc();
        }
    }

    pub fn record_alert(&self, event: &AlertEvent) {
        self.alerts_total
            .with_label_values(&[
                event.target.as_str(),
                event.metric.as_str(),
                event.severity.as_str(),
            ])
            .inc();
    }

    /// Current state in the text exposition format
    pub fn snapshot(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}
