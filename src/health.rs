use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::alerts::AlertThresholds;
use crate::target::DatabaseTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }

    /// Value exported on the health gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Down => 0.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one health check of one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub connection_count: Option<u64>,
    pub active_queries: Option<u64>,
    /// Seconds behind the primary; only reported by replicas
    pub replication_lag: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub error: Option<String>,
    #[serde(rename = "duration_seconds", serialize_with = "crate::util::as_secs_f64")]
    pub duration: Duration,
}

impl HealthResult {
    pub fn down(target: impl Into<String>, error: impl fmt::Display, duration: Duration) -> Self {
        Self {
            target: target.into(),
            timestamp: Utc::now(),
            status: HealthStatus::Down,
            connection_count: None,
            active_queries: None,
            replication_lag: None,
            metrics: BTreeMap::new(),
            error: Some(error.to_string()),
            duration,
        }
    }

    pub fn is_down(&self) -> bool {
        self.status == HealthStatus::Down
    }
}

/// Runs the engine probe for a target and derives its status
#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    thresholds: AlertThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    /// Check one target
    ///
    /// Never fails: connectivity problems yield a `down` result and failing
    /// introspection queries are left out of the metrics. The pooled
    /// connection goes back to the pool however the check ends.
    #[instrument(skip_all, fields(db = %target.name()))]
    pub async fn check(&self, target: &DatabaseTarget) -> HealthResult {
        let started = Instant::now();

        let mut conn = match target.pool().acquire(target.acquire_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("health check could not get a connection: {e}");
                return HealthResult::down(target.name(), e, started.elapsed());
            }
        };

        if let Err(e) = conn.ping().await {
            error!("connectivity probe failed: {e}");
            return HealthResult::down(target.name(), e, started.elapsed());
        }

        let report = target.probe().collect(&mut conn).await;
        drop(conn);

        let metrics = report.metrics;
        let breaches = self.thresholds.breaches(&metrics);
        let status = if breaches.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        debug!(
            %status,
            collected = metrics.len(),
            failed = report.failures.len(),
            breaches = breaches.len(),
            "health check finished"
        );

        HealthResult {
            target: target.name().to_string(),
            timestamp: Utc::now(),
            status,
            connection_count: metrics.get("connection_count").map(|v| *v as u64),
            active_queries: metrics.get("active_queries").map(|v| *v as u64),
            replication_lag: metrics.get("replication_lag_seconds").copied(),
            metrics,
            error: None,
            duration: started.elapsed(),
        }
    }

    /// Check every given target concurrently, results in input order
    pub async fn check_all(&self, targets: &[Arc<DatabaseTarget>]) -> Vec<HealthResult> {
        join_all(targets.iter().map(|target| self.check(target))).await
    }
}
