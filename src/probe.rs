//! Engine-specific health introspection

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::engine::{EngineKind, postgres, sqlserver};
use crate::pool::PooledConnection;

/// Metrics gathered by one probe run plus the queries that failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub metrics: BTreeMap<String, f64>,
    pub failures: Vec<ProbeFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeFailure {
    pub metric: String,
    pub error: String,
}

/// Health probe for one engine
///
/// Each variant runs its own introspection queries one at a time. A query
/// that fails is logged and left out of the report; the rest still run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProbe {
    Postgres,
    SqlServer,
}

impl EngineProbe {
    pub fn for_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Postgres => EngineProbe::Postgres,
            EngineKind::SqlServer => EngineProbe::SqlServer,
        }
    }

    fn scalar_queries(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EngineProbe::Postgres => postgres::HEALTH_QUERIES,
            EngineProbe::SqlServer => sqlserver::HEALTH_QUERIES,
        }
    }

    pub async fn collect(&self, conn: &mut PooledConnection) -> ProbeReport {
        let mut report = ProbeReport::default();

        for (metric, sql) in self.scalar_queries() {
            match conn.scalar(sql).await {
                Ok(Some(value)) if value.is_finite() => {
                    trace!(metric, value, "collected");
                    report.metrics.insert(metric.to_string(), value);
                }
                // e.g. replication lag on a primary
                Ok(_) => trace!(metric, "no value"),
                Err(e) => {
                    warn!(db = %conn.target(), metric, kind = e.kind(), "probe query failed: {e}");
                    report.failures.push(ProbeFailure {
                        metric: metric.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let EngineProbe::SqlServer = self {
            match conn.records(sqlserver::TOP_WAITS).await {
                Ok(waits) => {
                    for wait in waits.iter().filter(|w| w.value(0).is_finite()) {
                        report
                            .metrics
                            .insert(format!("wait_ms.{}", wait.label), wait.value(0));
                    }
                }
                Err(e) => {
                    warn!(db = %conn.target(), "wait statistics query failed: {e}");
                    report.failures.push(ProbeFailure {
                        metric: "top_waits".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
