//! Routine maintenance: VACUUM/ANALYZE on PostgreSQL, index upkeep on SQL Server
//!
//! Deciding what to do is kept in plain functions over fetched statistics so
//! it can be tested without a database; [`PerformanceOptimizer`] only fetches,
//! plans and executes.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PerformanceConfig;
use crate::engine::{EngineKind, Record, postgres, sqlserver};
use crate::error::Error;
use crate::pool::PooledConnection;
use crate::target::DatabaseTarget;
use crate::util::as_secs_f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Vacuum,
    Analyze,
    Rebuild,
    Reorganize,
    UpdateStatistics,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Vacuum => "vacuum",
            ActionKind::Analyze => "analyze",
            ActionKind::Rebuild => "rebuild",
            ActionKind::Reorganize => "reorganize",
            ActionKind::UpdateStatistics => "update_statistics",
        }
    }
}

/// A statement the optimizer intends to run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub object: String,
    pub statement: String,
}

/// A statement the optimizer ran, and how it went
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceAction {
    pub kind: ActionKind,
    pub object: String,
    pub statement: String,
    pub error: Option<String>,
    #[serde(rename = "duration_seconds", serialize_with = "as_secs_f64")]
    pub duration: Duration,
}

impl MaintenanceAction {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<MaintenanceAction>,
    pub recommendations: Vec<String>,
    /// Set when statistics could not be read at all
    pub error: Option<String>,
    #[serde(rename = "duration_seconds", serialize_with = "as_secs_f64")]
    pub duration: Duration,
}

impl OptimizationResult {
    pub fn failed_actions(&self) -> impl Iterator<Item = &MaintenanceAction> {
        self.actions.iter().filter(|a| !a.succeeded())
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_actions().next().is_none()
    }
}

/// VACUUM or ANALYZE for each table whose churn exceeds the configured
/// threshold plus scale factor times its live rows
///
/// Expects rows of `postgres::TABLE_STATS`: label, live, dead, modified.
pub fn plan_postgres(tables: &[Record], settings: &PerformanceConfig) -> Vec<PlannedAction> {
    tables
        .iter()
        .filter_map(|table| {
            let live = table.value(0);
            let dead = table.value(1);
            let modified = table.value(2);

            if dead > settings.vacuum_threshold + settings.vacuum_scale_factor * live {
                Some(PlannedAction {
                    kind: ActionKind::Vacuum,
                    object: table.label.clone(),
                    statement: format!("VACUUM (ANALYZE) {}", table.label),
                })
            } else if modified > settings.analyze_threshold + settings.analyze_scale_factor * live
            {
                Some(PlannedAction {
                    kind: ActionKind::Analyze,
                    object: table.label.clone(),
                    statement: format!("ANALYZE {}", table.label),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Rebuild above the rebuild threshold, reorganize above the reorganize
/// threshold, nothing otherwise
pub fn fragmentation_action(fragmentation: f64, settings: &PerformanceConfig) -> Option<ActionKind> {
    if fragmentation > settings.rebuild_threshold {
        Some(ActionKind::Rebuild)
    } else if fragmentation > settings.reorganize_threshold {
        Some(ActionKind::Reorganize)
    } else {
        None
    }
}

/// Index maintenance for SQL Server
///
/// Expects rows of `sqlserver::INDEX_FRAGMENTATION`: label, fragmentation
/// percent, page count. Indexes smaller than `min_page_count` are skipped.
pub fn plan_sqlserver(indexes: &[Record], settings: &PerformanceConfig) -> Vec<PlannedAction> {
    indexes
        .iter()
        .filter(|index| index.value(1) >= settings.min_page_count)
        .filter_map(|index| {
            let kind = fragmentation_action(index.value(0), settings)?;
            let verb = match kind {
                ActionKind::Rebuild => "REBUILD",
                _ => "REORGANIZE",
            };
            Some(PlannedAction {
                kind,
                object: index.label.clone(),
                statement: format!("ALTER INDEX {} {verb}", index.label),
            })
        })
        .collect()
}

/// Columns that look like good index candidates: many distinct values
/// stored in an order unrelated to the column
///
/// Expects rows of `postgres::COLUMN_STATS`: label, n_distinct, correlation.
pub fn index_recommendations(columns: &[Record]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| c.value(0) > 100.0 && c.value(1) < 0.1)
        .map(|c| {
            format!(
                "consider an index on {} (n_distinct {}, correlation {:.2})",
                c.label,
                c.value(0),
                c.value(1)
            )
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceOptimizer {
    settings: PerformanceConfig,
}

impl PerformanceOptimizer {
    pub fn new(settings: PerformanceConfig) -> Self {
        Self { settings }
    }

    /// Run maintenance on one target
    ///
    /// Every action is attempted; failures are recorded on the action and
    /// the remaining actions still run.
    #[instrument(skip_all, fields(db = %target.name()))]
    pub async fn optimize(&self, target: &DatabaseTarget) -> OptimizationResult {
        let started = Instant::now();
        let mut result = OptimizationResult {
            target: target.name().to_string(),
            timestamp: Utc::now(),
            actions: Vec::new(),
            recommendations: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        };

        match target.pool().acquire(target.acquire_timeout()).await {
            Ok(mut conn) => match target.kind() {
                EngineKind::Postgres => self.optimize_postgres(&mut conn, &mut result).await,
                EngineKind::SqlServer => self.optimize_sqlserver(&mut conn, &mut result).await,
            },
            Err(e) => {
                error!("optimization could not get a connection: {e}");
                result.error = Some(e.to_string());
            }
        }

        result.duration = started.elapsed();
        info!(
            actions = result.actions.len(),
            failed = result.failed_actions().count(),
            recommendations = result.recommendations.len(),
            "optimization finished"
        );
        result
    }

    async fn optimize_postgres(&self, conn: &mut PooledConnection, result: &mut OptimizationResult) {
        match conn.records(postgres::TABLE_STATS).await {
            Ok(tables) => {
                for action in plan_postgres(&tables, &self.settings) {
                    result.actions.push(run_action(conn, action).await);
                }
            }
            Err(e) => {
                error!("could not read table statistics: {e}");
                result.error = Some(e.to_string());
            }
        }

        match conn.records(postgres::COLUMN_STATS).await {
            Ok(columns) => result.recommendations = index_recommendations(&columns),
            Err(e) => warn!("could not read column statistics: {e}"),
        }
    }

    async fn optimize_sqlserver(&self, conn: &mut PooledConnection, result: &mut OptimizationResult) {
        let update_stats = PlannedAction {
            kind: ActionKind::UpdateStatistics,
            object: "database".to_string(),
            statement: sqlserver::UPDATE_STATISTICS.to_string(),
        };
        result.actions.push(run_action(conn, update_stats).await);

        match conn.records(sqlserver::INDEX_FRAGMENTATION).await {
            Ok(indexes) => {
                for action in plan_sqlserver(&indexes, &self.settings) {
                    result.actions.push(run_action(conn, action).await);
                }
            }
            Err(e) => {
                error!("could not read index fragmentation: {e}");
                result.error = Some(e.to_string());
            }
        }
    }
}

async fn run_action(conn: &mut PooledConnection, action: PlannedAction) -> MaintenanceAction {
    let started = Instant::now();
    debug!(statement = %action.statement, "running maintenance");

    let error = match conn.execute(&action.statement).await {
        Ok(()) => None,
        Err(e) => {
            let failure = Error::OptimizationActionFailed {
                action: action.statement.clone(),
                reason: e.to_string(),
            };
            warn!("{failure}");
            Some(failure.to_string())
        }
    };

    MaintenanceAction {
        kind: action.kind,
        object: action.object,
        statement: action.statement,
        error,
        duration: started.elapsed(),
    }
}
