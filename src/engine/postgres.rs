//! PostgreSQL transport over a single `sqlx` connection per session

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use tokio::time::timeout;
use tracing::trace;

use super::{Connector, EngineKind, Record, Session};
use crate::config::{DatabaseConfig, SslMode};
use crate::error::{Error, Result};

/// Health metrics collected from a PostgreSQL target, in collection order
///
/// Every query returns a single `float8`.
pub const HEALTH_QUERIES: &[(&str, &str)] = &[
    (
        "connection_count",
        "SELECT count(*)::float8 FROM pg_stat_activity WHERE datname = current_database()",
    ),
    (
        "active_queries",
        "SELECT count(*)::float8 FROM pg_stat_activity \
         WHERE datname = current_database() AND state = 'active' AND pid <> pg_backend_pid()",
    ),
    (
        "long_running_queries",
        "SELECT count(*)::float8 FROM pg_stat_activity \
         WHERE datname = current_database() AND state = 'active' \
         AND now() - query_start > interval '5 minutes'",
    ),
    (
        "query_duration_minutes",
        "SELECT COALESCE(max(EXTRACT(EPOCH FROM now() - query_start)) / 60.0, 0)::float8 \
         FROM pg_stat_activity \
         WHERE datname = current_database() AND state = 'active' AND pid <> pg_backend_pid()",
    ),
    (
        "database_size_bytes",
        "SELECT pg_database_size(current_database())::float8",
    ),
    (
        "dead_tuple_ratio",
        "SELECT COALESCE(sum(n_dead_tup)::float8 / NULLIF(sum(n_live_tup) + sum(n_dead_tup), 0), 0)::float8 \
         FROM pg_stat_user_tables",
    ),
    (
        "index_scans",
        "SELECT COALESCE(sum(idx_scan), 0)::float8 FROM pg_stat_user_indexes",
    ),
    (
        "replication_lag_seconds",
        "SELECT CASE WHEN pg_is_in_recovery() \
         THEN COALESCE(EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp()), 0) \
         ELSE NULL END::float8",
    ),
    (
        "deadlocks",
        "SELECT deadlocks::float8 FROM pg_stat_database WHERE datname = current_database()",
    ),
    (
        "conflicts",
        "SELECT conflicts::float8 FROM pg_stat_database WHERE datname = current_database()",
    ),
    (
        "cache_hit_ratio",
        "SELECT COALESCE(blks_hit::float8 / NULLIF(blks_hit + blks_read, 0), 0)::float8 \
         FROM pg_stat_database WHERE datname = current_database()",
    ),
];

/// Per-table activity: label, live tuples, dead tuples, modifications since analyze
pub const TABLE_STATS: &str = "SELECT format('%I.%I', schemaname, relname), \
     n_live_tup::float8, n_dead_tup::float8, n_mod_since_analyze::float8 \
     FROM pg_stat_user_tables ORDER BY n_dead_tup DESC";

/// Column statistics: label, n_distinct, correlation
pub const COLUMN_STATS: &str = "SELECT format('%I.%I(%I)', schemaname, tablename, attname), \
     n_distinct::float8, correlation::float8 \
     FROM pg_stats WHERE schemaname NOT IN ('pg_catalog', 'information_schema')";

pub struct PostgresConnector {
    target: String,
    options: PgConnectOptions,
    connect_timeout: std::time::Duration,
}

impl PostgresConnector {
    pub fn new(target: &str, config: &DatabaseConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(ssl_mode(config.ssl_mode))
            .application_name("db-automation");

        Self {
            target: target.to_string(),
            options,
            connect_timeout: config.connect_timeout(),
        }
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn Session>> {
        let connect_failed = |reason: String| Error::ConnectFailed {
            target: self.target.clone(),
            reason,
        };

        let conn = timeout(self.connect_timeout, self.options.connect())
            .await
            .map_err(|_| {
                connect_failed(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| connect_failed(e.to_string()))?;

        Ok(Box::new(PostgresSession { conn }))
    }
}

pub struct PostgresSession {
    conn: PgConnection,
}

/// Numeric column as `f64`, whatever integer or float type the server sent
fn column_f64(row: &PgRow, index: usize) -> Option<f64> {
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v as f64);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(f64::from);
    }
    if let Ok(value) = row.try_get::<Option<f32>, _>(index) {
        return value.map(f64::from);
    }
    None
}

#[async_trait]
impl Session for PostgresSession {
    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>> {
        trace!(sql, "scalar query");
        let row = sqlx::query(sql).fetch_optional(&mut self.conn).await?;
        Ok(row.and_then(|row| column_f64(&row, 0)))
    }

    async fn records(&mut self, sql: &str) -> Result<Vec<Record>> {
        trace!(sql, "record query");
        let rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let label = row
                    .try_get::<Option<String>, _>(0)
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                let values = (1..row.len())
                    .map(|i| column_f64(row, i).unwrap_or(f64::NAN))
                    .collect();
                Record { label, values }
            })
            .collect())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "execute");
        // Simple-protocol query so VACUUM runs outside an implicit transaction
        self.conn.execute(sql).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.close().await;
    }
}
