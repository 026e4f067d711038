//! SQL Server transport over `tiberius`

use std::time::Duration;

use async_trait::async_trait;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, trace};

use super::{Connector, EngineKind, Record, Session};
use crate::config::{DatabaseConfig, SslMode};
use crate::error::{Error, Result};

/// Health metrics collected from a SQL Server target; every query yields one `FLOAT`
pub const HEALTH_QUERIES: &[(&str, &str)] = &[
    (
        "connection_count",
        "SELECT CAST(COUNT(*) AS FLOAT) FROM sys.dm_exec_sessions WHERE is_user_process = 1",
    ),
    (
        "active_queries",
        "SELECT CAST(COUNT(*) AS FLOAT) FROM sys.dm_exec_requests \
         WHERE session_id > 50 AND session_id <> @@SPID",
    ),
    (
        "query_duration_minutes",
        "SELECT CAST(COALESCE(MAX(total_elapsed_time), 0) / 60000.0 AS FLOAT) \
         FROM sys.dm_exec_requests WHERE session_id > 50 AND session_id <> @@SPID",
    ),
    (
        "database_size_bytes",
        "SELECT CAST(SUM(CAST(size AS BIGINT)) * 8192 AS FLOAT) FROM sys.database_files",
    ),
    (
        "total_wait_ms",
        "SELECT CAST(SUM(wait_time_ms) AS FLOAT) FROM sys.dm_os_wait_stats \
         WHERE wait_type NOT LIKE '%SLEEP%'",
    ),
    (
        "max_fragmentation_percent",
        "SELECT CAST(COALESCE(MAX(avg_fragmentation_in_percent), 0) AS FLOAT) \
         FROM sys.dm_db_index_physical_stats(DB_ID(), NULL, NULL, NULL, 'LIMITED') \
         WHERE page_count > 100",
    ),
    (
        "cpu_usage_percent",
        "SELECT TOP 1 CAST(record.value('(./Record/SchedulerMonitorEvent/SystemHealth/ProcessUtilization)[1]', 'int') AS FLOAT) \
         FROM (SELECT CONVERT(XML, record) AS record, [timestamp] FROM sys.dm_os_ring_buffers \
               WHERE ring_buffer_type = N'RING_BUFFER_SCHEDULER_MONITOR' \
               AND record LIKE '%<SystemHealth>%') AS rb \
         ORDER BY [timestamp] DESC",
    ),
    (
        "memory_usage_percent",
        "SELECT CAST(100.0 * (total_physical_memory_kb - available_physical_memory_kb) \
         / total_physical_memory_kb AS FLOAT) FROM sys.dm_os_sys_memory",
    ),
    (
        "disk_usage_percent",
        "SELECT CAST(MAX(100.0 * (vs.total_bytes - vs.available_bytes) / vs.total_bytes) AS FLOAT) \
         FROM sys.master_files AS mf \
         CROSS APPLY sys.dm_os_volume_stats(mf.database_id, mf.file_id) AS vs \
         WHERE mf.database_id = DB_ID()",
    ),
    (
        "deadlocks",
        "SELECT CAST(cntr_value AS FLOAT) FROM sys.dm_os_performance_counters \
         WHERE counter_name = 'Number of Deadlocks/sec' AND instance_name = '_Total'",
    ),
    (
        "replication_lag_seconds",
        "SELECT CAST(MAX(DATEDIFF(SECOND, last_commit_time, GETDATE())) AS FLOAT) \
         FROM sys.dm_hadr_database_replica_states \
         WHERE is_local = 1 AND is_primary_replica = 0",
    ),
];

/// Heaviest wait types: label, wait milliseconds
pub const TOP_WAITS: &str = "SELECT TOP 5 wait_type, CAST(wait_time_ms AS FLOAT) \
     FROM sys.dm_os_wait_stats WHERE wait_type NOT LIKE '%SLEEP%' \
     ORDER BY wait_time_ms DESC";

/// Index fragmentation: quoted `index ON schema.table` label, percent, page count
pub const INDEX_FRAGMENTATION: &str = "SELECT QUOTENAME(i.name) + N' ON ' + QUOTENAME(s.name) + N'.' + QUOTENAME(t.name), \
     CAST(ps.avg_fragmentation_in_percent AS FLOAT), CAST(ps.page_count AS FLOAT) \
     FROM sys.dm_db_index_physical_stats(DB_ID(), NULL, NULL, NULL, 'LIMITED') AS ps \
     JOIN sys.indexes AS i ON ps.object_id = i.object_id AND ps.index_id = i.index_id \
     JOIN sys.tables AS t ON t.object_id = i.object_id \
     JOIN sys.schemas AS s ON s.schema_id = t.schema_id \
     WHERE i.name IS NOT NULL \
     ORDER BY ps.avg_fragmentation_in_percent DESC";

pub const UPDATE_STATISTICS: &str = "EXEC sp_updatestats";

type TdsClient = Client<Compat<TcpStream>>;

pub struct SqlServerConnector {
    target: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    password: String,
    ssl_mode: SslMode,
    connect_timeout: Duration,
}

impl SqlServerConnector {
    pub fn new(target: &str, config: &DatabaseConfig) -> Self {
        Self {
            target: target.to_string(),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            ssl_mode: config.ssl_mode,
            connect_timeout: config.connect_timeout(),
        }
    }

    fn tds_config(&self, host: &str, port: u16) -> Config {
        let mut config = Config::new();
        config.host(host);
        config.port(port);
        config.database(&self.database);
        config.application_name("db-automation");
        config.authentication(AuthMethod::sql_server(&self.username, &self.password));

        let encryption = match self.ssl_mode {
            SslMode::Disable => EncryptionLevel::NotSupported,
            SslMode::Allow | SslMode::Prefer => EncryptionLevel::On,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => EncryptionLevel::Required,
        };
        config.encryption(encryption);

        if !matches!(self.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull) {
            config.trust_cert();
        }

        config
    }

    async fn open(&self) -> std::result::Result<TdsClient, TdsError> {
        let config = self.tds_config(&self.host, self.port);
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        match Client::connect(config, tcp.compat_write()).await {
            // Availability group listeners redirect to the current primary
            Err(TdsError::Routing { host, port }) => {
                debug!(db = %self.target, %host, port, "following routing redirect");
                let config = self.tds_config(&host, port);
                let tcp = TcpStream::connect(config.get_addr()).await?;
                tcp.set_nodelay(true)?;
                Client::connect(config, tcp.compat_write()).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Connector for SqlServerConnector {
    fn kind(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    async fn connect(&self) -> Result<Box<dyn Session>> {
        let client = match timeout(self.connect_timeout, self.open()).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(Error::ConnectFailed {
                    target: self.target.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(Error::ConnectFailed {
                    target: self.target.clone(),
                    reason: format!("timed out after {}s", self.connect_timeout.as_secs()),
                });
            }
        };

        Ok(Box::new(SqlServerSession { client }))
    }
}

pub struct SqlServerSession {
    client: TdsClient,
}

fn column_f64(data: &ColumnData<'_>) -> Option<f64> {
    match data {
        ColumnData::F64(v) => *v,
        ColumnData::F32(v) => v.map(f64::from),
        ColumnData::I64(v) => v.map(|v| v as f64),
        ColumnData::I32(v) => v.map(f64::from),
        ColumnData::I16(v) => v.map(f64::from),
        ColumnData::U8(v) => v.map(f64::from),
        ColumnData::Bit(v) => v.map(|b| if b { 1.0 } else { 0.0 }),
        ColumnData::Numeric(v) => {
            v.map(|n| n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }
        _ => None,
    }
}

fn column_text(data: ColumnData<'static>) -> String {
    match data {
        ColumnData::String(Some(s)) => s.into_owned(),
        _ => String::new(),
    }
}

#[async_trait]
impl Session for SqlServerSession {
    async fn ping(&mut self) -> Result<()> {
        self.scalar("SELECT 1").await.map(|_| ())
    }

    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>> {
        trace!(sql, "scalar query");
        let row = self.client.simple_query(sql).await?.into_row().await?;

        Ok(row.and_then(|row| row.into_iter().next().and_then(|c| column_f64(&c))))
    }

    async fn records(&mut self, sql: &str) -> Result<Vec<Record>> {
        trace!(sql, "record query");
        let rows = self
            .client
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut columns = row.into_iter();
                let label = columns.next().map(column_text).unwrap_or_default();
                let values = columns
                    .map(|c| column_f64(&c).unwrap_or(f64::NAN))
                    .collect();
                Record { label, values }
            })
            .collect())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        trace!(sql, "execute");
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let _ = self.client.close().await;
    }
}
