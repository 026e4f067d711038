//! Scripted database engine for integration tests
//!
//! Answers health queries from a table of metric values, optionally after a
//! delay, and counts how many sessions are open at any moment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db_automation::Error;
use db_automation::config::{DatabaseConfig, SslMode};
use db_automation::engine::{Connector, EngineKind, Record, Session, postgres, sqlserver};
use db_automation::target::DatabaseTarget;

#[derive(Default)]
struct Script {
    values: HashMap<String, f64>,
    delay: Duration,
    refuse: bool,
}

#[derive(Clone)]
pub struct ScriptedDb {
    kind: EngineKind,
    script: Arc<Mutex<Script>>,
    live: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl ScriptedDb {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            script: Arc::default(),
            live: Arc::default(),
            opened: Arc::default(),
        }
    }

    /// Answer the health query for `metric` with `value`
    pub fn with_metric(self, metric: &str, value: f64) -> Self {
        let queries = match self.kind {
            EngineKind::Postgres => postgres::HEALTH_QUERIES,
            EngineKind::SqlServer => sqlserver::HEALTH_QUERIES,
        };
        let sql = queries
            .iter()
            .find(|(name, _)| *name == metric)
            .map(|(_, sql)| *sql)
            .unwrap_or_else(|| panic!("no health query named {metric}"));

        self.script
            .lock()
            .unwrap()
            .values
            .insert(sql.to_string(), value);
        self
    }

    /// Every query sleeps this long before answering
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().delay = delay;
        self
    }

    pub fn refusing(self) -> Self {
        self.script.lock().unwrap().refuse = true;
        self
    }

    /// Sessions currently open (checked out or idle in a pool)
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn target(&self, name: &str, pool_size: usize) -> DatabaseTarget {
        DatabaseTarget::with_connector(
            name,
            database_config(self.kind, pool_size),
            Arc::new(self.clone()),
        )
    }
}

#[async_trait]
impl Connector for ScriptedDb {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn connect(&self) -> db_automation::Result<Box<dyn Session>> {
        if self.script.lock().unwrap().refuse {
            return Err(Error::ConnectFailed {
                target: "scripted".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            live: self.live.clone(),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedSession {
    async fn pause(&self) {
        let delay = self.script.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn ping(&mut self) -> db_automation::Result<()> {
        Ok(())
    }

    async fn scalar(&mut self, sql: &str) -> db_automation::Result<Option<f64>> {
        self.pause().await;
        Ok(self.script.lock().unwrap().values.get(sql).copied())
    }

    async fn records(&mut self, _sql: &str) -> db_automation::Result<Vec<Record>> {
        self.pause().await;
        Ok(Vec::new())
    }

    async fn execute(&mut self, _sql: &str) -> db_automation::Result<()> {
        self.pause().await;
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

pub fn database_config(kind: EngineKind, pool_size: usize) -> DatabaseConfig {
    DatabaseConfig {
        host: "localhost".to_string(),
        port: match kind {
            EngineKind::Postgres => 5432,
            EngineKind::SqlServer => 1433,
        },
        database: "app".to_string(),
        username: "monitor".to_string(),
        password: "secret".to_string(),
        db_type: kind,
        connection_pool_size: pool_size,
        ssl_mode: SslMode::Disable,
        connect_timeout: 1,
        enabled: true,
    }
}
