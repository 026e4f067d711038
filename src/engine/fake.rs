//! Scripted in-memory engine for unit tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Connector, EngineKind, Record, Session, postgres, sqlserver};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    scalars: HashMap<String, std::result::Result<f64, String>>,
    records: HashMap<String, Vec<Record>>,
    failing_statements: HashSet<String>,
    executed: Vec<String>,
    refuse: bool,
    ping_fails: bool,
    delay: Duration,
    connects: usize,
}

#[derive(Clone)]
pub struct FakeDb {
    kind: EngineKind,
    state: Arc<Mutex<State>>,
}

impl FakeDb {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Arc::default(),
        }
    }

    fn sql_for(&self, metric: &str) -> &'static str {
        let queries = match self.kind {
            EngineKind::Postgres => postgres::HEALTH_QUERIES,
            EngineKind::SqlServer => sqlserver::HEALTH_QUERIES,
        };
        queries
            .iter()
            .find(|(name, _)| *name == metric)
            .map(|(_, sql)| *sql)
            .unwrap_or_else(|| panic!("no health query named {metric}"))
    }

    pub fn metric(&self, name: &str, value: f64) -> &Self {
        let sql = self.sql_for(name);
        self.state
            .lock()
            .unwrap()
            .scalars
            .insert(sql.to_string(), Ok(value));
        self
    }

    pub fn fail_metric(&self, name: &str, error: &str) -> &Self {
        let sql = self.sql_for(name);
        self.state
            .lock()
            .unwrap()
            .scalars
            .insert(sql.to_string(), Err(error.to_string()));
        self
    }

    pub fn records(&self, sql: &str, rows: Vec<Record>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(sql.to_string(), rows);
        self
    }

    /// Statements containing `needle` fail when executed
    pub fn fail_statement(&self, needle: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .failing_statements
            .insert(needle.to_string());
        self
    }

    pub fn refuse_connections(&self) -> &Self {
        self.state.lock().unwrap().refuse = true;
        self
    }

    pub fn fail_ping(&self) -> &Self {
        self.state.lock().unwrap().ping_fails = true;
        self
    }

    pub fn delay(&self, delay: Duration) -> &Self {
        self.state.lock().unwrap().delay = delay;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Connector for FakeDb {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn connect(&self) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(Error::ConnectFailed {
                target: "fake".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.connects += 1;
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<State>>,
}

impl FakeSession {
    async fn pause(&self) {
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn ping(&mut self) -> Result<()> {
        if self.state.lock().unwrap().ping_fails {
            return Err(Error::QueryFailed("server closed the connection".to_string()));
        }
        Ok(())
    }

    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>> {
        self.pause().await;
        match self.state.lock().unwrap().scalars.get(sql) {
            Some(Ok(value)) => Ok(Some(*value)),
            Some(Err(e)) => Err(Error::QueryFailed(e.clone())),
            None => Ok(None),
        }
    }

    async fn records(&mut self, sql: &str) -> Result<Vec<Record>> {
        self.pause().await;
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.executed.push(sql.to_string());
        if state.failing_statements.iter().any(|n| sql.contains(n)) {
            return Err(Error::QueryFailed(format!("statement rejected: {sql}")));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

/// Target settings pointing nowhere in particular; the fake connector ignores them
pub fn db_config(kind: EngineKind, pool_size: usize) -> crate::config::DatabaseConfig {
    crate::config::DatabaseConfig {
        host: "localhost".to_string(),
        port: 5432,
        database: "app".to_string(),
        username: "monitor".to_string(),
        password: "secret".to_string(),
        db_type: kind,
        connection_pool_size: pool_size,
        ssl_mode: crate::config::SslMode::Disable,
        connect_timeout: 1,
        enabled: true,
    }
}

pub fn target(name: &str, db: &FakeDb, pool_size: usize) -> crate::target::DatabaseTarget {
    crate::target::DatabaseTarget::with_connector(name, db_config(db.kind, pool_size), db.connector())
}
