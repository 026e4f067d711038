//! Database transports
//!
//! Everything above this module talks to a database through [`Connector`]
//! and [`Session`]. The two production engines live in [`postgres`] and
//! [`sqlserver`]; tests plug in scripted implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::error::Result;

pub mod postgres;
pub mod sqlserver;

#[cfg(test)]
pub(crate) mod fake;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "postgresql", alias = "postgres")]
    Postgres,
    #[serde(rename = "sqlserver", alias = "mssql")]
    SqlServer,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgresql",
            EngineKind::SqlServer => "sqlserver",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One result row of an introspection query
///
/// Queries are written so that the first column is a text label and every
/// following column is numeric. SQL `NULL` in a numeric column becomes NaN,
/// which compares false against every threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub label: String,
    pub values: Vec<f64>,
}

impl Record {
    pub fn new(label: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            label: label.into(),
            values,
        }
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values.get(index).copied().unwrap_or(f64::NAN)
    }
}

/// A single live connection
#[async_trait]
pub trait Session: Send {
    /// Cheap liveness check
    async fn ping(&mut self) -> Result<()>;

    /// First column of the first row, `None` for no rows or `NULL`
    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>>;

    async fn records(&mut self, sql: &str) -> Result<Vec<Record>>;

    /// Run a statement and discard whatever it returns
    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn close(self: Box<Self>);
}

/// Opens new sessions to one database
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn connect(&self) -> Result<Box<dyn Session>>;
}

/// Connector for a configured target, chosen by its engine kind
pub fn connector_for(name: &str, config: &DatabaseConfig) -> Arc<dyn Connector> {
    match config.db_type {
        EngineKind::Postgres => Arc::new(postgres::PostgresConnector::new(name, config)),
        EngineKind::SqlServer => Arc::new(sqlserver::SqlServerConnector::new(name, config)),
    }
}
