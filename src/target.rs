use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::{Config, DatabaseConfig};
use crate::engine::{Connector, EngineKind, connector_for};
use crate::pool::ConnectionPool;
use crate::probe::EngineProbe;

/// One configured database and the pool of connections to it
#[derive(Debug)]
pub struct DatabaseTarget {
    name: String,
    config: DatabaseConfig,
    pool: ConnectionPool,
}

impl DatabaseTarget {
    pub fn new(name: impl Into<String>, config: DatabaseConfig) -> Self {
        let name = name.into();
        let connector = connector_for(&name, &config);
        Self::with_connector(name, config, connector)
    }

    pub fn with_connector(
        name: impl Into<String>,
        config: DatabaseConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let name = name.into();
        let pool = ConnectionPool::new(name.clone(), connector, config.connection_pool_size);

        Self { name, config, pool }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EngineKind {
        self.config.db_type
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn probe(&self) -> EngineProbe {
        EngineProbe::for_kind(self.kind())
    }

    /// How long to wait for a free pooled connection
    pub fn acquire_timeout(&self) -> Duration {
        self.config.connect_timeout()
    }

    pub fn summary(&self) -> TargetSummary {
        TargetSummary {
            name: self.name.clone(),
            engine: self.kind(),
            host: self.config.host.clone(),
            port: self.config.port,
            database: self.config.database.clone(),
            pool_size: self.config.connection_pool_size,
            enabled: self.config.enabled,
        }
    }
}

/// Connection details safe to print or serialize (no credentials)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub pool_size: usize,
    pub enabled: bool,
}

/// Every configured target, keyed by name
///
/// Owns the pools for the lifetime of the process; [`close_all`] tears
/// them down.
///
/// [`close_all`]: TargetRegistry::close_all
#[derive(Debug, Default, Clone)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Arc<DatabaseTarget>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, db) in &config.databases {
            registry.insert(DatabaseTarget::new(name.clone(), db.clone()));
        }
        registry
    }

    pub fn insert(&mut self, target: DatabaseTarget) -> Arc<DatabaseTarget> {
        let target = Arc::new(target);
        self.targets
            .insert(target.name().to_string(), target.clone());
        target
    }

    pub fn get(&self, name: &str) -> Option<Arc<DatabaseTarget>> {
        self.targets.get(name).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<DatabaseTarget>> {
        self.targets.values()
    }

    pub fn enabled(&self) -> Vec<Arc<DatabaseTarget>> {
        self.targets
            .values()
            .filter(|t| t.is_enabled())
            .cloned()
            .collect()
    }

    /// Enabled targets, or just `name` when given (even if disabled)
    pub fn select(&self, name: Option<&str>) -> Vec<Arc<DatabaseTarget>> {
        match name {
            Some(name) => self.get(name).into_iter().collect(),
            None => self.enabled(),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn close_all(&self) {
        for target in self.targets.values() {
            target.pool().close_all().await;
        }
        info!("closed {} connection pools", self.targets.len());
    }
}
