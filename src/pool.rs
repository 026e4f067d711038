//! Bounded per-target connection pool
//!
//! Connections are opened lazily up to `max_size` and handed out wrapped in a
//! [`PooledConnection`], which puts the session back when dropped. A
//! semaphore with `max_size` permits is the only thing that bounds checkout,
//! so the bound holds no matter how many tasks call [`ConnectionPool::acquire`]
//! at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::engine::{Connector, Record, Session};
use crate::error::{Error, Result};

struct PoolInner {
    target: String,
    connector: Arc<dyn Connector>,
    max_size: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Session>>>,
    closed: AtomicBool,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn Session>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of a pool's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections opened over the pool's lifetime
    pub opened: u64,
    /// Connections thrown away after failing a liveness check or an operation
    pub discarded: u64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(target: impl Into<String>, connector: Arc<dyn Connector>, max_size: usize) -> Self {
        let max_size = max_size.max(1);

        Self {
            inner: Arc::new(PoolInner {
                target: target.into(),
                connector,
                max_size,
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(Vec::with_capacity(max_size)),
                closed: AtomicBool::new(false),
                opened: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Check out a connection, waiting at most `wait` for one to free up
    ///
    /// Idle connections are pinged first; one that fails is closed and the
    /// next idle one (or a fresh connection) is tried instead.
    pub async fn acquire(&self, wait: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;

        if self.is_closed() {
            return Err(Error::PoolClosed(inner.target.clone()));
        }

        let permit = match timeout(wait, inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed(inner.target.clone())),
            Err(_) => {
                debug!(db = %inner.target, ?wait, "pool exhausted");
                return Err(Error::PoolExhausted {
                    target: inner.target.clone(),
                    waited: wait,
                });
            }
        };

        loop {
            let candidate = inner.idle().pop();
            let Some(mut session) = candidate else {
                break;
            };

            match session.ping().await {
                Ok(()) => {
                    trace!(db = %inner.target, "reusing idle connection");
                    return Ok(PooledConnection::new(self.inner.clone(), session, permit));
                }
                Err(e) => {
                    warn!(db = %inner.target, "discarding dead connection: {e}");
                    inner.discarded.fetch_add(1, Ordering::Relaxed);
                    session.close().await;
                }
            }
        }

        let session = inner.connector.connect().await?;
        inner.opened.fetch_add(1, Ordering::Relaxed);
        debug!(db = %inner.target, "opened new connection");

        Ok(PooledConnection::new(self.inner.clone(), session, permit))
    }

    /// Return a connection early; equivalent to dropping it
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Close every idle connection and refuse further checkouts
    ///
    /// Connections still checked out are closed when their holders drop them.
    pub async fn close_all(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.permits.close();

        let drained: Vec<_> = inner.idle().drain(..).collect();
        debug!(db = %inner.target, count = drained.len(), "closing pool");
        for session in drained {
            session.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            max_size: inner.max_size,
            idle: inner.idle().len(),
            in_use: inner
                .max_size
                .saturating_sub(inner.permits.available_permits()),
            opened: inner.opened.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.target)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out connection
///
/// Dropping it returns the session to the pool. If an operation was
/// interrupted (its future dropped before completing) or failed, the session
/// is in an unknown protocol state and is discarded instead.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    session: Option<Box<dyn Session>>,
    in_flight: bool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, session: Box<dyn Session>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            session: Some(session),
            in_flight: false,
            broken: false,
            _permit: permit,
        }
    }

    pub fn target(&self) -> &str {
        &self.pool.target
    }

    fn session(&mut self) -> Result<&mut Box<dyn Session>> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(Error::PoolClosed(self.pool.target.clone())),
        }
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(Error::Io(_)) = &result {
            self.broken = true;
        }
        result
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.in_flight = true;
        let result = self.session()?.ping().await;
        if result.is_err() {
            self.broken = true;
        }
        self.finish(result)
    }

    pub async fn scalar(&mut self, sql: &str) -> Result<Option<f64>> {
        self.in_flight = true;
        let result = self.session()?.scalar(sql).await;
        self.finish(result)
    }

    pub async fn records(&mut self, sql: &str) -> Result<Vec<Record>> {
        self.in_flight = true;
        let result = self.session()?.records(sql).await;
        self.finish(result)
    }

    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.in_flight = true;
        let result = self.session()?.execute(sql).await;
        self.finish(result)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.target)
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let closed = self.pool.closed.load(Ordering::SeqCst);
        if self.in_flight || self.broken || closed {
            if !closed {
                debug!(db = %self.pool.target, "dropping connection in unknown state");
                self.pool.discarded.fetch_add(1, Ordering::Relaxed);
            }
            drop(session);
            return;
        }

        self.pool.idle().push(session);
    }
}
