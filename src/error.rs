//! Error types for database automation operations

use std::fmt;
use std::time::Duration;

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a target or running an operation
///
/// Everything except `ConfigInvalid` is scoped to a single target (and
/// usually a single metric or action) and is captured into the matching
/// result object instead of aborting the surrounding pass.
#[derive(Debug)]
pub enum Error {
    /// A new connection could not be established
    ConnectFailed { target: String, reason: String },

    /// No connection became free within the acquire timeout
    PoolExhausted { target: String, waited: Duration },

    /// The pool was closed before or while acquiring
    PoolClosed(String),

    /// A single introspection or maintenance query failed
    QueryFailed(String),

    /// The external backup mechanism reported a failure
    BackupFailed(String),

    /// A backup for this target is already running
    BackupInFlight(String),

    /// One maintenance action failed
    OptimizationActionFailed { action: String, reason: String },

    /// The configuration file is unusable (fatal at startup)
    ConfigInvalid(String),

    /// A notification sink rejected the alert
    Notification(String),

    /// The metrics registry refused a collector or failed to encode
    Metrics(String),

    /// I/O error (backup artifacts, config file, ...)
    Io(std::io::Error),
}

impl Error {
    /// Short machine-friendly name, logged alongside probe failures
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConnectFailed { .. } => "connect_failed",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::PoolClosed(_) => "pool_closed",
            Error::QueryFailed(_) => "query_failed",
            Error::BackupFailed(_) => "backup_failed",
            Error::BackupInFlight(_) => "backup_in_flight",
            Error::OptimizationActionFailed { .. } => "optimization_action_failed",
            Error::ConfigInvalid(_) => "config_invalid",
            Error::Notification(_) => "notification",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectFailed { target, reason } => {
                write!(f, "failed to connect to {}: {}", target, reason)
            }
            Error::PoolExhausted { target, waited } => write!(
                f,
                "connection pool for {} exhausted after waiting {:.1}s",
                target,
                waited.as_secs_f64()
            ),
            Error::PoolClosed(target) => write!(f, "connection pool for {} is closed", target),
            Error::QueryFailed(msg) => write!(f, "query failed: {}", msg),
            Error::BackupFailed(msg) => write!(f, "backup failed: {}", msg),
            Error::BackupInFlight(target) => {
                write!(f, "a backup for {} is already in progress", target)
            }
            Error::OptimizationActionFailed { action, reason } => {
                write!(f, "maintenance action '{}' failed: {}", action, reason)
            }
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Notification(msg) => write!(f, "notification failed: {}", msg),
            Error::Metrics(msg) => write!(f, "metrics error: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => Error::Io(io_err),
            sqlx::Error::RowNotFound => Error::QueryFailed("no rows returned".to_string()),
            _ => Error::QueryFailed(err.to_string()),
        }
    }
}

impl From<tiberius::error::Error> for Error {
    fn from(err: tiberius::error::Error) -> Self {
        Error::QueryFailed(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}
