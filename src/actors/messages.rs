//! Message types for talking to the scheduler
//!
//! Commands go to the scheduler over an mpsc channel, its lifecycle state is
//! published on a watch channel and every finished job is broadcast as a
//! [`SchedulerEvent`] to whoever subscribed.

use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::alerts::AlertEvent;
use crate::backup::{BackupResult, BackupRunSummary};
use crate::health::HealthResult;
use crate::optimize::OptimizationResult;

/// The three kinds of per-target work the scheduler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Health,
    Backup,
    Optimize,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Health => "health",
            JobKind::Backup => "backup",
            JobKind::Optimize => "optimize",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Waiting for the next tick or schedule
    Idle,

    /// Health checks of the current tick are still running
    RunningTick,

    /// Draining in-flight jobs; terminal
    ShuttingDown,
}

/// Commands that can be sent to the scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Start a health tick now instead of waiting for the interval
    TickNow,

    /// Back up every enabled target now
    BackupNow,

    /// Run maintenance on every enabled target now
    OptimizeNow,

    /// Stop scheduling, wait for in-flight work and close all pools
    ///
    /// The reply is sent once the pools are closed.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Published whenever a job finishes or an alert fires
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Health(HealthResult),
    Backup(BackupResult),
    BackupRejected { target: String },
    /// Every backup of one batch has finished
    BackupSummary(BackupRunSummary),
    Optimization(OptimizationResult),
    Alert(AlertEvent),
}
