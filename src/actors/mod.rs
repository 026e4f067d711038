//! Long-running tasks
//!
//! The scheduler runs as an independent tokio task and is driven through a
//! [`SchedulerHandle`]:
//!
//! ```text
//!   interval tick ──┐
//!   backup cron ────┼──► Scheduler ──spawn──► per-target jobs (JoinSet)
//!   optimize cron ──┤        ▲                      │
//!   commands (mpsc) ┘        └──── results ─────────┘
//!                            │
//!                            ├──► MetricsRegistry, HealthHistory
//!                            ├──► AlertEvaluator ──► NotifierSet
//!                            └──► SchedulerEvent (broadcast)
//! ```

pub mod messages;
pub mod scheduler;

pub use messages::{JobKind, SchedulerCommand, SchedulerEvent, SchedulerState};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
