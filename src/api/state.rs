//! Shared state handed to every handler

use chrono::{DateTime, Utc};

use crate::history::HealthHistory;
use crate::metrics::MetricsRegistry;
use crate::target::TargetRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub metrics: MetricsRegistry,

    /// Latest results, written by the scheduler
    pub history: HealthHistory,

    pub targets: TargetRegistry,

    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(metrics: MetricsRegistry, history: HealthHistory, targets: TargetRegistry) -> Self {
        Self {
            metrics,
            history,
            targets,
            started_at: Utc::now(),
        }
    }
}
