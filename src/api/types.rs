//! API response types

use serde::Serialize;

use crate::health::HealthResult;
use crate::pool::PoolStats;
use crate::target::TargetSummary;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: &'static str,
    pub uptime_seconds: i64,
}

/// One configured target as seen by the API
#[derive(Debug, Clone, Serialize)]
pub struct TargetView {
    #[serde(flatten)]
    pub summary: TargetSummary,
    pub pool: PoolStats,
    /// `None` until the first check of this target finished
    pub latest: Option<HealthResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetsResponse {
    pub targets: Vec<TargetView>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetDetail {
    #[serde(flatten)]
    pub target: TargetView,
    /// Newest first
    pub history: Vec<HealthResult>,
}
