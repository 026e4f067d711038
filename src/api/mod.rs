//! HTTP surface of the daemon
//!
//! ## Endpoints
//!
//! - `GET {metrics path}` - metrics in the text exposition format (default `/metrics`)
//! - `GET /health` - liveness
//! - `GET /api/v1/targets` - configured targets with their latest health result
//! - `GET /api/v1/targets/:name` - one target, including its recent history

pub mod error;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{HealthResponse, TargetDetail, TargetView, TargetsResponse};

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::MetricsServerConfig;

/// Exposition server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:8000")
    pub bind_addr: SocketAddr,

    /// Path the metrics are served on
    pub metrics_path: String,
}

impl ApiConfig {
    pub fn from_settings(settings: &MetricsServerConfig) -> anyhow::Result<Self> {
        let ip: IpAddr = settings
            .address
            .parse()
            .with_context(|| format!("invalid metrics address '{}'", settings.address))?;

        let metrics_path = if settings.path.starts_with('/') {
            settings.path.clone()
        } else {
            format!("/{}", settings.path)
        };

        Ok(Self {
            bind_addr: SocketAddr::new(ip, settings.port),
            metrics_path,
        })
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    Router::new()
        .route(&config.metrics_path, get(routes::metrics::export))
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/targets", get(routes::targets::list_targets))
        .route("/api/v1/targets/:name", get(routes::targets::get_target))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the exposition server
///
/// Starts an Axum HTTP server in a background task that stops once
/// `shutdown` resolves. Returns the server's local address.
pub async fn spawn_api_server<F>(
    config: ApiConfig,
    state: ApiState,
    shutdown: F,
) -> anyhow::Result<SocketAddr>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("starting metrics server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let addr = listener.local_addr()?;

    info!(
        "metrics server listening on http://{}{}",
        addr, config.metrics_path
    );

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("metrics server error: {}", e);
        }
    });

    Ok(addr)
}
