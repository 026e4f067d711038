use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use db_automation::{
    actors::Scheduler,
    api::{ApiConfig, ApiState, spawn_api_server},
    backup::{BackupOptions, BackupRunner, enforce_retention},
    config::{Config, DEFAULT_CONFIG_PATH, read_config_file},
    health::HealthChecker,
    history::HealthHistory,
    metrics::MetricsRegistry,
    optimize::PerformanceOptimizer,
    report::{HealthReport, REPORT_DIR, status_summary, test_connection},
    target::{DatabaseTarget, TargetRegistry},
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Health checks, backups and maintenance for PostgreSQL and SQL Server")]
struct Args {
    /// Config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Only act on this database
    #[arg(long, short)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Open a connection to every database
    Test,

    /// Run one health check per database
    Health {
        /// Also write a JSON report per database into ./reports
        #[arg(long)]
        generate_report: bool,
    },

    /// Back up every database
    Backup {
        /// Apply the retention window afterwards
        #[arg(long)]
        cleanup: bool,
    },

    /// Run maintenance on every database
    Optimize,

    /// Show connectivity of every configured database
    Status,

    /// Run continuously and serve metrics
    Monitor {
        /// Overrides monitoring.metrics.port
        #[arg(long)]
        metrics_port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("db_automation", level),
        ("tower_http", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level.into());
    trace!("started with args: {args:?}");

    let started_at = Utc::now();
    let config = read_config_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let registry = TargetRegistry::from_config(&config);

    let targets = registry.select(args.database.as_deref());
    if let Some(name) = &args.database {
        if targets.is_empty() {
            bail!("database '{name}' is not configured");
        }
    }

    let succeeded = match args.command {
        Command::Monitor { metrics_port } => monitor(&config, registry.clone(), metrics_port).await?,
        Command::Test => test(&targets).await,
        Command::Health { generate_report } => health(&config, &targets, generate_report).await?,
        Command::Backup { cleanup } => backup(&config, &targets, cleanup).await?,
        Command::Optimize => optimize(&config, &targets).await?,
        Command::Status => {
            let status = status_summary(&registry, &args.config, started_at).await;
            print_json(&status)?;
            true
        }
    };

    registry.close_all().await;
    info!("database automation shutdown complete");

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn test(targets: &[Arc<DatabaseTarget>]) -> bool {
    info!("testing database connections");

    let results = join_all(targets.iter().map(|t| test_connection(t))).await;

    let mut succeeded = true;
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => println!("✓ {}: connection successful", target.name()),
            Err(e) => {
                println!("✗ {}: connection failed: {e}", target.name());
                succeeded = false;
            }
        }
    }
    succeeded
}

async fn health(
    config: &Config,
    targets: &[Arc<DatabaseTarget>],
    generate_report: bool,
) -> anyhow::Result<bool> {
    info!("starting health checks");

    let checker = HealthChecker::new(config.monitoring.alert_thresholds.clone());
    let results = checker.check_all(targets).await;
    print_json(&results)?;

    if generate_report {
        let optimizer = PerformanceOptimizer::new(config.performance.clone());
        for (target, result) in targets.iter().zip(&results) {
            let optimization = optimizer.optimize(target).await;
            let report =
                HealthReport::build(target, result.clone(), optimization, &config.backup.backup_path)
                    .await;
            let path = report
                .write_to(Path::new(REPORT_DIR))
                .await
                .with_context(|| format!("failed to write report for {}", target.name()))?;
            let summary = report
                .write_summary(Path::new(REPORT_DIR))
                .await
                .with_context(|| format!("failed to write summary for {}", target.name()))?;
            println!("Detailed report generated for {}: {}", target.name(), path.display());
            println!("Summary written for {}: {}", target.name(), summary.display());
        }
    }

    Ok(results.iter().all(|r| !r.is_down()))
}

async fn backup(
    config: &Config,
    targets: &[Arc<DatabaseTarget>],
    cleanup: bool,
) -> anyhow::Result<bool> {
    info!("starting backup operations");

    let runner = BackupRunner::new(config.backup.parallel_jobs);
    let options = BackupOptions::from(&config.backup);

    let results = join_all(targets.iter().map(|t| runner.run_backup(t, &options))).await;

    let mut succeeded = true;
    let mut finished = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(result) => {
                succeeded &= result.is_success();
                finished.push(result);
            }
            Err(e) => {
                error!("{e}");
                succeeded = false;
            }
        }
    }
    print_json(&finished)?;

    if cleanup {
        info!("cleaning up old backups");
        let now = Utc::now();
        let mut deleted = 0;
        let mut freed_bytes = 0;
        for target in targets {
            let report = enforce_retention(
                &options.directory,
                target.name(),
                options.retention,
                now,
                None,
            )
            .await;
            for e in &report.errors {
                warn!(db = %target.name(), "{e}");
            }
            deleted += report.deleted.len();
            freed_bytes += report.freed_bytes;
        }
        println!("Backup cleanup: {deleted} files deleted, {freed_bytes} bytes freed");
    }

    Ok(succeeded)
}

async fn optimize(config: &Config, targets: &[Arc<DatabaseTarget>]) -> anyhow::Result<bool> {
    info!("starting optimization");

    let optimizer = PerformanceOptimizer::new(config.performance.clone());
    let results = join_all(targets.iter().map(|t| optimizer.optimize(t))).await;
    print_json(&results)?;

    Ok(results.iter().all(|r| r.is_success()))
}

async fn monitor(
    config: &Config,
    registry: TargetRegistry,
    metrics_port: Option<u16>,
) -> anyhow::Result<bool> {
    info!("starting continuous monitoring");

    let metrics = MetricsRegistry::new(prometheus::Registry::new())?;
    let history = HealthHistory::new(config.monitoring.history_size);

    let mut api_config = ApiConfig::from_settings(&config.monitoring.metrics)?;
    if let Some(port) = metrics_port {
        api_config.bind_addr.set_port(port);
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let state = ApiState::new(metrics.clone(), history.clone(), registry.clone());
    spawn_api_server(api_config, state, async move {
        let _ = stop_rx.await;
    })
    .await?;

    let scheduler = Scheduler::from_config(config, registry, metrics, history)?.spawn();

    shutdown_signal().await;
    info!("shutdown requested, draining in-flight checks");

    scheduler.shutdown().await?;
    let _ = stop_tx.send(());

    Ok(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
