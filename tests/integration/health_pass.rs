//! One health pass over several targets, from the library and from the CLI

use std::process::Command;
use std::time::Duration;

use db_automation::alerts::{AlertEvaluator, AlertMetric, AlertThresholds, Severity, ThresholdRule};
use db_automation::engine::EngineKind;
use db_automation::health::{HealthChecker, HealthStatus};
use db_automation::target::{DatabaseTarget, TargetRegistry};
use pretty_assertions::assert_eq;

use crate::helpers::{ScriptedDb, database_config};

#[tokio::test]
async fn reachable_target_is_healthy_and_invalid_host_is_down() {
    let reachable = ScriptedDb::new(EngineKind::Postgres)
        .with_metric("connection_count", 12.0)
        .with_metric("active_queries", 2.0);

    let mut unreachable_config = database_config(EngineKind::Postgres, 2);
    unreachable_config.host = "db.invalid".to_string();
    unreachable_config.port = 1;

    let mut registry = TargetRegistry::new();
    registry.insert(reachable.target("orders", 2));
    registry.insert(DatabaseTarget::new("legacy", unreachable_config));

    let checker = HealthChecker::default();
    let results = checker.check_all(&registry.enabled()).await;

    let legacy = &results[0];
    assert_eq!(legacy.target, "legacy");
    assert_eq!(legacy.status, HealthStatus::Down);
    assert!(legacy.error.as_deref().is_some_and(|e| !e.is_empty()));

    let orders = &results[1];
    assert_eq!(orders.target, "orders");
    assert_eq!(orders.status, HealthStatus::Healthy);
    assert_eq!(orders.connection_count, Some(12));
    assert_eq!(orders.active_queries, Some(2));
    assert!(orders.error.is_none());

    let pass_succeeded = results.iter().all(|r| !r.is_down());
    assert!(!pass_succeeded);

    registry.close_all().await;
    assert_eq!(reachable.live_sessions(), 0);
}

#[tokio::test]
async fn threshold_breach_alerts_once_within_cooldown() {
    let thresholds = AlertThresholds {
        connection_count: Some(ThresholdRule::critical(80.0)),
        ..Default::default()
    };

    let db = ScriptedDb::new(EngineKind::SqlServer).with_metric("connection_count", 95.0);
    let target = db.target("reporting", 1);
    let checker = HealthChecker::new(thresholds.clone());
    let mut evaluator = AlertEvaluator::new(Duration::from_secs(300));

    let first = checker.check(&target).await;
    assert_eq!(first.status, HealthStatus::Degraded);

    let events = evaluator.evaluate(&first, &thresholds);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metric, AlertMetric::ConnectionCount);
    assert_eq!(events[0].severity, Severity::Critical);
    assert_eq!(events[0].value, 95.0);
    assert_eq!(events[0].threshold, 80.0);

    let second = checker.check(&target).await;
    assert!(evaluator.evaluate(&second, &thresholds).is_empty());
}

#[test]
fn cli_health_exits_nonzero_when_a_target_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("db_config.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
databases:
  legacy:
    host: db.invalid
    port: 1
    database: app
    username: monitor
    db_type: postgresql
    connect_timeout: 1
monitoring:
  check_interval: 60
backup:
  backup_path: {}
"#,
            dir.path().display()
        ),
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_db-automation"))
        .arg("--config")
        .arg(&config_path)
        .arg("health")
        .output()
        .unwrap();

    assert!(!output.status.success());

    let results: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results[0]["target"], "legacy");
    assert_eq!(results[0]["status"], "down");
    assert!(results[0]["error"].is_string());
}

#[test]
fn cli_rejects_unknown_database() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("db_config.yaml");
    std::fs::write(
        &config_path,
        r#"
databases:
  orders:
    host: localhost
    port: 5432
    database: app
    username: monitor
    db_type: postgresql
monitoring: {}
backup: {}
"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_db-automation"))
        .args(["--config"])
        .arg(&config_path)
        .args(["--database", "missing", "test"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}
