//! Scheduler isolation and deadline behaviour against scripted targets

use std::collections::HashMap;
use std::time::Duration;

use db_automation::actors::{
    Scheduler, SchedulerEvent, SchedulerSettings, SchedulerState,
};
use db_automation::backup::BackupOptions;
use db_automation::engine::EngineKind;
use db_automation::health::{HealthResult, HealthStatus};
use db_automation::history::HealthHistory;
use db_automation::metrics::MetricsRegistry;
use db_automation::target::TargetRegistry;
use pretty_assertions::assert_eq;
use prometheus::Registry;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::helpers::ScriptedDb;

fn settings(check_interval: Duration) -> SchedulerSettings {
    SchedulerSettings {
        check_interval,
        tick_timeout: check_interval,
        shutdown_grace: Duration::from_secs(2),
        backup_schedule: None,
        optimize_schedule: None,
        backup: BackupOptions {
            directory: std::env::temp_dir(),
            compression: true,
            retention: chrono::Duration::days(7),
            timeout: Duration::from_secs(60),
        },
    }
}

async fn next_health(events: &mut broadcast::Receiver<SchedulerEvent>) -> HealthResult {
    loop {
        if let Ok(SchedulerEvent::Health(result)) = events.recv().await {
            return result;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_target_times_out_without_affecting_the_other() {
    let quick = ScriptedDb::new(EngineKind::Postgres).with_metric("connection_count", 7.0);
    let sluggish = ScriptedDb::new(EngineKind::SqlServer)
        .with_metric("connection_count", 3.0)
        .with_delay(Duration::from_secs(5));

    let mut registry = TargetRegistry::new();
    let quick_target = registry.insert(quick.target("quick", 2));
    let sluggish_target = registry.insert(sluggish.target("sluggish", 2));

    let metrics = MetricsRegistry::new(Registry::new()).unwrap();
    let history = HealthHistory::default();
    let scheduler = Scheduler::new(
        registry,
        settings(Duration::from_secs(1)),
        metrics.clone(),
        history.clone(),
    );
    let handle = scheduler.spawn();

    let mut first: HashMap<String, HealthResult> = HashMap::new();
    timeout(Duration::from_secs(4), async {
        while first.len() < 2 {
            for result in history.latest_all().await {
                first.entry(result.target.clone()).or_insert(result);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("both targets reported");

    let quick_result = &first["quick"];
    assert_eq!(quick_result.status, HealthStatus::Healthy);
    assert_eq!(quick_result.connection_count, Some(7));

    let sluggish_result = &first["sluggish"];
    assert_eq!(sluggish_result.status, HealthStatus::Down);
    assert!(
        sluggish_result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out"))
    );
    assert!(sluggish_result.duration < Duration::from_secs(3));

    let snapshot = metrics.snapshot().unwrap();
    assert!(snapshot.contains(r#"db_health_status{database="quick"} 1"#));
    assert!(snapshot.contains(r#"db_health_status{database="sluggish"} 0"#));

    handle.shutdown().await.unwrap();
    assert_eq!(handle.state(), SchedulerState::ShuttingDown);

    assert_eq!(quick_target.pool().stats().in_use, 0);
    assert_eq!(sluggish_target.pool().stats().in_use, 0);
    assert_eq!(quick.live_sessions(), 0);
    assert_eq!(sluggish.live_sessions(), 0);
}

#[tokio::test]
async fn unreachable_target_is_retried_on_the_next_tick_only() {
    let down = ScriptedDb::new(EngineKind::Postgres).refusing();

    let mut registry = TargetRegistry::new();
    registry.insert(down.target("down", 1));

    let history = HealthHistory::default();
    let handle = Scheduler::new(
        registry,
        settings(Duration::from_secs(3600)),
        MetricsRegistry::new(Registry::new()).unwrap(),
        history.clone(),
    )
    .spawn();
    let mut events = handle.subscribe();

    let result = timeout(Duration::from_secs(2), next_health(&mut events))
        .await
        .unwrap();
    assert_eq!(result.status, HealthStatus::Down);
    assert!(result.error.as_deref().unwrap().contains("connection refused"));

    handle.tick_now().await.unwrap();
    timeout(Duration::from_secs(2), next_health(&mut events))
        .await
        .unwrap();

    assert_eq!(history.len("down").await, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_checks_within_grace() {
    let db = ScriptedDb::new(EngineKind::Postgres)
        .with_metric("connection_count", 1.0)
        .with_delay(Duration::from_millis(20));

    let mut registry = TargetRegistry::new();
    let target = registry.insert(db.target("orders", 1));

    let history = HealthHistory::default();
    let mut settings = settings(Duration::from_secs(3600));
    settings.tick_timeout = Duration::from_secs(10);

    let handle = Scheduler::new(
        registry,
        settings,
        MetricsRegistry::new(Registry::new()).unwrap(),
        history.clone(),
    )
    .spawn();

    // let the first tick start its check
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(handle.state(), SchedulerState::RunningTick);

    handle.shutdown().await.unwrap();

    let latest = history.latest("orders").await.expect("in-flight check finished");
    assert_eq!(latest.status, HealthStatus::Healthy);
    assert!(target.pool().is_closed());
    assert_eq!(db.live_sessions(), 0);
}
