//! Backups driven through the scheduler: artifacts, retention and overlap

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use db_automation::actors::{Scheduler, SchedulerEvent, SchedulerSettings};
use db_automation::backup::{BackupOptions, BackupOutcome, BackupResult, BackupRunner, BackupTool};
use db_automation::engine::EngineKind;
use db_automation::history::HealthHistory;
use db_automation::metrics::MetricsRegistry;
use db_automation::target::{DatabaseTarget, TargetRegistry};
use db_automation::util::file_timestamp;
use db_automation::{Error, Result};
use pretty_assertions::assert_eq;
use prometheus::Registry;
use tokio::sync::{Notify, broadcast};
use tokio::time::timeout;

use crate::helpers::ScriptedDb;

/// Writes a fixed payload, optionally waiting for a go-ahead first
struct FileTool {
    gate: Option<Arc<Notify>>,
    fail: bool,
}

#[async_trait]
impl BackupTool for FileTool {
    async fn dump(
        &self,
        _target: &DatabaseTarget,
        destination: &Path,
        _options: &BackupOptions,
    ) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(Error::BackupFailed("pg_dump: server closed the connection".into()));
        }
        tokio::fs::write(destination, b"-- dump\n").await?;
        Ok(())
    }
}

fn settings(directory: &Path, retention_days: i64) -> SchedulerSettings {
    SchedulerSettings {
        check_interval: Duration::from_secs(3600),
        tick_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        backup_schedule: None,
        optimize_schedule: None,
        backup: BackupOptions {
            directory: directory.to_path_buf(),
            compression: false,
            retention: chrono::Duration::days(retention_days),
            timeout: Duration::from_secs(30),
        },
    }
}

fn old_artifact(directory: &Path, target: &str, days_ago: i64) -> std::path::PathBuf {
    let at = Utc::now() - chrono::Duration::days(days_ago);
    let path = directory.join(format!("{target}_{}.sql", file_timestamp(at)));
    std::fs::write(&path, vec![0u8; 64]).unwrap();
    path
}

async fn next_backup(events: &mut broadcast::Receiver<SchedulerEvent>) -> BackupResult {
    loop {
        if let Ok(SchedulerEvent::Backup(result)) = events.recv().await {
            return result;
        }
    }
}

#[tokio::test]
async fn scheduled_backup_prunes_artifacts_outside_retention() {
    let dir = tempfile::tempdir().unwrap();
    let day_30 = old_artifact(dir.path(), "orders", 30);
    let day_15 = old_artifact(dir.path(), "orders", 15);
    let day_1 = old_artifact(dir.path(), "orders", 1);
    // another target's artifact and an unrelated file are never touched
    let other = old_artifact(dir.path(), "billing", 60);
    let notes = dir.path().join("orders_notes.txt");
    std::fs::write(&notes, "keep").unwrap();

    let db = ScriptedDb::new(EngineKind::Postgres);
    let mut registry = TargetRegistry::new();
    registry.insert(db.target("orders", 1));

    let metrics = MetricsRegistry::new(Registry::new()).unwrap();
    let handle = Scheduler::new(
        registry,
        settings(dir.path(), 20),
        metrics.clone(),
        HealthHistory::default(),
    )
    .with_backup_runner(BackupRunner::with_tool(
        Arc::new(FileTool {
            gate: None,
            fail: false,
        }),
        2,
    ))
    .spawn();
    let mut events = handle.subscribe();

    handle.backup_now().await.unwrap();
    let result = timeout(Duration::from_secs(5), next_backup(&mut events))
        .await
        .unwrap();

    assert_eq!(result.outcome, BackupOutcome::Success);
    assert_eq!(result.size_bytes, 8);
    assert!(result.destination.exists());

    let retention = result.retention.expect("retention ran after success");
    assert_eq!(retention.deleted, vec![day_30.clone()]);
    assert_eq!(retention.freed_bytes, 64);
    assert!(retention.errors.is_empty());

    assert!(!day_30.exists());
    assert!(day_15.exists());
    assert!(day_1.exists());
    assert!(other.exists());
    assert!(notes.exists());

    let snapshot = metrics.snapshot().unwrap();
    assert!(snapshot.contains(r#"db_backups_total{database="orders",status="success"} 1"#));
    assert!(snapshot.contains(r#"db_backup_size_bytes{database="orders"} 8"#));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_backup_keeps_old_artifacts_and_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let day_30 = old_artifact(dir.path(), "orders", 30);

    let db = ScriptedDb::new(EngineKind::Postgres);
    let mut registry = TargetRegistry::new();
    registry.insert(db.target("orders", 1));

    let metrics = MetricsRegistry::new(Registry::new()).unwrap();
    let handle = Scheduler::new(
        registry,
        settings(dir.path(), 7),
        metrics.clone(),
        HealthHistory::default(),
    )
    .with_backup_runner(BackupRunner::with_tool(
        Arc::new(FileTool {
            gate: None,
            fail: true,
        }),
        1,
    ))
    .spawn();
    let mut events = handle.subscribe();

    handle.backup_now().await.unwrap();

    let mut result = None;
    let mut alerted = false;
    timeout(Duration::from_secs(5), async {
        while result.is_none() || !alerted {
            match events.recv().await {
                Ok(SchedulerEvent::Backup(r)) => result = Some(r),
                Ok(SchedulerEvent::Alert(alert)) => {
                    assert_eq!(alert.target, "orders");
                    alerted = true;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    let result = result.unwrap();
    assert_eq!(result.outcome, BackupOutcome::Failed);
    assert!(result.error.as_deref().unwrap().contains("server closed"));
    assert!(result.retention.is_none());
    assert!(day_30.exists());

    let snapshot = metrics.snapshot().unwrap();
    assert!(snapshot.contains(r#"db_backups_total{database="orders",status="failed"} 1"#));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn overlapping_backup_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());

    let db = ScriptedDb::new(EngineKind::SqlServer);
    let mut registry = TargetRegistry::new();
    registry.insert(db.target("reporting", 1));

    let metrics = MetricsRegistry::new(Registry::new()).unwrap();
    let handle = Scheduler::new(
        registry,
        settings(dir.path(), 7),
        metrics.clone(),
        HealthHistory::default(),
    )
    .with_backup_runner(BackupRunner::with_tool(
        Arc::new(FileTool {
            gate: Some(gate.clone()),
            fail: false,
        }),
        4,
    ))
    .spawn();
    let mut events = handle.subscribe();

    handle.backup_now().await.unwrap();
    handle.backup_now().await.unwrap();

    let rejected = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SchedulerEvent::BackupRejected { target }) = events.recv().await {
                return target;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(rejected, "reporting");

    gate.notify_one();
    let result = timeout(Duration::from_secs(5), next_backup(&mut events))
        .await
        .unwrap();
    assert_eq!(result.outcome, BackupOutcome::Success);

    let snapshot = metrics.snapshot().unwrap();
    assert!(snapshot.contains(r#"db_backups_total{database="reporting",status="rejected"} 1"#));
    assert!(snapshot.contains(r#"db_backups_total{database="reporting",status="success"} 1"#));

    handle.shutdown().await.unwrap();
}
