//! Backups through the engines' own dump utilities, plus retention cleanup

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{AlertEvent, AlertMetric, Severity};
use crate::config::BackupConfig;
use crate::engine::EngineKind;
use crate::error::{Error, Result};
use crate::target::DatabaseTarget;
use crate::util::{as_secs_f64, file_timestamp, parse_file_timestamp};

/// Extensions recognised as backup artifacts, longest first
const ARTIFACT_EXTENSIONS: &[&str] = &[".sql.gz", ".sql", ".bak", ".dump"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOutcome {
    Success,
    Failed,
}

impl BackupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOutcome::Success => "success",
            BackupOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: BackupOutcome,
    #[serde(rename = "duration_seconds", serialize_with = "as_secs_f64")]
    pub duration: Duration,
    pub size_bytes: u64,
    pub destination: PathBuf,
    pub error: Option<String>,
    /// Cleanup performed after a successful backup
    pub retention: Option<RetentionReport>,
}

impl BackupResult {
    pub fn is_success(&self) -> bool {
        self.outcome == BackupOutcome::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// Totals of one batch of backups started together
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupRunSummary {
    pub targets: Vec<String>,
    pub succeeded: usize,
    pub failed: Vec<String>,
    /// Turned away because a backup of that target was still running
    pub rejected: Vec<String>,
    pub files_deleted: usize,
    pub freed_bytes: u64,
}

impl BackupRunSummary {
    pub fn record(&mut self, result: &BackupResult) {
        self.targets.push(result.target.clone());
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed.push(result.target.clone());
        }
        if let Some(retention) = &result.retention {
            self.files_deleted += retention.deleted.len();
            self.freed_bytes += retention.freed_bytes;
        }
    }

    /// A backup whose task died before producing a result
    pub fn record_lost(&mut self, target: &str) {
        self.targets.push(target.to_string());
        self.failed.push(target.to_string());
    }

    pub fn record_rejected(&mut self, target: &str) {
        self.rejected.push(target.to_string());
    }

    /// Backups that actually ran, successful or not
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    /// Info when every backup succeeded, warning otherwise
    pub fn alert(&self, timestamp: DateTime<Utc>) -> AlertEvent {
        let severity = if self.failed.is_empty() {
            Severity::Info
        } else {
            Severity::Warning
        };

        let mut message = format!(
            "Backups: {}/{} successful",
            self.succeeded,
            self.total()
        );
        if !self.failed.is_empty() {
            message.push_str(&format!("\nFailed: {}", self.failed.join(", ")));
        }
        if !self.rejected.is_empty() {
            message.push_str(&format!(
                "\nSkipped (already running): {}",
                self.rejected.join(", ")
            ));
        }
        message.push_str(&format!(
            "\nFiles cleaned: {}\nSpace freed: {:.2} MB",
            self.files_deleted,
            self.freed_bytes as f64 / (1024.0 * 1024.0)
        ));

        AlertEvent {
            target: self.targets.join(", "),
            severity,
            metric: AlertMetric::BackupSummary,
            value: self.succeeded as f64,
            threshold: self.total() as f64,
            timestamp,
            message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub directory: PathBuf,
    pub compression: bool,
    pub retention: chrono::Duration,
    pub timeout: Duration,
}

impl From<&BackupConfig> for BackupOptions {
    fn from(config: &BackupConfig) -> Self {
        Self {
            directory: config.backup_path.clone(),
            compression: config.compression,
            retention: config.retention(),
            timeout: config.timeout(),
        }
    }
}

/// File name of a new artifact for `target` taken at `at`
pub fn artifact_name(target: &str, kind: EngineKind, compression: bool, at: DateTime<Utc>) -> String {
    let extension = match (kind, compression) {
        (EngineKind::Postgres, true) => "sql.gz",
        (EngineKind::Postgres, false) => "sql",
        (EngineKind::SqlServer, _) => "bak",
    };
    format!("{target}_{}.{extension}", file_timestamp(at))
}

/// Something that writes a backup of a target to a file
#[async_trait]
pub trait BackupTool: Send + Sync {
    async fn dump(
        &self,
        target: &DatabaseTarget,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<()>;
}

/// Program, arguments and environment for one dump run
#[derive(Debug, Clone, PartialEq)]
pub struct DumpInvocation {
    pub program: &'static str,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, String)>,
}

impl DumpInvocation {
    pub fn for_target(target: &DatabaseTarget, destination: &Path, compression: bool) -> Self {
        let db = target.config();
        match target.kind() {
            EngineKind::Postgres => {
                let mut args = vec![
                    "-h".to_string(),
                    db.host.clone(),
                    "-p".to_string(),
                    db.port.to_string(),
                    "-U".to_string(),
                    db.username.clone(),
                    "-d".to_string(),
                    db.database.clone(),
                    "-f".to_string(),
                    destination.display().to_string(),
                    "--no-password".to_string(),
                ];
                if compression {
                    args.push("--compress=6".to_string());
                }
                DumpInvocation {
                    program: "pg_dump",
                    args,
                    env: vec![("PGPASSWORD", db.password.clone())],
                }
            }
            EngineKind::SqlServer => {
                let mut statement = format!(
                    "BACKUP DATABASE [{}] TO DISK = N'{}' WITH FORMAT, INIT, SKIP, NOREWIND, NOUNLOAD, STATS = 10",
                    db.database.replace(']', "]]"),
                    destination.display().to_string().replace('\'', "''"),
                );
                if compression {
                    statement.push_str(", COMPRESSION");
                }
                DumpInvocation {
                    program: "sqlcmd",
                    args: vec![
                        "-S".to_string(),
                        format!("{},{}", db.host, db.port),
                        "-U".to_string(),
                        db.username.clone(),
                        "-b".to_string(),
                        "-Q".to_string(),
                        statement,
                    ],
                    env: vec![("SQLCMDPASSWORD", db.password.clone())],
                }
            }
        }
    }
}

/// Runs `pg_dump` or `sqlcmd` as a child process
#[derive(Debug, Clone, Default)]
pub struct DumpCommand;

#[async_trait]
impl BackupTool for DumpCommand {
    async fn dump(
        &self,
        target: &DatabaseTarget,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<()> {
        let invocation = DumpInvocation::for_target(target, destination, options.compression);
        debug!(program = invocation.program, "starting dump");

        let mut command = Command::new(invocation.program);
        command.args(&invocation.args).kill_on_drop(true);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let output = timeout(options.timeout, command.output())
            .await
            .map_err(|_| {
                Error::BackupFailed(format!(
                    "{} timed out after {}s",
                    invocation.program,
                    options.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(Error::BackupFailed(format!(
                "{} exited with {}: {}",
                invocation.program, output.status, detail
            )));
        }

        Ok(())
    }
}

/// Removes its target from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    target: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target);
    }
}

/// Runs backups, at most one per target and `parallel_jobs` overall
///
/// A request for a target whose backup is still running is rejected with
/// [`Error::BackupInFlight`] rather than queued.
pub struct BackupRunner {
    tool: Arc<dyn BackupTool>,
    in_flight: Mutex<HashSet<String>>,
    jobs: Semaphore,
}

impl BackupRunner {
    pub fn new(parallel_jobs: usize) -> Self {
        Self::with_tool(Arc::new(DumpCommand), parallel_jobs)
    }

    pub fn with_tool(tool: Arc<dyn BackupTool>, parallel_jobs: usize) -> Self {
        Self {
            tool,
            in_flight: Mutex::new(HashSet::new()),
            jobs: Semaphore::new(parallel_jobs.max(1)),
        }
    }

    fn begin(&self, target: &str) -> Result<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(target.to_string()) {
            return Err(Error::BackupInFlight(target.to_string()));
        }

        Ok(InFlight {
            set: &self.in_flight,
            target: target.to_string(),
        })
    }

    pub fn is_running(&self, target: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(target)
    }

    /// Back up one target
    ///
    /// Tool failures come back as a `failed` result; the only error is a
    /// backup already running for the same target.
    #[instrument(skip_all, fields(db = %target.name()))]
    pub async fn run_backup(
        &self,
        target: &DatabaseTarget,
        options: &BackupOptions,
    ) -> Result<BackupResult> {
        let _guard = self.begin(target.name())?;
        let _permit = self.jobs.acquire().await;

        let started = Instant::now();
        let timestamp = Utc::now();
        let destination = options.directory.join(artifact_name(
            target.name(),
            target.kind(),
            options.compression,
            timestamp,
        ));

        info!("starting backup to {}", destination.display());

        match self.write_artifact(target, &destination, options).await {
            Ok(size_bytes) => {
                let retention = enforce_retention(
                    &options.directory,
                    target.name(),
                    options.retention,
                    timestamp,
                    Some(&destination),
                )
                .await;

                info!(
                    size_bytes,
                    deleted = retention.deleted.len(),
                    "backup completed in {:.1}s",
                    started.elapsed().as_secs_f64()
                );

                Ok(BackupResult {
                    target: target.name().to_string(),
                    timestamp,
                    outcome: BackupOutcome::Success,
                    duration: started.elapsed(),
                    size_bytes,
                    destination,
                    error: None,
                    retention: Some(retention),
                })
            }
            Err(e) => {
                error!("backup failed: {e}");
                Ok(BackupResult {
                    target: target.name().to_string(),
                    timestamp,
                    outcome: BackupOutcome::Failed,
                    duration: started.elapsed(),
                    size_bytes: 0,
                    destination,
                    error: Some(e.to_string()),
                    retention: None,
                })
            }
        }
    }

    async fn write_artifact(
        &self,
        target: &DatabaseTarget,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<u64> {
        tokio::fs::create_dir_all(&options.directory).await?;
        self.tool.dump(target, destination, options).await?;

        match tokio::fs::metadata(destination).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(_) => Err(Error::BackupFailed(format!(
                "backup file {} was not created",
                destination.display()
            ))),
        }
    }
}

struct Artifact {
    path: PathBuf,
    taken_at: DateTime<Utc>,
    size: u64,
}

/// Timestamp of a file named `{target}_{YYYYmmdd_HHMMSS}{ext}`
fn artifact_timestamp(file_name: &str, target: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(target)?.strip_prefix('_')?;
    let stem = ARTIFACT_EXTENSIONS
        .iter()
        .find_map(|ext| rest.strip_suffix(ext))?;
    parse_file_timestamp(stem)
}

async fn list_artifacts(
    directory: &Path,
    target: &str,
    report: &mut RetentionReport,
) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return artifacts,
        Err(e) => {
            report
                .errors
                .push(format!("cannot list {}: {e}", directory.display()));
            return artifacts;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                report
                    .errors
                    .push(format!("cannot list {}: {e}", directory.display()));
                break;
            }
        };

        let file_name = entry.file_name();
        let Some(taken_at) = file_name
            .to_str()
            .and_then(|name| artifact_timestamp(name, target))
        else {
            continue;
        };

        match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => artifacts.push(Artifact {
                path: entry.path(),
                taken_at,
                size: metadata.len(),
            }),
            Ok(_) => {}
            Err(e) => report
                .errors
                .push(format!("cannot stat {}: {e}", entry.path().display())),
        }
    }

    artifacts
}

/// Delete `target`'s artifacts older than `retention`, oldest first
///
/// Stops at the first artifact inside the window. `keep` is never deleted.
#[instrument(skip_all, fields(db = target))]
pub async fn enforce_retention(
    directory: &Path,
    target: &str,
    retention: chrono::Duration,
    now: DateTime<Utc>,
    keep: Option<&Path>,
) -> RetentionReport {
    let mut report = RetentionReport::default();
    let cutoff = now - retention;

    let mut artifacts = list_artifacts(directory, target, &mut report).await;
    artifacts.sort_by_key(|a| a.taken_at);

    for artifact in artifacts {
        if keep == Some(artifact.path.as_path()) {
            continue;
        }
        if artifact.taken_at >= cutoff {
            break;
        }

        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {
                debug!("deleted old backup {}", artifact.path.display());
                report.freed_bytes += artifact.size;
                report.deleted.push(artifact.path);
            }
            Err(e) => {
                warn!("failed to delete {}: {e}", artifact.path.display());
                report
                    .errors
                    .push(format!("{}: {e}", artifact.path.display()));
            }
        }
    }

    if !report.deleted.is_empty() {
        info!(
            deleted = report.deleted.len(),
            freed_bytes = report.freed_bytes,
            "retention cleanup finished"
        );
    }

    report
}

/// Most recent artifacts of `target`, newest first
pub async fn recent_artifacts(directory: &Path, target: &str, limit: usize) -> Vec<PathBuf> {
    let mut report = RetentionReport::default();
    let mut artifacts = list_artifacts(directory, target, &mut report).await;
    artifacts.sort_by_key(|a| std::cmp::Reverse(a.taken_at));
    artifacts.into_iter().take(limit).map(|a| a.path).collect()
}
