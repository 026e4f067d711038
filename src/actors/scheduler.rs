//! Scheduler - drives health checks, backups and maintenance per target
//!
//! Every tick spawns one health check per enabled target into a `JoinSet`;
//! backups and maintenance are spawned the same way when their cron
//! schedule fires. Finished jobs come back through `join_next` and are
//! folded into the metrics, the history ring and the alert evaluator by the
//! scheduler task alone, so none of that state is shared with the jobs.
//!
//! ## Ordering
//!
//! - a target never has two health checks or two maintenance runs at once;
//!   a tick that finds one still running skips that target
//! - overlapping backups are turned away by [`BackupRunner`] itself
//! - a health check that outlives the tick deadline is dropped (its pooled
//!   connection is discarded) and reported as `down`

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout, timeout_at};
use tracing::{debug, error, info, instrument, warn};

use super::messages::{JobKind, SchedulerCommand, SchedulerEvent, SchedulerState};
use crate::alerts::{AlertEvaluator, AlertEvent, AlertThresholds};
use crate::backup::{BackupOptions, BackupResult, BackupRunSummary, BackupRunner};
use crate::config::{Config, CronSchedule};
use crate::health::{HealthChecker, HealthResult};
use crate::history::HealthHistory;
use crate::metrics::MetricsRegistry;
use crate::notify::NotifierSet;
use crate::optimize::{OptimizationResult, PerformanceOptimizer};
use crate::target::{DatabaseTarget, TargetRegistry};

/// Timing knobs of the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub check_interval: Duration,
    /// How long a single health check may run before it is abandoned
    pub tick_timeout: Duration,
    pub shutdown_grace: Duration,
    pub backup_schedule: Option<CronSchedule>,
    pub optimize_schedule: Option<CronSchedule>,
    pub backup: BackupOptions,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        Ok(Self {
            check_interval: config.monitoring.check_interval(),
            tick_timeout: config.monitoring.tick_timeout(),
            shutdown_grace: config.monitoring.shutdown_grace(),
            backup_schedule: Some(config.backup_schedule()?),
            optimize_schedule: Some(config.optimize_schedule()?),
            backup: BackupOptions::from(&config.backup),
        })
    }
}

/// Everything the scheduler task needs, assembled before it is spawned
pub struct Scheduler {
    registry: TargetRegistry,
    settings: SchedulerSettings,
    checker: HealthChecker,
    thresholds: AlertThresholds,
    evaluator: AlertEvaluator,
    backups: Arc<BackupRunner>,
    optimizer: PerformanceOptimizer,
    metrics: MetricsRegistry,
    notifiers: NotifierSet,
    history: HealthHistory,
}

impl Scheduler {
    pub fn new(
        registry: TargetRegistry,
        settings: SchedulerSettings,
        metrics: MetricsRegistry,
        history: HealthHistory,
    ) -> Self {
        let evaluator = AlertEvaluator::new(settings.check_interval);

        Self {
            registry,
            settings,
            checker: HealthChecker::default(),
            thresholds: AlertThresholds::default(),
            evaluator,
            backups: Arc::new(BackupRunner::new(1)),
            optimizer: PerformanceOptimizer::default(),
            metrics,
            notifiers: NotifierSet::new(),
            history,
        }
    }

    pub fn from_config(
        config: &Config,
        registry: TargetRegistry,
        metrics: MetricsRegistry,
        history: HealthHistory,
    ) -> crate::error::Result<Self> {
        let settings = SchedulerSettings::from_config(config)?;

        Ok(Self::new(registry, settings, metrics, history)
            .with_thresholds(config.monitoring.alert_thresholds.clone())
            .with_alert_cooldown(config.monitoring.alert_cooldown())
            .with_backup_runner(BackupRunner::new(config.backup.parallel_jobs))
            .with_optimizer(PerformanceOptimizer::new(config.performance.clone()))
            .with_notifiers(NotifierSet::from_config(&config.monitoring)?))
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.checker = HealthChecker::new(thresholds.clone());
        self.thresholds = thresholds;
        self
    }

    pub fn with_alert_cooldown(mut self, cooldown: Duration) -> Self {
        self.evaluator = AlertEvaluator::new(cooldown);
        self
    }

    pub fn with_backup_runner(mut self, runner: BackupRunner) -> Self {
        self.backups = Arc::new(runner);
        self
    }

    pub fn with_optimizer(mut self, optimizer: PerformanceOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_notifiers(mut self, notifiers: NotifierSet) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Start the scheduler task; the first health tick runs immediately
    pub fn spawn(self) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let (event_tx, _) = broadcast::channel(256);

        let runner = Runner {
            scheduler: self,
            command_rx,
            state_tx,
            event_tx: event_tx.clone(),
            jobs: JoinSet::new(),
            running: HashMap::new(),
            backup_jobs: HashMap::new(),
            backup_batches: HashMap::new(),
            next_batch: 0,
            notifications: JoinSet::new(),
        };

        tokio::spawn(runner.run());

        SchedulerHandle {
            sender: command_tx,
            state: state_rx,
            events: event_tx,
        }
    }
}

enum JobOutcome {
    Health(HealthResult),
    Backup(BackupResult),
    BackupRejected(String),
    Optimization(OptimizationResult),
}

/// Backups started together, summarized once the last one finishes
struct BackupBatch {
    remaining: usize,
    summary: BackupRunSummary,
}

struct Runner {
    scheduler: Scheduler,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    state_tx: watch::Sender<SchedulerState>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    jobs: JoinSet<JobOutcome>,
    /// Target and kind of every job in `jobs`
    running: HashMap<task::Id, (String, JobKind)>,
    /// Batch each running backup belongs to
    backup_jobs: HashMap<task::Id, u64>,
    backup_batches: HashMap<u64, BackupBatch>,
    next_batch: u64,
    notifications: JoinSet<()>,
}

impl Runner {
    #[instrument(skip_all, name = "scheduler")]
    async fn run(mut self) {
        let check_interval = self.scheduler.settings.check_interval;
        info!(
            targets = self.scheduler.registry.enabled().len(),
            "scheduler started, health checks every {:.0}s",
            check_interval.as_secs_f64()
        );

        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let backup_schedule = self.scheduler.settings.backup_schedule.clone();
        let optimize_schedule = self.scheduler.settings.optimize_schedule.clone();
        let mut next_backup = next_run(backup_schedule.as_ref(), Utc::now());
        let mut next_optimize = next_run(optimize_schedule.as_ref(), Utc::now());
        if let (Some(schedule), Some(at)) = (&backup_schedule, next_backup) {
            info!("backups scheduled at '{}', next run {at}", schedule.expression());
        }
        if let (Some(schedule), Some(at)) = (&optimize_schedule, next_optimize) {
            info!("maintenance scheduled at '{}', next run {at}", schedule.expression());
        }

        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.start_tick(),

                _ = sleep_until_at(next_backup) => {
                    info!("backup schedule fired");
                    self.start_backups();
                    next_backup = next_backup.and_then(|at| next_run(backup_schedule.as_ref(), at));
                }

                _ = sleep_until_at(next_optimize) => {
                    info!("maintenance schedule fired");
                    self.start_optimizations();
                    next_optimize = next_optimize.and_then(|at| next_run(optimize_schedule.as_ref(), at));
                }

                Some(joined) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => {
                    self.finish(joined).await;
                }

                command = self.command_rx.recv() => match command {
                    Some(SchedulerCommand::TickNow) => self.start_tick(),
                    Some(SchedulerCommand::BackupNow) => self.start_backups(),
                    Some(SchedulerCommand::OptimizeNow) => self.start_optimizations(),
                    Some(SchedulerCommand::Shutdown { respond_to }) => {
                        debug!("received shutdown command");
                        shutdown_reply = Some(respond_to);
                        break;
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                },
            }

            self.reap_notifications();
        }

        self.shutdown().await;

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn start_tick(&mut self) {
        let mut started = 0;
        for target in self.scheduler.registry.enabled() {
            if self.spawn_health(target) {
                started += 1;
            }
        }

        if started > 0 {
            self.state_tx.send_replace(SchedulerState::RunningTick);
        }
        debug!(started, "health tick");
    }

    fn start_backups(&mut self) {
        let batch = self.next_batch;
        self.next_batch += 1;
        let mut remaining = 0;

        for target in self.scheduler.registry.enabled() {
            let runner = self.scheduler.backups.clone();
            let options = self.scheduler.settings.backup.clone();
            let name = target.name().to_string();

            let job = self.spawn_job(name.clone(), JobKind::Backup, async move {
                match runner.run_backup(&target, &options).await {
                    Ok(result) => JobOutcome::Backup(result),
                    Err(e) => {
                        debug!("{e}");
                        JobOutcome::BackupRejected(name)
                    }
                }
            });
            if let Some(id) = job {
                self.backup_jobs.insert(id, batch);
                remaining += 1;
            }
        }

        if remaining > 0 {
            self.backup_batches.insert(
                batch,
                BackupBatch {
                    remaining,
                    summary: BackupRunSummary::default(),
                },
            );
        }
    }

    fn start_optimizations(&mut self) {
        for target in self.scheduler.registry.enabled() {
            let optimizer = self.scheduler.optimizer.clone();

            self.spawn_job(target.name().to_string(), JobKind::Optimize, async move {
                JobOutcome::Optimization(optimizer.optimize(&target).await)
            });
        }
    }

    fn spawn_health(&mut self, target: Arc<DatabaseTarget>) -> bool {
        let checker = self.scheduler.checker.clone();
        let deadline = self.scheduler.settings.tick_timeout;

        self.spawn_job(target.name().to_string(), JobKind::Health, async move {
            let started = Instant::now();
            match timeout(deadline, checker.check(&target)).await {
                Ok(result) => JobOutcome::Health(result),
                Err(_) => {
                    warn!(
                        db = %target.name(),
                        "health check abandoned after {:.1}s",
                        deadline.as_secs_f64()
                    );
                    JobOutcome::Health(HealthResult::down(
                        target.name(),
                        format!(
                            "health check timed out after {:.1}s",
                            deadline.as_secs_f64()
                        ),
                        started.elapsed(),
                    ))
                }
            }
        })
        .is_some()
    }

    /// Spawn `job` unless the same kind of job is still running for `target`
    ///
    /// Backups are always spawned; [`BackupRunner`] rejects the overlap.
    fn spawn_job<F>(&mut self, target: String, kind: JobKind, job: F) -> Option<task::Id>
    where
        F: Future<Output = JobOutcome> + Send + 'static,
    {
        let key = (target, kind);
        if kind != JobKind::Backup && self.running.values().any(|running| *running == key) {
            debug!(db = %key.0, %kind, "previous run still in flight, skipping");
            return None;
        }

        let id = self.jobs.spawn(job).id();
        self.running.insert(id, key);
        Some(id)
    }

    async fn finish(&mut self, joined: std::result::Result<(task::Id, JobOutcome), JoinError>) {
        match joined {
            Ok((id, outcome)) => {
                self.running.remove(&id);
                let batch = self.backup_jobs.remove(&id);
                match outcome {
                    JobOutcome::Health(result) => self.handle_health(result).await,
                    JobOutcome::Backup(result) => {
                        self.handle_backup(result.clone());
                        self.settle_backup(batch, |summary| summary.record(&result));
                    }
                    JobOutcome::BackupRejected(target) => {
                        warn!(db = %target, "backup already running, request rejected");
                        self.scheduler.metrics.record_backup_rejected(&target);
                        self.settle_backup(batch, |summary| summary.record_rejected(&target));
                        self.publish(SchedulerEvent::BackupRejected { target });
                    }
                    JobOutcome::Optimization(result) => self.handle_optimization(result),
                }
            }
            Err(e) => {
                let job = self.running.remove(&e.id());
                let batch = self.backup_jobs.remove(&e.id());
                if let Some((target, JobKind::Backup)) = &job {
                    self.settle_backup(batch, |summary| summary.record_lost(target));
                }
                if e.is_panic() {
                    error!(?job, "job panicked: {e}");
                    if let Some((target, JobKind::Health)) = job {
                        let result = HealthResult::down(target, "health check panicked", Duration::ZERO);
                        self.handle_health(result).await;
                    }
                } else {
                    debug!(?job, "job cancelled");
                }
            }
        }

        let health_running = self
            .running
            .values()
            .any(|(_, kind)| *kind == JobKind::Health);
        if !health_running && *self.state_tx.borrow() == SchedulerState::RunningTick {
            self.state_tx.send_replace(SchedulerState::Idle);
        }
    }

    async fn handle_health(&mut self, result: HealthResult) {
        self.scheduler.metrics.record_health(&result);
        self.scheduler.history.record(result.clone()).await;

        let alerts = self
            .scheduler
            .evaluator
            .evaluate(&result, &self.scheduler.thresholds);
        self.publish(SchedulerEvent::Health(result));

        for alert in alerts {
            self.raise(alert);
        }
    }

    fn handle_backup(&mut self, result: BackupResult) {
        self.scheduler.metrics.record_backup(&result);

        let alert = self.scheduler.evaluator.evaluate_backup(&result);
        self.publish(SchedulerEvent::Backup(result));

        if let Some(alert) = alert {
            self.raise(alert);
        }
    }

    /// Count one finished backup towards its batch; the last one sends the summary
    fn settle_backup(&mut self, batch: Option<u64>, update: impl FnOnce(&mut BackupRunSummary)) {
        let Some(batch) = batch else {
            return;
        };
        let Some(pending) = self.backup_batches.get_mut(&batch) else {
            return;
        };

        update(&mut pending.summary);
        pending.remaining -= 1;
        if pending.remaining > 0 {
            return;
        }

        if let Some(done) = self.backup_batches.remove(&batch) {
            self.summarize_backups(done.summary);
        }
    }

    fn summarize_backups(&mut self, summary: BackupRunSummary) {
        if summary.total() == 0 {
            debug!(rejected = summary.rejected.len(), "backup run had nothing to do");
            return;
        }

        info!(
            succeeded = summary.succeeded,
            total = summary.total(),
            files_deleted = summary.files_deleted,
            freed_bytes = summary.freed_bytes,
            "backup run finished"
        );
        self.notify(summary.alert(Utc::now()));
        self.publish(SchedulerEvent::BackupSummary(summary));
    }

    fn handle_optimization(&mut self, result: OptimizationResult) {
        self.scheduler.metrics.record_optimization(&result);

        for action in result.failed_actions() {
            warn!(
                db = %result.target,
                action = %action.kind.as_str(),
                object = %action.object,
                "maintenance action failed: {}",
                action.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.publish(SchedulerEvent::Optimization(result));
    }

    fn raise(&mut self, alert: AlertEvent) {
        warn!(
            db = %alert.target,
            metric = %alert.metric,
            severity = %alert.severity,
            "{}",
            alert.message
        );
        self.scheduler.metrics.record_alert(&alert);
        self.notify(alert.clone());
        self.publish(SchedulerEvent::Alert(alert));
    }

    /// Hand `event` to every notifier without waiting for delivery
    fn notify(&mut self, event: AlertEvent) {
        if self.scheduler.notifiers.is_empty() {
            return;
        }

        let notifiers = self.scheduler.notifiers.clone();
        self.notifications.spawn(async move {
            notifiers.dispatch(&event).await;
        });
    }

    fn publish(&self, event: SchedulerEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn reap_notifications(&mut self) {
        while let Some(done) = self.notifications.try_join_next() {
            if let Err(e) = done {
                error!("notification task failed: {e}");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.state_tx.send_replace(SchedulerState::ShuttingDown);

        let grace = self.scheduler.settings.shutdown_grace;
        let deadline = Instant::now() + grace;

        if !self.jobs.is_empty() {
            info!(
                in_flight = self.jobs.len(),
                "waiting up to {:.0}s for in-flight jobs",
                grace.as_secs_f64()
            );
        }

        loop {
            match timeout_at(deadline, self.jobs.join_next_with_id()).await {
                Ok(Some(joined)) => self.finish(joined).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = self.jobs.len(),
                        "grace period elapsed, aborting remaining jobs"
                    );
                    self.jobs.abort_all();
                    while let Some(joined) = self.jobs.join_next_with_id().await {
                        self.finish(joined).await;
                    }
                    break;
                }
            }
        }

        let notifications = &mut self.notifications;
        let drained = timeout_at(deadline, async {
            while notifications.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                pending = self.notifications.len(),
                "dropping undelivered notifications"
            );
            self.notifications.abort_all();
        }

        self.scheduler.registry.close_all().await;
        info!("scheduler stopped, all pools closed");
    }
}

fn next_run(schedule: Option<&CronSchedule>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.and_then(|s| s.next_after(after))
}

/// Sleep until a wall-clock time, or forever when there is none
async fn sleep_until_at(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => sleep((at - Utc::now()).to_std().unwrap_or_default()).await,
        None => std::future::pending().await,
    }
}

/// Handle for controlling the scheduler task
///
/// Cheap to clone. When every handle is dropped the scheduler shuts down as
/// if [`SchedulerHandle::shutdown`] had been called.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub async fn tick_now(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::TickNow)
            .await
            .context("failed to send TickNow command")
    }

    pub async fn backup_now(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::BackupNow)
            .await
            .context("failed to send BackupNow command")
    }

    pub async fn optimize_now(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::OptimizeNow)
            .await
            .context("failed to send OptimizeNow command")
    }

    /// Stop the scheduler and wait until its pools are closed
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;

        rx.await.context("scheduler exited without confirming shutdown")
    }
}
