//! Migration scheduler.
//!
//! Owns the map of scheduled migrations and a bounded-concurrency
//! execution queue. A single control loop wakes every ten seconds,
//! promotes due schedules, computes cron/recurring successors at
//! dispatch time, drains the queue up to the concurrency cap, and
//! harvests finished runs. The schedule map persists to a JSON file on
//! every mutation (snapshot taken outside the lock) and reloads on
//! startup; the serialized form round-trips exactly.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::{
    LogEntry, LogLevel, MigrationConfig, ScheduleKind, ScheduleOptions, ScheduleStatus,
    ScheduledMigration,
};
use siteshift_retry::{RetryPolicy, calculate_delay};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::orchestrator::{NullReporter, Orchestrator};

/// Control loop wake interval.
pub const LOOP_INTERVAL: Duration = Duration::from_secs(10);
/// Default bound on concurrently executing migrations.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub max_concurrent: usize,
    pub queued: usize,
    pub executing: usize,
    pub total_schedules: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
    persistence_path: Option<PathBuf>,
    schedules: Mutex<HashMap<String, ScheduledMigration>>,
    queue: Mutex<VecDeque<String>>,
    executing: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
    loop_running: Mutex<bool>,
    logs: Mutex<Vec<LogEntry>>,
    /// Back-reference handed to spawned execution tasks.
    weak_self: Mutex<Weak<Scheduler>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        max_concurrent: usize,
        persistence_path: Option<PathBuf>,
    ) -> Result<Arc<Self>> {
        let scheduler = Arc::new(Scheduler {
            orchestrator,
            max_concurrent: max_concurrent.max(1),
            persistence_path,
            schedules: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            executing: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            loop_running: Mutex::new(false),
            logs: Mutex::new(Vec::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *scheduler
            .weak_self
            .lock()
            .map_err(|_| Error::scheduler("scheduler self-reference poisoned"))? =
            Arc::downgrade(&scheduler);
        scheduler.load()?;
        Ok(scheduler)
    }

    fn strong_self(&self) -> Result<Arc<Scheduler>> {
        self.weak_self
            .lock()
            .map_err(|_| Error::scheduler("scheduler self-reference poisoned"))?
            .upgrade()
            .ok_or_else(|| Error::scheduler("scheduler has been dropped"))
    }

    fn log(&self, level: LogLevel, message: String, migration_id: Option<&str>) {
        let mut entry = LogEntry::new(level, message).with_component("Scheduler");
        if let Some(id) = migration_id {
            entry = entry.with_detail("migration_id", serde_json::json!(id));
        }
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(entry);
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    // -- schedule creation ---------------------------------------------------

    pub fn schedule_immediate(
        &self,
        config: MigrationConfig,
        options: ScheduleOptions,
    ) -> Result<String> {
        let schedule = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            config,
            ScheduleKind::Immediate,
            Utc::now(),
            options,
        );
        self.insert(schedule)
    }

    pub fn schedule_delayed(
        &self,
        config: MigrationConfig,
        run_at: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Result<String> {
        let schedule = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            config,
            ScheduleKind::Delayed,
            run_at,
            options,
        );
        self.insert(schedule)
    }

    /// Cron validity is checked here, synchronously; the first
    /// `next_run` is strictly in the future.
    pub fn schedule_cron(
        &self,
        config: MigrationConfig,
        cron_expression: &str,
        recurrence_end: Option<DateTime<Utc>>,
        options: ScheduleOptions,
    ) -> Result<String> {
        let next_run = compute_next_run(cron_expression, Utc::now())?;
        let mut schedule = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            config,
            ScheduleKind::Cron,
            next_run,
            options,
        );
        schedule.cron_expression = Some(cron_expression.to_string());
        schedule.recurrence_end = recurrence_end;
        self.log(
            LogLevel::Info,
            format!("scheduled cron migration for {next_run}"),
            Some(&schedule.id),
        );
        self.insert(schedule)
    }

    pub fn schedule_recurring(
        &self,
        config: MigrationConfig,
        interval_secs: u64,
        recurrence_end: Option<DateTime<Utc>>,
        options: ScheduleOptions,
    ) -> Result<String> {
        if interval_secs == 0 {
            return Err(Error::scheduler("recurrence interval must be positive"));
        }
        let next_run = Utc::now() + TimeDelta::seconds(interval_secs as i64);
        let mut schedule = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            config,
            ScheduleKind::Recurring,
            next_run,
            options,
        );
        schedule.recurrence_interval_secs = Some(interval_secs);
        schedule.recurrence_end = recurrence_end;
        self.insert(schedule)
    }

    fn insert(&self, schedule: ScheduledMigration) -> Result<String> {
        let id = schedule.id.clone();
        self.schedules
            .lock()
            .map_err(|_| Error::scheduler("schedule map poisoned"))?
            .insert(id.clone(), schedule);
        self.persist()?;
        self.log(LogLevel::Info, "migration scheduled".to_string(), Some(&id));
        Ok(id)
    }

    // -- queries -------------------------------------------------------------

    pub fn get(&self, migration_id: &str) -> Option<ScheduledMigration> {
        self.schedules.lock().ok()?.get(migration_id).cloned()
    }

    pub fn list(
        &self,
        status: Option<ScheduleStatus>,
        kind: Option<ScheduleKind>,
    ) -> Vec<ScheduledMigration> {
        let mut schedules: Vec<ScheduledMigration> = self
            .schedules
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        if let Some(status) = status {
            schedules.retain(|s| s.status == status);
        }
        if let Some(kind) = kind {
            schedules.retain(|s| s.kind == kind);
        }
        schedules.sort_by(|a, b| a.next_run.cmp(&b.next_run));
        schedules
    }

    pub fn status(&self) -> SchedulerStatus {
        let schedules = self.schedules.lock().map(|s| s.clone()).unwrap_or_default();
        let count = |status: ScheduleStatus| {
            schedules.values().filter(|s| s.status == status).count()
        };
        SchedulerStatus {
            running: self.loop_running.lock().map(|r| *r).unwrap_or(false),
            max_concurrent: self.max_concurrent,
            queued: self.queue.lock().map(|q| q.len()).unwrap_or(0),
            executing: self.executing.lock().map(|e| e.len()).unwrap_or(0),
            total_schedules: schedules.len(),
            pending: count(ScheduleStatus::Pending),
            completed: count(ScheduleStatus::Completed),
            failed: count(ScheduleStatus::Failed),
            cancelled: count(ScheduleStatus::Cancelled),
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Start the control loop. Repeated starts are a logged no-op.
    pub fn start(&self) {
        {
            let mut running = match self.loop_running.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if *running {
                self.log(
                    LogLevel::Warning,
                    "scheduler is already running".to_string(),
                    None,
                );
                return;
            }
            *running = true;
        }

        let Ok(scheduler) = self.strong_self() else {
            return;
        };
        tokio::spawn(async move {
            // First pass immediately; immediate schedules should not
            // wait out a full loop interval.
            if let Err(e) = scheduler.tick().await {
                scheduler.log(LogLevel::Error, format!("scheduler loop error: {e}"), None);
            }
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(LOOP_INTERVAL) => {
                        if let Err(e) = scheduler.tick().await {
                            scheduler.log(
                                LogLevel::Error,
                                format!("scheduler loop error: {e}"),
                                None,
                            );
                        }
                    }
                }
            }
            if let Ok(mut running) = scheduler.loop_running.lock() {
                *running = false;
            }
        });
        self.log(LogLevel::Info, "migration scheduler started".to_string(), None);
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.log(LogLevel::Info, "migration scheduler stopped".to_string(), None);
    }

    /// One control-loop iteration: promote due schedules, dispatch up
    /// to the concurrency cap, harvest finished tasks. Public so tests
    /// and embedders can drive the loop manually.
    pub async fn tick(&self) -> Result<()> {
        self.promote_due()?;
        self.harvest();
        self.dispatch()?;
        Ok(())
    }

    fn promote_due(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<ScheduledMigration> = {
            let mut schedules = self
                .schedules
                .lock()
                .map_err(|_| Error::scheduler("schedule map poisoned"))?;
            let ids: Vec<String> = schedules
                .values()
                .filter(|s| s.is_due(now))
                .map(|s| s.id.clone())
                .collect();
            let mut due = Vec::new();
            for id in ids {
                if let Some(schedule) = schedules.get_mut(&id) {
                    schedule.status = ScheduleStatus::Running;
                    due.push(schedule.clone());
                }
            }
            due
        };

        if due.is_empty() {
            return Ok(());
        }

        for schedule in &due {
            self.log(
                LogLevel::Info,
                "migration queued for execution".to_string(),
                Some(&schedule.id),
            );
            self.queue
                .lock()
                .map_err(|_| Error::scheduler("queue poisoned"))?
                .push_back(schedule.id.clone());

            // Cron and recurring schedules atomically insert their
            // successor, anchored at dispatch time.
            if let Some(successor) = self.successor_of(schedule)? {
                self.schedules
                    .lock()
                    .map_err(|_| Error::scheduler("schedule map poisoned"))?
                    .insert(successor.id.clone(), successor.clone());
                self.log(
                    LogLevel::Info,
                    format!("scheduled next run at {}", successor.next_run),
                    Some(&successor.id),
                );
            }
        }

        self.persist()
    }

    fn successor_of(&self, schedule: &ScheduledMigration) -> Result<Option<ScheduledMigration>> {
        let next_run = match schedule.kind {
            ScheduleKind::Cron => {
                let Some(expr) = &schedule.cron_expression else {
                    return Ok(None);
                };
                compute_next_run(expr, Utc::now())?
            }
            ScheduleKind::Recurring => {
                let Some(interval) = schedule.recurrence_interval_secs else {
                    return Ok(None);
                };
                Utc::now() + TimeDelta::seconds(interval as i64)
            }
            _ => return Ok(None),
        };

        if !schedule.recurrence_allows(next_run) {
            return Ok(None);
        }

        let mut successor = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            schedule.config.clone(),
            schedule.kind,
            next_run,
            schedule.options.clone(),
        );
        successor.cron_expression = schedule.cron_expression.clone();
        successor.recurrence_interval_secs = schedule.recurrence_interval_secs;
        successor.recurrence_end = schedule.recurrence_end;
        successor.retry_count = schedule.retry_count;
        successor.max_retries = schedule.max_retries;
        Ok(Some(successor))
    }

    fn dispatch(&self) -> Result<()> {
        loop {
            {
                let executing = self
                    .executing
                    .lock()
                    .map_err(|_| Error::scheduler("execution table poisoned"))?;
                if executing.len() >= self.max_concurrent {
                    return Ok(());
                }
            }
            let Some(id) = self
                .queue
                .lock()
                .map_err(|_| Error::scheduler("queue poisoned"))?
                .pop_front()
            else {
                return Ok(());
            };

            let scheduler = self.strong_self()?;
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                scheduler.execute_scheduled(&task_id).await;
            });
            self.executing
                .lock()
                .map_err(|_| Error::scheduler("execution table poisoned"))?
                .insert(id, handle);
        }
    }

    fn harvest(&self) {
        if let Ok(mut executing) = self.executing.lock() {
            executing.retain(|_, handle| !handle.is_finished());
        }
    }

    async fn execute_scheduled(&self, migration_id: &str) {
        let Some(mut schedule) = self.get(migration_id) else {
            return;
        };

        schedule.started_at = Some(Utc::now());
        schedule.status = ScheduleStatus::Running;
        self.update(schedule.clone());

        let mut config = schedule.config.clone();
        config.transfer.auto_rollback = schedule.options.auto_rollback;

        let outcome = match self.orchestrator.create_session(config) {
            Ok(session) => {
                schedule.session_id = Some(session.id.clone());
                self.update(schedule.clone());
                self.orchestrator.execute(&session.id, &NullReporter).await
            }
            Err(e) => Err(e),
        };

        schedule.completed_at = Some(Utc::now());
        match outcome {
            Ok(_) => {
                schedule.status = ScheduleStatus::Completed;
                self.log(
                    LogLevel::Info,
                    "scheduled migration completed successfully".to_string(),
                    Some(migration_id),
                );
            }
            Err(e) => {
                schedule.status = ScheduleStatus::Failed;
                schedule.error_message = Some(e.to_string());
                self.log(
                    LogLevel::Error,
                    format!("scheduled migration failed: {e}"),
                    Some(migration_id),
                );
                if schedule.retry_count < schedule.max_retries {
                    self.schedule_retry(&schedule);
                }
            }
        }
        self.update(schedule);
    }

    /// Insert a delayed retry at now + 2^(retry_count+1) minutes.
    fn schedule_retry(&self, failed: &ScheduledMigration) {
        let retry_count = failed.retry_count + 1;
        let delay = calculate_delay(&RetryPolicy::Scheduler.to_config(), retry_count);
        let run_at = Utc::now() + TimeDelta::seconds(delay.as_secs() as i64);

        let mut retry = ScheduledMigration::new(
            Uuid::new_v4().to_string(),
            failed.config.clone(),
            ScheduleKind::Delayed,
            run_at,
            failed.options.clone(),
        );
        retry.retry_count = retry_count;
        retry.max_retries = failed.max_retries;

        if let Ok(mut schedules) = self.schedules.lock() {
            schedules.insert(retry.id.clone(), retry.clone());
        }
        let _ = self.persist();
        self.log(
            LogLevel::Info,
            format!("scheduled retry {} at {run_at}", retry.retry_count),
            Some(&retry.id),
        );
    }

    fn update(&self, schedule: ScheduledMigration) {
        if let Ok(mut schedules) = self.schedules.lock() {
            schedules.insert(schedule.id.clone(), schedule);
        }
        let _ = self.persist();
    }

    /// Cancel a schedule; running sessions receive a cooperative
    /// cancellation request.
    pub fn cancel_schedule(&self, migration_id: &str) -> bool {
        let Some(mut schedule) = self.get(migration_id) else {
            return false;
        };
        if schedule.status.is_terminal() {
            return false;
        }
        if schedule.status == ScheduleStatus::Running
            && let Some(session_id) = &schedule.session_id
        {
            let _ = self.orchestrator.cancel(session_id);
        }
        schedule.status = ScheduleStatus::Cancelled;
        schedule.completed_at = Some(Utc::now());
        self.update(schedule);
        self.log(
            LogLevel::Info,
            "cancelled scheduled migration".to_string(),
            Some(migration_id),
        );
        true
    }

    /// Drop terminal records older than the threshold.
    pub fn cleanup_old(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - TimeDelta::days(max_age_days as i64);
        let removed = {
            let Ok(mut schedules) = self.schedules.lock() else {
                return 0;
            };
            let before = schedules.len();
            schedules.retain(|_, s| {
                !(s.status.is_terminal()
                    && s.completed_at.is_some_and(|done| done < cutoff))
            });
            before - schedules.len()
        };
        if removed > 0 {
            let _ = self.persist();
            self.log(
                LogLevel::Info,
                format!("cleaned up {removed} old migrations"),
                None,
            );
        }
        removed
    }

    // -- persistence ---------------------------------------------------------

    /// Serialize the schedule map. The write happens outside the lock,
    /// on a snapshot, through a temp-file rename.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let snapshot: HashMap<String, ScheduledMigration> = self
            .schedules
            .lock()
            .map_err(|_| Error::scheduler("schedule map poisoned"))?
            .clone();

        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::scheduler(format!("cannot serialize schedules: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)
            .map_err(|e| Error::scheduler(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::scheduler(format!("cannot replace {}: {e}", path.display())))?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let body = std::fs::read_to_string(path)
            .map_err(|e| Error::scheduler(format!("cannot read {}: {e}", path.display())))?;
        let loaded: HashMap<String, ScheduledMigration> = serde_json::from_str(&body)
            .map_err(|e| Error::scheduler(format!("cannot parse {}: {e}", path.display())))?;
        let count = loaded.len();
        *self
            .schedules
            .lock()
            .map_err(|_| Error::scheduler("schedule map poisoned"))? = loaded;
        self.log(
            LogLevel::Info,
            format!("loaded {count} scheduled migrations"),
            None,
        );
        Ok(())
    }
}

/// Next fire time of a cron expression strictly after `after`.
///
/// Classic five-field expressions are accepted and normalized by
/// prepending a seconds column. Successors computed here anchor at
/// dispatch time, not at the original schedule time; long-running
/// migrations therefore drift the cadence by their own duration.
pub fn compute_next_run(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_cron(expression);
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::scheduler(format!("invalid cron expression '{expression}': {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| Error::scheduler(format!("cron expression '{expression}' never fires")))
}

fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use crate::store::ArtifactStore;
    use chrono::Timelike;

    fn scheduler(dir: &std::path::Path, persistence: bool) -> Arc<Scheduler> {
        let store =
            ArtifactStore::new(dir.join("backups"), RetentionPolicy::keep_everything()).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(store)));
        let path = persistence.then(|| dir.join("schedules.json"));
        Scheduler::new(orchestrator, DEFAULT_MAX_CONCURRENT, path).unwrap()
    }

    fn local_config(dir: &std::path::Path) -> MigrationConfig {
        use siteshift_types::{SystemConfig, SystemKind};
        let source_root = dir.join("src_site");
        let destination_root = dir.join("dst_site");
        std::fs::create_dir_all(&source_root).unwrap();
        std::fs::create_dir_all(&destination_root).unwrap();
        std::fs::write(source_root.join("index.html"), "x").unwrap();

        let mut config = MigrationConfig::minimal("scheduled-move");
        config.source = SystemConfig {
            kind: SystemKind::StaticSite,
            host: "a".to_string(),
            port: None,
            document_root: Some(source_root),
            cloud: None,
        };
        config.destination = SystemConfig {
            kind: SystemKind::StaticSite,
            host: "b".to_string(),
            port: None,
            document_root: Some(destination_root),
            cloud: None,
        };
        config
    }

    #[test]
    fn test_normalize_cron_adds_seconds_column() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_cron("0 0 2 * * *"), "0 0 2 * * *");
    }

    #[test]
    fn test_compute_next_run_daily_at_two() {
        let after = "2026-03-01T01:59:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = compute_next_run("0 2 * * *", after).unwrap();
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 0);
        assert_eq!(next, "2026-03-01T02:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_invalid_cron_fails_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let err = scheduler
            .schedule_cron(
                MigrationConfig::minimal("bad"),
                "not a cron",
                None,
                ScheduleOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Scheduler(_)));
    }

    #[test]
    fn test_cron_first_run_is_in_the_future() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let id = scheduler
            .schedule_cron(
                MigrationConfig::minimal("nightly"),
                "0 2 * * *",
                None,
                ScheduleOptions::default(),
            )
            .unwrap();
        let schedule = scheduler.get(&id).unwrap();
        assert!(schedule.next_run > Utc::now());
        assert_eq!(schedule.kind, ScheduleKind::Cron);
    }

    #[tokio::test]
    async fn test_immediate_schedule_runs_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let id = scheduler
            .schedule_immediate(local_config(dir.path()), ScheduleOptions::default())
            .unwrap();

        // Drive the control loop manually until the run finishes.
        for _ in 0..100 {
            scheduler.tick().await.unwrap();
            let schedule = scheduler.get(&id).unwrap();
            if schedule.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let schedule = scheduler.get(&id).unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Completed, "{:?}", schedule.error_message);
        assert!(schedule.session_id.is_some());
        assert!(schedule.started_at.is_some());
        assert!(schedule.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cron_dispatch_inserts_exactly_one_successor() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let id = scheduler
            .schedule_cron(
                local_config(dir.path()),
                "0 2 * * *",
                None,
                ScheduleOptions::default(),
            )
            .unwrap();

        // Force the schedule due, then run one promotion pass.
        {
            let mut schedules = scheduler.schedules.lock().unwrap();
            schedules.get_mut(&id).unwrap().next_run = Utc::now() - TimeDelta::seconds(1);
        }
        scheduler.tick().await.unwrap();

        let pending = scheduler.list(Some(ScheduleStatus::Pending), Some(ScheduleKind::Cron));
        assert_eq!(pending.len(), 1);
        let successor = &pending[0];
        assert_ne!(successor.id, id);
        assert_eq!(
            successor.cron_expression.as_deref(),
            Some("0 2 * * *")
        );
        assert_eq!(successor.next_run.hour(), 2);
        assert!(successor.next_run > Utc::now());

        // A closed recurrence window suppresses the successor.
        let closed_id = scheduler
            .schedule_cron(
                local_config(dir.path()),
                "0 2 * * *",
                Some(Utc::now() - TimeDelta::days(1)),
                ScheduleOptions::default(),
            )
            .unwrap();
        {
            let mut schedules = scheduler.schedules.lock().unwrap();
            schedules.get_mut(&closed_id).unwrap().next_run =
                Utc::now() - TimeDelta::seconds(1);
        }
        scheduler.tick().await.unwrap();
        let pending_after = scheduler.list(Some(ScheduleStatus::Pending), Some(ScheduleKind::Cron));
        // Still just the one successor from the open schedule.
        assert_eq!(pending_after.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_schedules_backoff_retry() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        // A config whose source tree is missing fails pre-flight.
        let mut config = local_config(dir.path());
        config.source.document_root = Some(dir.path().join("missing"));
        let id = scheduler
            .schedule_immediate(config, ScheduleOptions::default())
            .unwrap();

        for _ in 0..100 {
            scheduler.tick().await.unwrap();
            if scheduler.get(&id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let schedule = scheduler.get(&id).unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Failed);
        assert!(schedule.error_message.is_some());

        // A delayed retry exists, two minutes out, with the bumped
        // retry counter.
        let retries = scheduler.list(Some(ScheduleStatus::Pending), Some(ScheduleKind::Delayed));
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].retry_count, 1);
        let delay = retries[0].next_run - Utc::now();
        assert!(delay > TimeDelta::seconds(100) && delay <= TimeDelta::seconds(121));
    }

    #[tokio::test]
    async fn test_concurrency_cap_of_one_serializes_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(
            dir.path().join("backups"),
            RetentionPolicy::keep_everything(),
        )
        .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(store)));
        let scheduler = Scheduler::new(orchestrator, 1, None).unwrap();

        scheduler
            .schedule_immediate(local_config(dir.path()), ScheduleOptions::default())
            .unwrap();
        scheduler
            .schedule_immediate(local_config(dir.path()), ScheduleOptions::default())
            .unwrap();

        scheduler.tick().await.unwrap();
        // With a cap of one, at most one task executes at a time.
        assert!(scheduler.executing.lock().unwrap().len() <= 1);

        for _ in 0..200 {
            scheduler.tick().await.unwrap();
            assert!(scheduler.executing.lock().unwrap().len() <= 1);
            if scheduler
                .list(None, None)
                .iter()
                .all(|s| s.status.is_terminal())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_persistence_roundtrip_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let first = scheduler(dir.path(), true);
        let id = first
            .schedule_cron(
                MigrationConfig::minimal("persisted"),
                "0 3 * * 0",
                Some(Utc::now() + TimeDelta::days(90)),
                ScheduleOptions::default(),
            )
            .unwrap();
        let original = first.get(&id).unwrap();

        // Reload into a fresh scheduler; the record round-trips exactly.
        let second = scheduler(dir.path(), true);
        let reloaded = second.get(&id).unwrap();
        assert_eq!(reloaded, original);

        // Saving again produces byte-identical serialization of the record.
        let before = serde_json::to_string(&original).unwrap();
        let after = serde_json::to_string(&reloaded).unwrap();
        assert_eq!(before, after);
        assert!(path.exists());
    }

    #[test]
    fn test_cancel_pending_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let id = scheduler
            .schedule_delayed(
                MigrationConfig::minimal("later"),
                Utc::now() + TimeDelta::hours(4),
                ScheduleOptions::default(),
            )
            .unwrap();

        assert!(scheduler.cancel_schedule(&id));
        assert_eq!(
            scheduler.get(&id).unwrap().status,
            ScheduleStatus::Cancelled
        );
        // Terminal schedules cannot be cancelled again.
        assert!(!scheduler.cancel_schedule(&id));
    }

    #[test]
    fn test_cleanup_old_removes_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);
        let id = scheduler
            .schedule_immediate(MigrationConfig::minimal("old"), ScheduleOptions::default())
            .unwrap();
        {
            let mut schedules = scheduler.schedules.lock().unwrap();
            let schedule = schedules.get_mut(&id).unwrap();
            schedule.status = ScheduleStatus::Completed;
            schedule.completed_at = Some(Utc::now() - TimeDelta::days(45));
        }

        assert_eq!(scheduler.cleanup_old(30), 1);
        assert!(scheduler.get(&id).is_none());
    }
}
