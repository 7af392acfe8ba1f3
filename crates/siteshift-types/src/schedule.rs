//! Scheduled migration records.
//!
//! A [`ScheduledMigration`] is owned by the scheduler from creation to
//! terminal status. The serialized form must round-trip exactly: the
//! scheduler persists its whole schedule map as a JSON object mapping
//! id → record on every mutation, and reloads it on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MigrationConfig;
use crate::options::ScheduleOptions;

/// The timing discipline of a scheduled migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Immediate,
    Delayed,
    Cron,
    Recurring,
}

/// Status of a scheduled migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed
                | ScheduleStatus::Failed
                | ScheduleStatus::Cancelled
                | ScheduleStatus::Skipped
        )
    }
}

/// A migration queued for execution at some point in time.
///
/// Invariants:
/// - When `status` is pending and `next_run` has passed, the scheduler
///   must enqueue the record on its next control-loop tick.
/// - For cron and recurring schedules, dispatching one instance
///   atomically inserts the pending successor unless `recurrence_end`
///   has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMigration {
    pub id: String,
    pub config: MigrationConfig,
    pub kind: ScheduleKind,
    /// When this instance becomes due.
    pub next_run: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Session created for this instance, set on dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    /// Fixed interval between recurring runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_interval_secs: Option<u64>,
    /// No successors are scheduled past this point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: ScheduleOptions,
}

fn default_max_retries() -> u32 {
    3
}

impl ScheduledMigration {
    pub fn new(
        id: impl Into<String>,
        config: MigrationConfig,
        kind: ScheduleKind,
        next_run: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Self {
        let max_retries = options.max_retries;
        ScheduledMigration {
            id: id.into(),
            config,
            kind,
            next_run,
            status: ScheduleStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            session_id: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            cron_expression: None,
            recurrence_interval_secs: None,
            recurrence_end: None,
            options,
        }
    }

    /// Whether this record is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.next_run <= now
    }

    /// Whether the recurrence window still allows a successor at `at`.
    pub fn recurrence_allows(&self, at: DateTime<Utc>) -> bool {
        match self.recurrence_end {
            Some(end) => at <= end,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn schedule(kind: ScheduleKind) -> ScheduledMigration {
        ScheduledMigration::new(
            "sched-1",
            MigrationConfig::minimal("nightly"),
            kind,
            Utc::now(),
            ScheduleOptions::default(),
        )
    }

    #[test]
    fn test_is_due_requires_pending_status() {
        let mut s = schedule(ScheduleKind::Immediate);
        let now = Utc::now() + TimeDelta::seconds(1);
        assert!(s.is_due(now));
        s.status = ScheduleStatus::Running;
        assert!(!s.is_due(now));
    }

    #[test]
    fn test_recurrence_window() {
        let mut s = schedule(ScheduleKind::Cron);
        assert!(s.recurrence_allows(Utc::now() + TimeDelta::days(365)));
        s.recurrence_end = Some(Utc::now());
        assert!(!s.recurrence_allows(Utc::now() + TimeDelta::hours(1)));
    }

    #[test]
    fn test_persistence_roundtrip_is_exact() {
        let mut s = schedule(ScheduleKind::Cron);
        s.cron_expression = Some("0 2 * * *".to_string());
        s.recurrence_end = Some(Utc::now() + TimeDelta::days(30));
        s.session_id = Some("sess-9".to_string());
        s.retry_count = 2;

        let first = serde_json::to_string(&s).unwrap();
        let parsed: ScheduledMigration = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(parsed, s);
    }

    #[test]
    fn test_status_terminality() {
        assert!(ScheduleStatus::Completed.is_terminal());
        assert!(ScheduleStatus::Skipped.is_terminal());
        assert!(!ScheduleStatus::Pending.is_terminal());
        assert!(!ScheduleStatus::Running.is_terminal());
    }
}
