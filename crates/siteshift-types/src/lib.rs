//! # Types
//!
//! Core domain types for siteshift: migration sessions, steps, backup
//! artifacts, scheduled migrations, and the typed option records the
//! engines accept.
//!
//! This module defines the fundamental data structures used throughout
//! siteshift:
//! - [`MigrationSession`] - A single migration attempt and its evolving step graph
//! - [`MigrationStep`] - An atomic unit of work with declared dependencies
//! - [`Artifact`] - A durable, checksummed backup sufficient to restore its source
//! - [`ScheduledMigration`] - A queued migration with immediate/delayed/cron/recurring timing
//! - [`MigrationConfig`] - The frozen configuration snapshot a session is created from
//!
//! ## Serialization
//!
//! Every type here implements `Serialize` and `Deserialize` from `serde`
//! for persistence to disk. Timestamps are `chrono::DateTime<Utc>` and
//! serialize as ISO-8601 UTC strings; enums serialize as snake_case
//! string tags. The scheduler persistence format round-trips
//! [`ScheduledMigration`] exactly.
//!
//! ## Stability
//!
//! These types are considered stable unless otherwise noted. Breaking
//! changes will be documented in the changelog.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod config;
pub mod options;
pub mod schedule;

pub use config::{
    CloudConfig, DatabaseConfig, EngineFamily, MigrationConfig, SystemConfig, SystemKind,
    TransferConfig, TransferMethod, ValidationLevel,
};
pub use options::{
    BackupOptions, MaintenanceOptions, RestoreOptions, RollbackOptions, ScheduleOptions,
};
pub use schedule::{ScheduleKind, ScheduleStatus, ScheduledMigration};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Status of a migration session.
///
/// A session's status moves monotonically through the legal transition
/// graph; terminal statuses are never left. See
/// [`SessionStatus::can_transition_to`].
///
/// # State Transitions
///
/// ```text
/// Pending → Validating → Running → Completed
///                           │   ↘
///                        Paused  Failed ─→ RolledBack
///                           │      ↑
///                           └→ Cancelled ─→ RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Validating,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl SessionStatus {
    /// Whether this status is terminal. Terminal sessions never change
    /// status again, with the single exception that `Failed` and
    /// `Cancelled` may move to `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::RolledBack
        )
    }

    /// Check whether the transition graph permits moving to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Validating) | (Pending, Running) | (Pending, Cancelled) => true,
            (Validating, Running) | (Validating, Failed) | (Validating, Cancelled) => true,
            (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled) => true,
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            (Failed, RolledBack) | (Cancelled, RolledBack) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Validating => "validating",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::RolledBack => "rolled_back",
        };
        f.write_str(tag)
    }
}

/// Status of an individual migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// A step counts as satisfied for dependency purposes when it
    /// completed or was deliberately skipped.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// Log entry levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Severity attached to an [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured log entry kept on sessions, steps, and the long-lived
/// components (scheduler, rollback engine, maintenance controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            component: None,
            step_id: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Error record for failed operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediation_steps: Vec<String>,
    #[serde(default)]
    pub retry_possible: bool,
    #[serde(default)]
    pub rollback_required: bool,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: ErrorSeverity) -> Self {
        ErrorInfo {
            code: code.into(),
            message: message.into(),
            severity,
            component: None,
            step_id: None,
            timestamp: Utc::now(),
            remediation_steps: Vec::new(),
            retry_possible: false,
            rollback_required: false,
        }
    }
}

/// Progress counter for sessions and steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    #[serde(default)]
    pub unit: String,
}

impl ProgressInfo {
    pub fn update(&mut self, current: u64, total: Option<u64>) {
        self.current = current;
        if let Some(total) = total {
            self.total = total;
        }
        self.percentage = if self.total > 0 {
            (self.current as f64 / self.total as f64) * 100.0
        } else {
            0.0
        };
    }
}

/// The kind tag discriminating backup artifacts.
///
/// The tag value doubles as the artifact store's directory name, e.g.
/// `<root>/file_archive/<source_label>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    FileArchive,
    DatabaseDump,
    KeyValueDump,
    Configuration,
    CloudResources,
}

impl ArtifactKind {
    /// Directory name / serialized tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            ArtifactKind::FileArchive => "file_archive",
            ArtifactKind::DatabaseDump => "database_dump",
            ArtifactKind::KeyValueDump => "key_value_dump",
            ArtifactKind::Configuration => "configuration",
            ArtifactKind::CloudResources => "cloud_resources",
        }
    }

    /// Backup filename family per the `<family>_<id>_<timestamp>.<ext>`
    /// convention.
    pub fn family(&self) -> &'static str {
        match self {
            ArtifactKind::FileArchive => "files",
            ArtifactKind::DatabaseDump | ArtifactKind::KeyValueDump => "db",
            ArtifactKind::Configuration => "config",
            ArtifactKind::CloudResources => "cloud",
        }
    }

    pub fn parse_tag(tag: &str) -> Option<ArtifactKind> {
        match tag {
            "file_archive" => Some(ArtifactKind::FileArchive),
            "database_dump" => Some(ArtifactKind::DatabaseDump),
            "key_value_dump" => Some(ArtifactKind::KeyValueDump),
            "configuration" => Some(ArtifactKind::Configuration),
            "cloud_resources" => Some(ArtifactKind::CloudResources),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A durable, checksummed backup artifact.
///
/// Once written, `location`, `size`, and `checksum` are immutable.
/// Artifacts carry enough metadata ([`Artifact::metadata`], notably
/// `database_type` for dumps) to reconstruct the strategy that produced
/// them; they do not own one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    /// Label of the system this artifact was taken from (used as the
    /// second path component in the artifact store).
    pub source_system: String,
    pub location: PathBuf,
    pub size: u64,
    /// Hex-encoded SHA-256 of the artifact file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Process-wide monotonic sequence number; the primary rollback
    /// ordering key, immune to wall-clock skew.
    #[serde(default)]
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compression_used: bool,
    #[serde(default)]
    pub encryption_used: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Artifact {
    /// Engine family recorded for dump artifacts, if any.
    pub fn database_family(&self) -> Option<&str> {
        self.metadata.get("database_type").and_then(|v| v.as_str())
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.verification_date = Some(Utc::now());
    }
}

/// Report kinds produced during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Validation,
    Progress,
    Summary,
    Error,
}

/// Pointer to a generated report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportInfo {
    pub id: String,
    pub kind: ReportKind,
    pub title: String,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, serde_json::Value>,
}

/// An atomic unit of work within a session.
///
/// A step may start only when every id in `dependencies` refers to a
/// step whose status satisfies the dependency (completed or skipped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end once both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub progress: ProgressInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MigrationStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        MigrationStep {
            id: id.into(),
            name: name.into(),
            description: None,
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_secs: None,
            progress: ProgressInfo::default(),
            logs: Vec::new(),
            error: None,
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.finish();
    }

    pub fn fail(&mut self, error: ErrorInfo) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.finish();
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
    }

    pub fn cancel(&mut self) {
        self.status = StepStatus::Cancelled;
        self.finish();
    }

    fn finish(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        if let Some(start) = self.start_time {
            self.duration_secs = Some((end - start).num_milliseconds() as f64 / 1000.0);
        }
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .push(LogEntry::new(level, message).with_step(self.id.clone()));
    }
}

/// Aggregated pre-flight validation outcome recorded on the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub passed: bool,
    pub checks_performed: u32,
    pub checks_passed: u32,
    pub checks_failed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    /// Whether the orchestrator may proceed into destructive phases.
    pub can_proceed: bool,
}

/// A single migration attempt: a frozen configuration plus its evolving
/// step graph and outcomes.
///
/// The orchestrator exclusively mutates the session while it is active;
/// `get_status` returns clones safe for concurrent readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: String,
    pub config: MigrationConfig,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub steps: Vec<MigrationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub progress: ProgressInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<ReportInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl MigrationSession {
    pub fn new(id: impl Into<String>, config: MigrationConfig) -> Self {
        let now = Utc::now();
        MigrationSession {
            id: id.into(),
            config,
            status: SessionStatus::Pending,
            start_time: None,
            end_time: None,
            duration_secs: None,
            steps: Vec::new(),
            current_step: None,
            progress: ProgressInfo::default(),
            logs: Vec::new(),
            artifacts: Vec::new(),
            reports: Vec::new(),
            validation: None,
            error: None,
            created_at: now,
            updated_at: now,
            tenant_id: None,
        }
    }

    /// Transition to `next` if the status graph allows it. Returns
    /// `false` (and leaves the session untouched) otherwise.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        match next {
            SessionStatus::Running if self.start_time.is_none() => {
                self.start_time = Some(Utc::now());
            }
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled => {
                let end = Utc::now();
                self.end_time = Some(end);
                if let Some(start) = self.start_time {
                    self.duration_secs =
                        Some((end - start).num_milliseconds() as f64 / 1000.0);
                }
            }
            _ => {}
        }
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn step(&self, step_id: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut MigrationStep> {
        self.updated_at = Utc::now();
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry::new(level, message));
        self.touch();
    }

    pub fn add_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
        self.touch();
    }

    pub fn add_report(&mut self, report: ReportInfo) {
        self.reports.push(report);
        self.touch();
    }

    /// Overall progress in percent, derived from completed steps.
    pub fn overall_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (done as f64 / self.steps.len() as f64) * 100.0
    }
}
