//! Rollback engine.
//!
//! Builds a plan from a session's artifact set (one step per artifact,
//! newest artifact reversed first) and executes it by routing each
//! artifact back through the backup strategy its kind tag selects.
//! Rollback never observes cancellation on a step already started; a
//! cancel request fails the in-flight step at the next step boundary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::{
    Artifact, ArtifactKind, DatabaseConfig, EngineFamily, LogEntry, LogLevel, MigrationConfig,
    MigrationSession, RestoreOptions, RollbackOptions,
};

use crate::error::{Error, Result};
use crate::recovery::{RecoveryValidator, ValidationOutcome};
use crate::strategy::strategy_for_artifact;

/// Directory prefix for rollback scratch space; cleanup only ever
/// removes paths underneath it.
pub const ROLLBACK_SCRATCH_PREFIX: &str = "siteshift_rollback";

/// Bytes per second assumed when estimating restore duration.
const ESTIMATED_RESTORE_RATE: u64 = 50 * 1024 * 1024;
/// Fixed per-artifact overhead in seconds.
const PER_ARTIFACT_OVERHEAD_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub step_id: String,
    pub description: String,
    pub artifact: Artifact,
    pub status: RollbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl RollbackStep {
    fn start(&mut self) {
        self.status = RollbackStatus::InProgress;
        self.start_time = Some(Utc::now());
    }

    fn complete(&mut self) {
        self.status = RollbackStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = RollbackStatus::Failed;
        self.end_time = Some(Utc::now());
        self.error = Some(error.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub session_id: String,
    pub steps: Vec<RollbackStep>,
    pub status: RollbackStatus,
    pub created_at: DateTime<Utc>,
    pub estimated_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub progress_percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

impl RollbackPlan {
    pub fn progress(&self) -> RollbackProgress {
        let total = self.steps.len();
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == RollbackStatus::Completed)
            .count();
        let failed = self
            .steps
            .iter()
            .filter(|s| s.status == RollbackStatus::Failed)
            .count();
        RollbackProgress {
            total_steps: total,
            completed_steps: completed,
            failed_steps: failed,
            progress_percentage: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            current_step: self
                .steps
                .iter()
                .find(|s| s.status == RollbackStatus::InProgress)
                .map(|s| s.description.clone()),
        }
    }

    /// Ids of artifacts whose step failed.
    pub fn failed_artifacts(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == RollbackStatus::Failed)
            .map(|s| s.artifact.id.clone())
            .collect()
    }
}

/// Manual recovery guidance for scenarios where automatic rollback is
/// impossible or partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackGuidance {
    pub session_id: String,
    pub automatic_rollback_possible: bool,
    pub prerequisites: Vec<String>,
    pub manual_steps: Vec<String>,
    pub warnings: Vec<String>,
    pub estimated_complexity: GuidanceComplexity,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceComplexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStatistics {
    pub total_rollbacks: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub average_steps: f64,
    pub success_rate: f64,
    pub generated_at: DateTime<Utc>,
}

pub struct RollbackEngine {
    validator: Arc<RecoveryValidator>,
    plans: Mutex<HashMap<String, RollbackPlan>>,
    cancel_requests: Mutex<HashSet<String>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl Default for RollbackEngine {
    fn default() -> Self {
        Self::new(Arc::new(RecoveryValidator::new()))
    }
}

impl RollbackEngine {
    pub fn new(validator: Arc<RecoveryValidator>) -> Self {
        RollbackEngine {
            validator,
            plans: Mutex::new(HashMap::new()),
            cancel_requests: Mutex::new(HashSet::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, level: LogLevel, message: String, session_id: &str) {
        let entry = LogEntry::new(level, message)
            .with_component("RollbackEngine")
            .with_detail("session_id", serde_json::json!(session_id));
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(entry);
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Build a plan from the session's artifacts: newest first, ordered
    /// by the monotonic artifact sequence with creation time as the
    /// tiebreaker for artifacts rehydrated from persistence.
    pub fn create_plan(&self, session: &MigrationSession) -> Result<RollbackPlan> {
        self.log(
            LogLevel::Info,
            "creating rollback plan".to_string(),
            &session.id,
        );

        let mut artifacts = session.artifacts.clone();
        artifacts.sort_by(|a, b| {
            b.sequence
                .cmp(&a.sequence)
                .then(b.created_at.cmp(&a.created_at))
        });

        let steps: Vec<RollbackStep> = artifacts
            .iter()
            .enumerate()
            .map(|(idx, artifact)| RollbackStep {
                step_id: format!("rollback_step_{}", idx + 1),
                description: format!(
                    "Restore {} backup ({})",
                    artifact.kind,
                    &artifact.id[..artifact.id.len().min(8)]
                ),
                artifact: artifact.clone(),
                status: RollbackStatus::Pending,
                start_time: None,
                end_time: None,
                error: None,
                details: BTreeMap::new(),
            })
            .collect();

        let total_bytes: u64 = artifacts.iter().map(|a| a.size).sum();
        let estimated_duration_secs = (total_bytes / ESTIMATED_RESTORE_RATE).max(30)
            + PER_ARTIFACT_OVERHEAD_SECS * artifacts.len() as u64;

        let plan = RollbackPlan {
            session_id: session.id.clone(),
            steps,
            status: RollbackStatus::Pending,
            created_at: Utc::now(),
            estimated_duration_secs,
        };

        self.plans
            .lock()
            .map_err(|_| Error::rollback("rollback plan registry poisoned"))?
            .insert(session.id.clone(), plan.clone());

        self.log(
            LogLevel::Info,
            format!("rollback plan created with {} steps", plan.steps.len()),
            &session.id,
        );
        Ok(plan)
    }

    /// Validate every artifact the plan would restore from.
    pub async fn validate_readiness(
        &self,
        session: &MigrationSession,
    ) -> Result<BTreeMap<String, ValidationOutcome>> {
        if session.artifacts.is_empty() {
            return Err(Error::rollback("no backups available for rollback"));
        }
        let outcomes = Arc::clone(&self.validator)
            .validate_many(session.artifacts.clone())
            .await;
        let failures: Vec<&String> = outcomes
            .iter()
            .filter(|(_, o)| !o.is_valid)
            .map(|(id, _)| id)
            .collect();
        if !failures.is_empty() {
            self.log(
                LogLevel::Warning,
                format!("backup validation failures detected: {failures:?}"),
                &session.id,
            );
        }
        Ok(outcomes)
    }

    /// Execute the rollback for `session`.
    pub async fn execute(
        &self,
        session: &MigrationSession,
        options: &RollbackOptions,
    ) -> Result<RollbackPlan> {
        self.log(
            LogLevel::Info,
            "starting rollback execution".to_string(),
            &session.id,
        );

        let mut plan = match self.get_plan(&session.id) {
            Some(plan) if plan.status == RollbackStatus::Pending => plan,
            _ => self.create_plan(session)?,
        };
        plan.status = RollbackStatus::InProgress;
        self.store_plan(&plan)?;

        if !options.skip_validation {
            let outcomes = self.validate_readiness(session).await?;
            let failures: Vec<String> = outcomes
                .iter()
                .filter(|(_, o)| !o.is_valid)
                .map(|(id, _)| id.clone())
                .collect();
            if !failures.is_empty() && !options.force_rollback {
                plan.status = RollbackStatus::Failed;
                self.store_plan(&plan)?;
                return Err(Error::rollback(format!(
                    "cannot proceed with rollback due to backup validation failures: {failures:?}"
                )));
            }
        }

        let mut successful = 0usize;
        let mut failed = 0usize;

        for idx in 0..plan.steps.len() {
            if self.cancel_requested(&session.id) {
                plan.steps[idx].fail("rollback cancelled by user");
                plan.status = RollbackStatus::Failed;
                self.store_plan(&plan)?;
                self.log(LogLevel::Info, "rollback cancelled".to_string(), &session.id);
                return Ok(plan);
            }

            plan.steps[idx].start();
            self.store_plan(&plan)?;
            self.log(
                LogLevel::Info,
                format!("executing rollback step: {}", plan.steps[idx].description),
                &session.id,
            );

            match self
                .execute_step(&session.id, &session.config, &plan.steps[idx].artifact, options)
                .await
            {
                Ok(details) => {
                    plan.steps[idx].details.extend(details);
                    plan.steps[idx].complete();
                    successful += 1;
                    self.log(
                        LogLevel::Info,
                        format!("rollback step completed: {}", plan.steps[idx].description),
                        &session.id,
                    );
                }
                Err(e) => {
                    plan.steps[idx].fail(e.to_string());
                    failed += 1;
                    self.log(
                        LogLevel::Error,
                        format!(
                            "rollback step failed: {} - {e}",
                            plan.steps[idx].description
                        ),
                        &session.id,
                    );
                    if !options.continue_on_failure {
                        break;
                    }
                }
            }
            self.store_plan(&plan)?;
        }

        plan.status = if failed == 0 {
            self.log(
                LogLevel::Info,
                "rollback completed successfully".to_string(),
                &session.id,
            );
            RollbackStatus::Completed
        } else if successful > 0 {
            self.log(
                LogLevel::Warning,
                format!("rollback partially completed: {successful} successful, {failed} failed"),
                &session.id,
            );
            RollbackStatus::Partial
        } else {
            self.log(
                LogLevel::Error,
                "rollback failed completely".to_string(),
                &session.id,
            );
            RollbackStatus::Failed
        };
        self.store_plan(&plan)?;
        Ok(plan)
    }

    async fn execute_step(
        &self,
        session_id: &str,
        config: &MigrationConfig,
        artifact: &Artifact,
        options: &RollbackOptions,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let target = self.restore_target(session_id, artifact, options);
        // Backups restore toward the source side; only the labels and
        // connection settings matter for strategy routing.
        let system = config.source.clone();
        let db = choose_db_config(config, artifact).cloned();
        let artifact = artifact.clone();
        let restore_options = RestoreOptions::default();
        let target_clone = target.clone();

        let restored = tokio::task::spawn_blocking(move || -> Result<bool> {
            let strategy = strategy_for_artifact(&artifact, &system, db.as_ref())?;
            strategy.restore(&artifact, &target_clone, &restore_options)
        })
        .await
        .map_err(|e| Error::rollback(format!("restore task panicked: {e}")))??;

        if !restored {
            return Err(Error::rollback("restore reported failure"));
        }

        let mut details = BTreeMap::new();
        details.insert(
            "restore_location".to_string(),
            serde_json::json!(target.display().to_string()),
        );
        Ok(details)
    }

    fn restore_target(
        &self,
        session_id: &str,
        artifact: &Artifact,
        options: &RollbackOptions,
    ) -> PathBuf {
        let default_scratch = |leaf: &str| {
            std::env::temp_dir()
                .join(ROLLBACK_SCRATCH_PREFIX)
                .join(session_id)
                .join(leaf)
        };
        match artifact.kind {
            ArtifactKind::FileArchive => options
                .file_restore_location
                .clone()
                .unwrap_or_else(|| default_scratch("files")),
            ArtifactKind::Configuration => options
                .config_restore_location
                .clone()
                .unwrap_or_else(|| default_scratch("config")),
            _ => default_scratch(artifact.kind.tag()),
        }
    }

    /// Request cancellation; the in-flight step completes or fails on
    /// its own, and the next step boundary observes the request.
    pub fn cancel(&self, session_id: &str) -> bool {
        let known = self
            .plans
            .lock()
            .map(|p| {
                p.get(session_id)
                    .is_some_and(|plan| plan.status == RollbackStatus::InProgress)
            })
            .unwrap_or(false);
        if !known {
            return false;
        }
        if let Ok(mut requests) = self.cancel_requests.lock() {
            requests.insert(session_id.to_string());
        }
        true
    }

    fn cancel_requested(&self, session_id: &str) -> bool {
        self.cancel_requests
            .lock()
            .map(|r| r.contains(session_id))
            .unwrap_or(false)
    }

    /// Remove scratch directories created under the well-known prefix
    /// and de-register the plan.
    pub fn cleanup(&self, session_id: &str) -> Result<bool> {
        let existed = self
            .plans
            .lock()
            .map_err(|_| Error::rollback("rollback plan registry poisoned"))?
            .remove(session_id)
            .is_some();
        if let Ok(mut requests) = self.cancel_requests.lock() {
            requests.remove(session_id);
        }

        let scratch = std::env::temp_dir()
            .join(ROLLBACK_SCRATCH_PREFIX)
            .join(session_id);
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch).map_err(|e| {
                Error::rollback(format!("cannot remove {}: {e}", scratch.display()))
            })?;
        }

        if existed {
            self.log(
                LogLevel::Info,
                "rollback artifacts cleaned up".to_string(),
                session_id,
            );
        }
        Ok(existed)
    }

    pub fn get_plan(&self, session_id: &str) -> Option<RollbackPlan> {
        self.plans.lock().ok()?.get(session_id).cloned()
    }

    fn store_plan(&self, plan: &RollbackPlan) -> Result<()> {
        self.plans
            .lock()
            .map_err(|_| Error::rollback("rollback plan registry poisoned"))?
            .insert(plan.session_id.clone(), plan.clone());
        Ok(())
    }

    /// Generate manual recovery guidance keyed to the artifact kinds
    /// present and any known validation failures.
    pub fn guidance(
        &self,
        session: &MigrationSession,
        validation: Option<&BTreeMap<String, ValidationOutcome>>,
    ) -> RollbackGuidance {
        let mut guidance = RollbackGuidance {
            session_id: session.id.clone(),
            automatic_rollback_possible: true,
            prerequisites: Vec::new(),
            manual_steps: Vec::new(),
            warnings: Vec::new(),
            estimated_complexity: GuidanceComplexity::Low,
            generated_at: Utc::now(),
        };

        if session.artifacts.is_empty() {
            guidance.automatic_rollback_possible = false;
            guidance
                .manual_steps
                .push("no backups available - manual system restoration required".to_string());
            guidance.estimated_complexity = GuidanceComplexity::High;
        }

        if let Some(validation) = validation {
            let failed: Vec<&String> = validation
                .iter()
                .filter(|(_, o)| !o.is_valid)
                .map(|(id, _)| id)
                .collect();
            if !failed.is_empty() {
                guidance
                    .warnings
                    .push(format!("backup validation failed for: {failed:?}"));
                guidance.estimated_complexity =
                    guidance.estimated_complexity.max(GuidanceComplexity::Medium);
            }
        }

        let kinds: HashSet<ArtifactKind> =
            session.artifacts.iter().map(|a| a.kind).collect();

        if kinds.contains(&ArtifactKind::DatabaseDump) || kinds.contains(&ArtifactKind::KeyValueDump)
        {
            guidance
                .prerequisites
                .push("ensure the database server is running and accessible".to_string());
            guidance
                .manual_steps
                .push("verify database credentials and permissions".to_string());
        }
        if kinds.contains(&ArtifactKind::FileArchive) {
            guidance
                .prerequisites
                .push("ensure sufficient disk space for file restoration".to_string());
            guidance
                .manual_steps
                .push("stop application services before file restoration".to_string());
        }
        if kinds.contains(&ArtifactKind::CloudResources) {
            guidance.manual_steps.push(
                "cloud resource rollback requires manual intervention using cloud provider tools"
                    .to_string(),
            );
            guidance.estimated_complexity = GuidanceComplexity::High;
        }

        guidance.manual_steps.extend([
            "create a snapshot of the current system state before rollback".to_string(),
            "notify users about potential service interruption".to_string(),
            "test restored system functionality after rollback".to_string(),
        ]);

        guidance
    }

    pub fn statistics(&self) -> RollbackStatistics {
        let plans = self.plans.lock().map(|p| p.clone()).unwrap_or_default();
        let total = plans.len();
        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_steps = 0usize;
        let mut successful = 0usize;

        for plan in plans.values() {
            let tag = format!("{:?}", plan.status).to_lowercase();
            *status_counts.entry(tag).or_default() += 1;
            total_steps += plan.steps.len();
            if plan.status == RollbackStatus::Completed {
                successful += 1;
            }
        }

        RollbackStatistics {
            total_rollbacks: total,
            status_counts,
            average_steps: if total > 0 {
                total_steps as f64 / total as f64
            } else {
                0.0
            },
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            generated_at: Utc::now(),
        }
    }
}

/// The database settings a dump artifact should be restored through:
/// the configured endpoint whose family matches the artifact's recorded
/// engine family, preferring the source side.
fn choose_db_config<'a>(
    config: &'a MigrationConfig,
    artifact: &Artifact,
) -> Option<&'a DatabaseConfig> {
    let family = artifact
        .database_family()
        .and_then(EngineFamily::parse_tag)
        .map(|f| f.base());
    let matches = |candidate: &&DatabaseConfig| match family {
        Some(family) => candidate.family.base() == family,
        None => true,
    };
    config
        .source_database
        .as_ref()
        .filter(matches)
        .or(config.destination_database.as_ref().filter(matches))
        .or(config.source_database.as_ref())
        .or(config.destination_database.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::BackupStrategy;
    use siteshift_types::{BackupOptions, SystemConfig, SystemKind};
    use std::path::Path;

    fn system() -> SystemConfig {
        SystemConfig {
            kind: SystemKind::StaticSite,
            host: "web.example.com".to_string(),
            port: None,
            document_root: None,
            cloud: None,
        }
    }

    fn session_with_artifacts(dir: &Path, count: usize) -> MigrationSession {
        let mut config = MigrationConfig::minimal("rollback-test");
        config.source = system();
        let mut session = MigrationSession::new("sess-rb", config);
        let strategy = crate::strategy::ConfigSnapshotStrategy::new(system());
        for i in 0..count {
            let artifact = strategy
                .create(&format!("artifact-{i}"), &dir.join("backups"), &BackupOptions::default())
                .unwrap();
            session.add_artifact(artifact);
        }
        session
    }

    #[test]
    fn test_plan_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 3);
        let engine = RollbackEngine::default();
        let plan = engine.create_plan(&session).unwrap();

        assert_eq!(plan.steps.len(), 3);
        let sequences: Vec<u64> = plan.steps.iter().map(|s| s.artifact.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sequences, sorted);
        assert_eq!(plan.steps[0].artifact.id, "artifact-2");
        assert_eq!(plan.steps[2].artifact.id, "artifact-0");
    }

    #[test]
    fn test_duration_estimate_formula() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 2);
        let engine = RollbackEngine::default();
        let plan = engine.create_plan(&session).unwrap();
        // Small artifacts: base floor 30s plus 10s per artifact.
        assert_eq!(plan.estimated_duration_secs, 30 + 20);
    }

    #[tokio::test]
    async fn test_execute_restores_all_steps() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 2);
        let engine = RollbackEngine::default();

        let options = RollbackOptions {
            file_restore_location: Some(dir.path().join("restored_files")),
            config_restore_location: Some(dir.path().join("restored_config")),
            ..Default::default()
        };
        let plan = engine.execute(&session, &options).await.unwrap();
        assert_eq!(plan.status, RollbackStatus::Completed);
        assert!(
            plan.steps
                .iter()
                .all(|s| s.status == RollbackStatus::Completed)
        );
        assert_eq!(plan.progress().progress_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_aborts_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with_artifacts(dir.path(), 2);
        // Corrupt the second artifact's bytes on disk.
        std::fs::write(&session.artifacts[1].location, b"garbage").unwrap();
        session.artifacts[1].id = "corrupt".to_string();

        let engine = RollbackEngine::default();
        let err = engine
            .execute(&session, &RollbackOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rollback(_)));
        assert!(err.to_string().contains("corrupt"));

        // No step executed.
        let plan = engine.get_plan(&session.id).unwrap();
        assert_eq!(plan.status, RollbackStatus::Failed);
        assert!(plan.steps.iter().all(|s| s.start_time.is_none()));
    }

    #[tokio::test]
    async fn test_force_rollback_yields_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with_artifacts(dir.path(), 2);
        std::fs::write(&session.artifacts[0].location, b"garbage").unwrap();

        let engine = RollbackEngine::default();
        let options = RollbackOptions {
            force_rollback: true,
            continue_on_failure: true,
            config_restore_location: Some(dir.path().join("restored")),
            ..Default::default()
        };
        let plan = engine.execute(&session, &options).await.unwrap();
        assert_eq!(plan.status, RollbackStatus::Partial);
        let failed = plan.failed_artifacts();
        assert_eq!(failed, vec!["artifact-0".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_at_first_failure_without_continue() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with_artifacts(dir.path(), 3);
        // Newest artifact (restored first) is broken.
        std::fs::write(&session.artifacts[2].location, b"garbage").unwrap();

        let engine = RollbackEngine::default();
        let options = RollbackOptions {
            force_rollback: true,
            ..Default::default()
        };
        let plan = engine.execute(&session, &options).await.unwrap();
        assert_eq!(plan.status, RollbackStatus::Failed);
        assert_eq!(plan.steps[0].status, RollbackStatus::Failed);
        assert_eq!(plan.steps[1].status, RollbackStatus::Pending);
        assert_eq!(plan.steps[2].status, RollbackStatus::Pending);
    }

    #[test]
    fn test_guidance_for_cloud_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with_artifacts(dir.path(), 1);
        session.artifacts[0].kind = ArtifactKind::CloudResources;

        let engine = RollbackEngine::default();
        let guidance = engine.guidance(&session, None);
        assert!(guidance.automatic_rollback_possible);
        assert_eq!(guidance.estimated_complexity, GuidanceComplexity::High);
        assert!(
            guidance
                .manual_steps
                .iter()
                .any(|s| s.contains("cloud provider tools"))
        );
    }

    #[test]
    fn test_guidance_without_backups() {
        let config = MigrationConfig::minimal("empty");
        let session = MigrationSession::new("no-backups", config);
        let engine = RollbackEngine::default();
        let guidance = engine.guidance(&session, None);
        assert!(!guidance.automatic_rollback_possible);
        assert_eq!(guidance.estimated_complexity, GuidanceComplexity::High);
    }

    #[test]
    fn test_guidance_names_failed_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 1);
        let mut outcome = BTreeMap::new();
        let mut failed = crate::recovery::RecoveryValidator::new().validate(&session.artifacts[0]);
        failed.is_valid = false;
        outcome.insert("artifact-0".to_string(), failed);

        let engine = RollbackEngine::default();
        let guidance = engine.guidance(&session, Some(&outcome));
        assert!(guidance.warnings[0].contains("artifact-0"));
        assert_eq!(guidance.estimated_complexity, GuidanceComplexity::Medium);
    }

    #[tokio::test]
    async fn test_cleanup_deregisters_and_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 1);
        let engine = RollbackEngine::default();
        engine
            .execute(&session, &RollbackOptions::default())
            .await
            .unwrap();

        let scratch = std::env::temp_dir()
            .join(ROLLBACK_SCRATCH_PREFIX)
            .join(&session.id);
        assert!(scratch.exists());
        assert!(engine.cleanup(&session.id).unwrap());
        assert!(!scratch.exists());
        assert!(engine.get_plan(&session.id).is_none());
        assert!(!engine.cleanup(&session.id).unwrap());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_artifacts(dir.path(), 2);
        let engine = RollbackEngine::default();
        let options = RollbackOptions {
            config_restore_location: Some(dir.path().join("restored")),
            ..Default::default()
        };
        engine.execute(&session, &options).await.unwrap();

        let stats = engine.statistics();
        assert_eq!(stats.total_rollbacks, 1);
        assert_eq!(stats.average_steps, 2.0);
        assert_eq!(stats.success_rate, 100.0);
        assert_eq!(stats.status_counts["completed"], 1);
    }
}
