//! Migration orchestrator.
//!
//! Builds the dependency-ordered step graph for a session and executes
//! it: pre-flight validation, maintenance isolation, typed backups,
//! file and database migration, post-migration verification, and
//! rollback-on-failure. Step execution is topologically layered;
//! dependency-disjoint steps inside a layer may run concurrently up to
//! the configured cap (sequential by default so operator progress
//! output stays deterministic).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use siteshift_types::{
    ErrorInfo, ErrorSeverity, LogLevel, MaintenanceOptions, MigrationConfig, MigrationSession,
    MigrationStep, RollbackOptions, SessionStatus, StepStatus, ValidationSummary,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backup::BackupManager;
use crate::dbengine::{self, DataMigrationSpec};
use crate::error::{Error, Result};
use crate::integrity::DataValidator;
use crate::maintenance::MaintenanceController;
use crate::recovery::RecoveryValidator;
use crate::rollback::{RollbackEngine, RollbackStatus};
use crate::store::ArtifactStore;

pub const STEP_INITIALIZE: &str = "initialize";
pub const STEP_VALIDATE: &str = "validate_pre_migration";
pub const STEP_ENABLE_MAINTENANCE: &str = "enable_maintenance_mode";
pub const STEP_BACKUP_SOURCE: &str = "backup_source";
pub const STEP_BACKUP_DESTINATION: &str = "backup_destination";
pub const STEP_MIGRATE_FILES: &str = "migrate_files";
pub const STEP_MIGRATE_DATABASE: &str = "migrate_database";
pub const STEP_VERIFY: &str = "verify_post_migration";
pub const STEP_DISABLE_MAINTENANCE: &str = "disable_maintenance_mode";
pub const STEP_CLEANUP: &str = "cleanup";

/// Operator-facing progress output.
pub trait Reporter: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Reporter that drops everything; used by scheduled runs without an
/// attached terminal.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}

/// The external pre-flight validation engine boundary.
#[async_trait]
pub trait ValidationEngine: Send + Sync {
    async fn validate(&self, config: &MigrationConfig) -> Result<ValidationSummary>;
}

/// Built-in pre-flight checks: configuration sanity, source tree
/// presence, and external tool availability (missing tools warn at
/// validation time and fail at execution time).
pub struct PreflightValidator;

#[async_trait]
impl ValidationEngine for PreflightValidator {
    async fn validate(&self, config: &MigrationConfig) -> Result<ValidationSummary> {
        fn record(summary: &mut ValidationSummary, ok: bool) {
            summary.checks_performed += 1;
            if ok {
                summary.checks_passed += 1;
            } else {
                summary.checks_failed += 1;
            }
        }

        let mut summary = ValidationSummary::default();

        match config.validate() {
            Ok(()) => record(&mut summary, true),
            Err(message) => {
                record(&mut summary, false);
                summary
                    .errors
                    .push(ErrorInfo::new("config", message, ErrorSeverity::Critical));
            }
        }

        if let Some(document_root) = &config.source.document_root {
            let exists = document_root.exists();
            record(&mut summary, exists);
            if !exists {
                summary.errors.push(ErrorInfo::new(
                    "source_files",
                    format!("source document root does not exist: {}", document_root.display()),
                    ErrorSeverity::High,
                ));
            }
        }

        for db in [&config.source_database, &config.destination_database]
            .into_iter()
            .flatten()
        {
            if let Some(tool) = db.family.dump_tool() {
                let found = crate::process::find_tool(tool).is_some();
                record(&mut summary, found);
                if !found {
                    summary
                        .warnings
                        .push(format!("dump tool '{tool}' not found on PATH"));
                }
            }
            let client = db.family.client_tool();
            let found = crate::process::find_tool(client).is_some();
            record(&mut summary, found);
            if !found {
                summary
                    .warnings
                    .push(format!("client tool '{client}' not found on PATH"));
            }
        }

        summary.passed = summary.errors.is_empty();
        summary.can_proceed = summary.passed;
        Ok(summary)
    }
}

/// The file transfer adapter boundary.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Move the site tree; returns the number of files transferred.
    async fn transfer(&self, config: &MigrationConfig, cancel: &CancellationToken) -> Result<u64>;
}

/// Transfer between two locally mounted document roots. Remote
/// transports plug in behind the same trait.
pub struct LocalFileTransfer;

#[async_trait]
impl FileTransfer for LocalFileTransfer {
    async fn transfer(&self, config: &MigrationConfig, cancel: &CancellationToken) -> Result<u64> {
        let source = config
            .source
            .document_root
            .clone()
            .ok_or_else(|| Error::transfer("source document_root is not configured"))?;
        let destination = config
            .destination
            .document_root
            .clone()
            .ok_or_else(|| Error::transfer("destination document_root is not configured"))?;
        let exclude = config.transfer.exclude_patterns.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || copy_tree(&source, &destination, &exclude, &cancel))
            .await
            .map_err(|e| Error::transfer(format!("file transfer task panicked: {e}")))?
    }
}

fn copy_tree(
    source: &std::path::Path,
    destination: &std::path::Path,
    exclude: &[String],
    cancel: &CancellationToken,
) -> Result<u64> {
    std::fs::create_dir_all(destination)
        .map_err(|e| Error::transfer(format!("cannot create {}: {e}", destination.display())))?;

    let mut copied = 0;
    for entry in std::fs::read_dir(source)
        .map_err(|e| Error::transfer(format!("cannot read {}: {e}", source.display())))?
    {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("file transfer cancelled"));
        }
        let entry = entry.map_err(|e| Error::transfer(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if exclude.iter().any(|pattern| name.contains(pattern)) {
            continue;
        }
        let from = entry.path();
        let to = destination.join(&name);
        if from.is_dir() {
            copied += copy_tree(&from, &to, exclude, cancel)?;
        } else {
            std::fs::copy(&from, &to)
                .map_err(|e| Error::transfer(format!("cannot copy {}: {e}", from.display())))?;
            copied += 1;
        }
    }
    Ok(copied)
}

type SharedSession = Arc<tokio::sync::Mutex<MigrationSession>>;

pub struct Orchestrator {
    backup: Arc<BackupManager>,
    validation: Arc<dyn ValidationEngine>,
    rollback: Arc<RollbackEngine>,
    maintenance: Arc<MaintenanceController>,
    file_transfer: Arc<dyn FileTransfer>,
    data_validator: Arc<DataValidator>,
    sessions: Mutex<HashMap<String, SharedSession>>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        let recovery = Arc::new(RecoveryValidator::new());
        Orchestrator {
            backup: Arc::new(BackupManager::new(store)),
            validation: Arc::new(PreflightValidator),
            rollback: Arc::new(RollbackEngine::new(recovery)),
            maintenance: Arc::new(MaintenanceController::new()),
            file_transfer: Arc::new(LocalFileTransfer),
            data_validator: Arc::new(DataValidator::new()),
            sessions: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validation_engine(mut self, engine: Arc<dyn ValidationEngine>) -> Self {
        self.validation = engine;
        self
    }

    pub fn with_file_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.file_transfer = transfer;
        self
    }

    pub fn with_maintenance(mut self, maintenance: Arc<MaintenanceController>) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn with_rollback_engine(mut self, rollback: Arc<RollbackEngine>) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn backup_manager(&self) -> &Arc<BackupManager> {
        &self.backup
    }

    pub fn maintenance_controller(&self) -> &Arc<MaintenanceController> {
        &self.maintenance
    }

    pub fn rollback_engine(&self) -> &Arc<RollbackEngine> {
        &self.rollback
    }

    /// Create a session from a configuration: freeze the config, build
    /// the step graph, register the session.
    pub fn create_session(&self, config: MigrationConfig) -> Result<MigrationSession> {
        config.validate().map_err(Error::Config)?;

        let mut session = MigrationSession::new(Uuid::new_v4().to_string(), config);
        session.steps = build_steps(&session.config);
        // Reject a malformed graph before anything runs.
        topo_layers(&session.steps)?;

        let snapshot = session.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(session));
        self.sessions
            .lock()
            .map_err(|_| Error::config("session registry poisoned"))?
            .insert(snapshot.id.clone(), shared);
        self.cancel_tokens
            .lock()
            .map_err(|_| Error::config("session registry poisoned"))?
            .insert(snapshot.id.clone(), CancellationToken::new());
        Ok(snapshot)
    }

    fn session_arc(&self, session_id: &str) -> Result<SharedSession> {
        self.sessions
            .lock()
            .map_err(|_| Error::config("session registry poisoned"))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no session {session_id}")))
    }

    fn cancel_token(&self, session_id: &str) -> Result<CancellationToken> {
        self.cancel_tokens
            .lock()
            .map_err(|_| Error::config("session registry poisoned"))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no session {session_id}")))
    }

    /// Snapshot safe for concurrent readers.
    pub async fn get_status(&self, session_id: &str) -> Result<MigrationSession> {
        let shared = self.session_arc(session_id)?;
        let session = shared.lock().await;
        Ok(session.clone())
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Request cooperative cancellation. The in-flight step's work
    /// observes the token at its next suspension point; subsequent
    /// steps are skipped.
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        self.cancel_token(session_id)?.cancel();
        Ok(())
    }

    /// Execute a session to a terminal status.
    pub async fn execute(
        &self,
        session_id: &str,
        reporter: &dyn Reporter,
    ) -> Result<MigrationSession> {
        let shared = self.session_arc(session_id)?;
        let cancel = self.cancel_token(session_id)?;

        match self.run_phases(&shared, &cancel, reporter).await {
            Ok(()) => {
                let mut session = shared.lock().await;
                session.transition(SessionStatus::Completed);
                reporter.info(&format!("migration session {session_id} completed"));
                Ok(session.clone())
            }
            Err(error) => self.handle_failure(&shared, error, reporter).await,
        }
    }

    async fn run_phases(
        &self,
        shared: &SharedSession,
        cancel: &CancellationToken,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        let config = {
            let mut session = shared.lock().await;
            if session.status != SessionStatus::Pending {
                return Err(Error::config(format!(
                    "session is not pending (status: {})",
                    session.status
                )));
            }
            session.transition(SessionStatus::Validating);
            session.config.clone()
        };

        // initialize
        self.start_step(shared, STEP_INITIALIZE).await;
        reporter.info("initializing migration session");
        self.complete_step(shared, STEP_INITIALIZE).await;

        // Validation phase: nothing destructive may run before it.
        self.start_step(shared, STEP_VALIDATE).await;
        reporter.info("running pre-flight validation");
        let summary = self.validation.validate(&config).await?;
        let can_proceed = summary.can_proceed;
        {
            let mut session = shared.lock().await;
            for warning in &summary.warnings {
                session.add_log(LogLevel::Warning, warning.clone());
            }
            session.validation = Some(summary.clone());
        }
        if !can_proceed {
            let message = summary
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "pre-flight validation failed".to_string());
            self.fail_step(shared, STEP_VALIDATE, &message).await;
            return Err(Error::validation(message));
        }
        self.complete_step(shared, STEP_VALIDATE).await;

        {
            let mut session = shared.lock().await;
            session.transition(SessionStatus::Running);
        }

        // Everything after validation runs in topological layers.
        let (layers, concurrency) = {
            let session = shared.lock().await;
            (
                topo_layers(&session.steps)?,
                session.config.transfer.step_concurrency.max(1),
            )
        };

        for layer in layers {
            let runnable: Vec<String> = {
                let session = shared.lock().await;
                layer
                    .into_iter()
                    .filter(|id| {
                        session
                            .step(id)
                            .is_some_and(|s| s.status == StepStatus::Pending)
                    })
                    .collect()
            };

            for chunk in runnable.chunks(concurrency) {
                if cancel.is_cancelled() {
                    for id in chunk {
                        self.skip_step(shared, id).await;
                    }
                    return Err(Error::cancelled("migration cancelled by user"));
                }

                let outcomes = futures::future::join_all(chunk.iter().map(|id| {
                    let id = id.clone();
                    async move {
                        let result = self.run_step(&id, shared, cancel, reporter).await;
                        (id, result)
                    }
                }))
                .await;

                for (id, outcome) in outcomes {
                    match outcome {
                        Ok(()) => self.complete_step(shared, &id).await,
                        Err(Error::Cancelled(message)) => {
                            self.cancel_step(shared, &id).await;
                            return Err(Error::cancelled(message));
                        }
                        Err(error) => {
                            self.fail_step(shared, &id, &error.to_string()).await;
                            return Err(error);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_step(
        &self,
        step_id: &str,
        shared: &SharedSession,
        cancel: &CancellationToken,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        self.start_step(shared, step_id).await;
        let config = {
            let session = shared.lock().await;
            session.config.clone()
        };

        match step_id {
            STEP_ENABLE_MAINTENANCE => {
                reporter.info("enabling maintenance mode on the destination");
                self.maintenance
                    .enable(&config.destination, &MaintenanceOptions::default())
                    .await?;
                Ok(())
            }
            STEP_BACKUP_SOURCE => {
                reporter.info("backing up the source system");
                let artifacts = self
                    .backup
                    .full_system_backup(&config, &config.source, config.source_database.as_ref())
                    .await?;
                let mut session = shared.lock().await;
                let count = artifacts.len();
                for artifact in artifacts {
                    session.add_artifact(artifact);
                }
                if let Some(step) = session.step_mut(STEP_BACKUP_SOURCE) {
                    step.metadata
                        .insert("artifact_count".to_string(), serde_json::json!(count));
                }
                Ok(())
            }
            STEP_BACKUP_DESTINATION => {
                reporter.info("backing up the destination system");
                let artifacts = self
                    .backup
                    .full_system_backup(
                        &config,
                        &config.destination,
                        config.destination_database.as_ref(),
                    )
                    .await?;
                let mut session = shared.lock().await;
                let count = artifacts.len();
                for artifact in artifacts {
                    session.add_artifact(artifact);
                }
                if let Some(step) = session.step_mut(STEP_BACKUP_DESTINATION) {
                    step.metadata
                        .insert("artifact_count".to_string(), serde_json::json!(count));
                }
                Ok(())
            }
            STEP_MIGRATE_FILES => {
                if !config.transfer.migrate_files {
                    self.skip_step(shared, STEP_MIGRATE_FILES).await;
                    return Ok(());
                }
                reporter.info("transferring site files");
                let files = self.file_transfer.transfer(&config, cancel).await?;
                let mut session = shared.lock().await;
                if let Some(step) = session.step_mut(STEP_MIGRATE_FILES) {
                    step.progress.update(files, Some(files));
                    step.add_log(LogLevel::Info, format!("transferred {files} files"));
                }
                Ok(())
            }
            STEP_MIGRATE_DATABASE => {
                self.run_database_migration(&config, shared, cancel, reporter)
                    .await
            }
            STEP_VERIFY => {
                if !config.transfer.verify_after {
                    self.skip_step(shared, STEP_VERIFY).await;
                    return Ok(());
                }
                self.run_verification(&config, shared, reporter).await
            }
            STEP_DISABLE_MAINTENANCE => {
                reporter.info("disabling maintenance mode");
                self.maintenance.disable(&config.destination).await?;
                Ok(())
            }
            STEP_CLEANUP => {
                let removed = self
                    .backup
                    .store()
                    .cleanup_temp(Duration::from_secs(24 * 3600))?;
                if removed > 0 {
                    reporter.info(&format!("cleaned up {removed} temp file(s)"));
                }
                Ok(())
            }
            other => Err(Error::config(format!("unknown step id: {other}"))),
        }
    }

    async fn run_database_migration(
        &self,
        config: &MigrationConfig,
        shared: &SharedSession,
        cancel: &CancellationToken,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        let (Some(source_db), Some(destination_db)) =
            (&config.source_database, &config.destination_database)
        else {
            return Err(Error::config(
                "migrate_database requires both database configurations",
            ));
        };

        let engine = dbengine::engine_for(source_db, destination_db)?;

        reporter.info("checking database compatibility");
        let findings = engine.validate_compatibility().await?;
        {
            let mut session = shared.lock().await;
            for warning in &findings.warnings {
                session.add_log(LogLevel::Warning, warning.clone());
            }
        }
        if !findings.compatible() {
            return Err(Error::database(format!(
                "databases are not compatible: {}",
                findings.issues.join("; ")
            )));
        }

        reporter.info("migrating database schema");
        let schema = engine.migrate_schema().await?;
        if !schema.is_successful() {
            return Err(Error::database(format!(
                "schema migration failed: {}",
                schema.errors.join("; ")
            )));
        }
        {
            let mut session = shared.lock().await;
            for warning in &schema.warnings {
                session.add_log(LogLevel::Warning, warning.clone());
            }
        }

        let method = config
            .transfer
            .transfer_method
            .filter(|m| engine.supported_methods().contains(m))
            .unwrap_or_else(|| engine.supported_methods()[0]);
        reporter.info(&format!("migrating data via {method}"));

        let mut spec = DataMigrationSpec::new(method, config.transfer.batch_size);
        spec.cancel = cancel.clone();
        let mut stream = engine.migrate_data(spec).await?;

        while let Some(progress) = stream.next_progress().await {
            let mut session = shared.lock().await;
            if let Some(step) = session.step_mut(STEP_MIGRATE_DATABASE) {
                step.progress
                    .update(progress.entities_completed, Some(progress.total_entities));
                step.metadata.insert(
                    "records_processed".to_string(),
                    serde_json::json!(progress.records_processed),
                );
                if let Some(entity) = &progress.current_entity {
                    step.metadata
                        .insert("current_entity".to_string(), serde_json::json!(entity));
                }
            }
        }

        let outcome = stream.finish().await?;
        {
            let mut session = shared.lock().await;
            for warning in &outcome.warnings {
                session.add_log(LogLevel::Warning, warning.clone());
            }
            for error in &outcome.errors {
                session.add_log(LogLevel::Error, error.clone());
            }
        }
        if outcome.entities_migrated == 0 && !outcome.errors.is_empty() {
            return Err(Error::database(format!(
                "data migration failed for every entity: {}",
                outcome.errors.join("; ")
            )));
        }
        reporter.info(&format!(
            "migrated {} records across {} entities",
            outcome.records_migrated, outcome.entities_migrated
        ));
        Ok(())
    }

    async fn run_verification(
        &self,
        config: &MigrationConfig,
        shared: &SharedSession,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        reporter.info("verifying migration results");

        // Cross-check the registered artifact count against what the
        // backup steps reported producing.
        {
            let session = shared.lock().await;
            let expected: u64 = [STEP_BACKUP_SOURCE, STEP_BACKUP_DESTINATION]
                .iter()
                .filter_map(|id| session.step(id))
                .filter_map(|step| step.metadata.get("artifact_count"))
                .filter_map(|v| v.as_u64())
                .sum();
            let actual = session.artifacts.len() as u64;
            if actual < expected {
                return Err(Error::verification(format!(
                    "artifact count mismatch: backup steps produced {expected}, session holds {actual}"
                )));
            }
        }

        if config.transfer.migrate_database
            && let (Some(source_db), Some(destination_db)) =
                (&config.source_database, &config.destination_database)
        {
            let engine = dbengine::engine_for(source_db, destination_db)?;
            let outcome = engine.verify(None).await?;
            if !outcome.success {
                let mut details = outcome.mismatches.clone();
                details.extend(outcome.errors.clone());
                return Err(Error::verification(format!(
                    "database verification failed: {}",
                    details.join("; ")
                )));
            }
            reporter.info(&format!(
                "database verification passed: {}/{} entities match",
                outcome.matches, outcome.entities_verified
            ));

            // Relational pairs additionally get row-level integrity
            // checks at the configured depth.
            if source_db.family.is_relational() {
                let report = self
                    .data_validator
                    .validate_migration(
                        source_db,
                        destination_db,
                        None,
                        config.transfer.validation_level,
                        None,
                    )
                    .await?;
                if !report.passed() {
                    return Err(Error::verification(format!(
                        "data integrity validation failed for tables: {:?}",
                        report.failed_tables()
                    )));
                }
                let mut session = shared.lock().await;
                for warning in &report.warnings {
                    session.add_log(LogLevel::Warning, warning.clone());
                }
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        shared: &SharedSession,
        error: Error,
        reporter: &dyn Reporter,
    ) -> Result<MigrationSession> {
        let cancelled = matches!(error, Error::Cancelled(_));
        let (session_snapshot, auto_rollback) = {
            let mut session = shared.lock().await;
            if session.status.is_terminal() {
                // A rejected re-run of a finished session; leave it be.
                return Err(error);
            }
            let failing_step = session
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| s.id.clone());
            // Steps that never started are skipped, not failed.
            for step in &mut session.steps {
                if step.status == StepStatus::Pending {
                    step.skip();
                }
            }
            let mut info = ErrorInfo::new(error.kind(), error.to_string(), ErrorSeverity::High);
            info.step_id = failing_step;
            info.rollback_required = session.config.transfer.auto_rollback;
            session.error = Some(info);
            let became_terminal = if cancelled {
                session.transition(SessionStatus::Cancelled)
            } else {
                session.transition(SessionStatus::Failed)
            };
            (
                session.clone(),
                // A session that was already terminal (e.g. a rejected
                // re-run) must never be rolled back again.
                became_terminal && session.config.transfer.auto_rollback,
            )
        };
        reporter.error(&format!("migration failed: {error}"));

        if auto_rollback && !session_snapshot.artifacts.is_empty() {
            // Rollback runs to completion regardless of the session's
            // cancellation token; in-flight restores finish on their own.
            reporter.warn("starting automatic rollback");
            match self
                .rollback
                .execute(&session_snapshot, &RollbackOptions::default())
                .await
            {
                Ok(plan) if plan.status == RollbackStatus::Completed => {
                    let mut session = shared.lock().await;
                    session.transition(SessionStatus::RolledBack);
                    reporter.warn("rollback completed; session rolled back");
                }
                Ok(plan) => {
                    reporter.error(&format!(
                        "rollback finished with status {:?}; {} step(s) failed",
                        plan.status,
                        plan.failed_artifacts().len()
                    ));
                    let guidance = self.rollback.guidance(&session_snapshot, None);
                    let mut session = shared.lock().await;
                    session.add_log(
                        LogLevel::Error,
                        format!(
                            "manual recovery guidance generated ({:?} complexity)",
                            guidance.estimated_complexity
                        ),
                    );
                }
                Err(rollback_error) => {
                    reporter.error(&format!("rollback failed: {rollback_error}"));
                    let guidance = self.rollback.guidance(&session_snapshot, None);
                    let mut session = shared.lock().await;
                    session.add_log(
                        LogLevel::Error,
                        format!(
                            "automatic rollback impossible; manual recovery guidance generated \
                             ({:?} complexity)",
                            guidance.estimated_complexity
                        ),
                    );
                }
            }
        }

        Err(error)
    }

    async fn start_step(&self, shared: &SharedSession, step_id: &str) {
        let mut session = shared.lock().await;
        session.current_step = Some(step_id.to_string());
        if let Some(step) = session.step_mut(step_id) {
            step.start();
        }
    }

    async fn complete_step(&self, shared: &SharedSession, step_id: &str) {
        let mut session = shared.lock().await;
        if let Some(step) = session.step_mut(step_id)
            && step.status == StepStatus::Running
        {
            step.complete();
        }
        let progress = session.overall_progress();
        session.progress.update(progress as u64, Some(100));
    }

    async fn fail_step(&self, shared: &SharedSession, step_id: &str, message: &str) {
        let mut session = shared.lock().await;
        if let Some(step) = session.step_mut(step_id) {
            step.fail(ErrorInfo::new("step_failure", message, ErrorSeverity::High));
        }
    }

    async fn skip_step(&self, shared: &SharedSession, step_id: &str) {
        let mut session = shared.lock().await;
        if let Some(step) = session.step_mut(step_id)
            && matches!(step.status, StepStatus::Pending | StepStatus::Running)
        {
            step.skip();
        }
    }

    async fn cancel_step(&self, shared: &SharedSession, step_id: &str) {
        let mut session = shared.lock().await;
        if let Some(step) = session.step_mut(step_id) {
            step.cancel();
        }
    }
}

/// Build the canonical step graph for a configuration.
pub fn build_steps(config: &MigrationConfig) -> Vec<MigrationStep> {
    let transfer = &config.transfer;
    let mut steps = Vec::new();

    steps.push(MigrationStep::new(STEP_INITIALIZE, "Initialize migration"));
    steps.push(
        MigrationStep::new(STEP_VALIDATE, "Validate pre-migration state")
            .depends_on(&[STEP_INITIALIZE]),
    );

    let mut backup_deps: Vec<&str> = vec![STEP_VALIDATE];
    if transfer.maintenance_mode {
        steps.push(
            MigrationStep::new(STEP_ENABLE_MAINTENANCE, "Enable maintenance mode")
                .depends_on(&[STEP_VALIDATE]),
        );
        backup_deps.push(STEP_ENABLE_MAINTENANCE);
    }

    steps.push(
        MigrationStep::new(STEP_BACKUP_SOURCE, "Backup source system").depends_on(&backup_deps),
    );
    steps.push(
        MigrationStep::new(STEP_BACKUP_DESTINATION, "Backup destination system")
            .depends_on(&backup_deps),
    );

    let migration_deps = [STEP_BACKUP_SOURCE, STEP_BACKUP_DESTINATION];
    steps.push(
        MigrationStep::new(STEP_MIGRATE_FILES, "Migrate site files").depends_on(&migration_deps),
    );
    let mut verify_deps: Vec<&str> = vec![STEP_MIGRATE_FILES];
    if transfer.migrate_database {
        steps.push(
            MigrationStep::new(STEP_MIGRATE_DATABASE, "Migrate database")
                .depends_on(&migration_deps),
        );
        verify_deps.push(STEP_MIGRATE_DATABASE);
    }

    steps.push(
        MigrationStep::new(STEP_VERIFY, "Verify post-migration state").depends_on(&verify_deps),
    );

    if transfer.maintenance_mode {
        steps.push(
            MigrationStep::new(STEP_DISABLE_MAINTENANCE, "Disable maintenance mode")
                .depends_on(&[STEP_VERIFY]),
        );
    }

    // Terminal sink: cleanup depends on every other step.
    let all_ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let mut cleanup = MigrationStep::new(STEP_CLEANUP, "Clean up temporary artifacts");
    cleanup.dependencies = all_ids;
    steps.push(cleanup);

    steps
}

/// Kahn layering: every step lands in the earliest layer after all of
/// its dependencies. Rejects unknown dependencies and cycles.
pub fn topo_layers(steps: &[MigrationStep]) -> Result<Vec<Vec<String>>> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in steps {
        indegree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(Error::config(format!(
                    "step {} depends on unknown step {dep}",
                    step.id
                )));
            }
            *indegree.entry(step.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut seen = 0usize;

    while !queue.is_empty() {
        let mut layer = Vec::new();
        for _ in 0..queue.len() {
            let Some(id) = queue.pop_front() else {
                break;
            };
            seen += 1;
            layer.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        layer.sort();
        layers.push(layer);
    }

    if seen != steps.len() {
        return Err(Error::config("step graph contains a dependency cycle"));
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use siteshift_types::{SystemConfig, SystemKind};
    use std::path::Path;

    fn orchestrator(dir: &Path) -> Orchestrator {
        let store =
            ArtifactStore::new(dir.join("backups"), RetentionPolicy::keep_everything()).unwrap();
        Orchestrator::new(Arc::new(store))
    }

    fn local_config(dir: &Path, maintenance: bool) -> MigrationConfig {
        let source_root = dir.join("source_site");
        let destination_root = dir.join("destination_site");
        std::fs::create_dir_all(&source_root).unwrap();
        std::fs::create_dir_all(&destination_root).unwrap();
        std::fs::write(source_root.join("index.html"), "<html>site</html>").unwrap();
        std::fs::write(source_root.join("style.css"), "body {}").unwrap();

        let mut config = MigrationConfig::minimal("local-move");
        config.source = SystemConfig {
            kind: SystemKind::StaticSite,
            host: "old.example.com".to_string(),
            port: None,
            document_root: Some(source_root),
            cloud: None,
        };
        config.destination = SystemConfig {
            kind: SystemKind::StaticSite,
            host: "new.example.com".to_string(),
            port: None,
            document_root: Some(destination_root),
            cloud: None,
        };
        config.transfer.maintenance_mode = maintenance;
        config.transfer.backup_files = true;
        config.transfer.backup_config = true;
        config
    }

    #[test]
    fn test_build_steps_canonical_graph() {
        let mut config = MigrationConfig::minimal("graph");
        config.transfer.maintenance_mode = true;
        config.transfer.migrate_database = true;
        let steps = build_steps(&config);
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids[0], STEP_INITIALIZE);
        assert!(ids.contains(&STEP_ENABLE_MAINTENANCE));
        assert!(ids.contains(&STEP_MIGRATE_DATABASE));
        assert!(ids.contains(&STEP_DISABLE_MAINTENANCE));
        assert_eq!(*ids.last().unwrap(), STEP_CLEANUP);

        // Cleanup depends on everything else.
        let cleanup = steps.last().unwrap();
        assert_eq!(cleanup.dependencies.len(), steps.len() - 1);

        // Verification depends on every migration step.
        let verify = steps.iter().find(|s| s.id == STEP_VERIFY).unwrap();
        assert!(verify.dependencies.contains(&STEP_MIGRATE_FILES.to_string()));
        assert!(verify.dependencies.contains(&STEP_MIGRATE_DATABASE.to_string()));
    }

    #[test]
    fn test_topo_layers_order() {
        let config = MigrationConfig::minimal("topo");
        let steps = build_steps(&config);
        let layers = topo_layers(&steps).unwrap();

        assert_eq!(layers[0], vec![STEP_INITIALIZE.to_string()]);
        assert_eq!(layers[1], vec![STEP_VALIDATE.to_string()]);
        // Backups are dependency-disjoint and share a layer.
        assert_eq!(
            layers[2],
            vec![
                STEP_BACKUP_DESTINATION.to_string(),
                STEP_BACKUP_SOURCE.to_string()
            ]
        );
        assert_eq!(*layers.last().unwrap(), vec![STEP_CLEANUP.to_string()]);
    }

    #[test]
    fn test_topo_rejects_unknown_dependency() {
        let mut steps = vec![MigrationStep::new("a", "A")];
        steps.push(MigrationStep::new("b", "B").depends_on(&["ghost"]));
        assert!(matches!(topo_layers(&steps), Err(Error::Config(_))));
    }

    #[test]
    fn test_topo_rejects_cycle() {
        let steps = vec![
            MigrationStep::new("a", "A").depends_on(&["b"]),
            MigrationStep::new("b", "B").depends_on(&["a"]),
        ];
        assert!(matches!(topo_layers(&steps), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_happy_path_local_migration() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let config = local_config(dir.path(), true);
        let destination_root = config.destination.document_root.clone().unwrap();

        let session = orchestrator.create_session(config).unwrap();
        let finished = orchestrator.execute(&session.id, &NullReporter).await.unwrap();

        assert_eq!(finished.status, SessionStatus::Completed);
        // Every step completed or was deliberately skipped.
        assert!(
            finished
                .steps
                .iter()
                .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped)),
            "steps: {:?}",
            finished
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.status))
                .collect::<Vec<_>>()
        );
        // Files arrived.
        assert!(destination_root.join("index.html").exists());
        // Backups were produced for both sides (files + config each).
        assert_eq!(finished.artifacts.len(), 4);
        // Maintenance mode was lifted again.
        assert!(
            !orchestrator
                .maintenance_controller()
                .is_active(&finished.config.destination)
        );
        assert_eq!(finished.overall_progress(), 100.0);
    }

    #[tokio::test]
    async fn test_validation_failure_stops_before_destructive_steps() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let mut config = local_config(dir.path(), false);
        // Point the source at a missing tree so pre-flight fails.
        config.source.document_root = Some(dir.path().join("does_not_exist"));

        let session = orchestrator.create_session(config).unwrap();
        let err = orchestrator
            .execute(&session.id, &NullReporter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let status = orchestrator.get_status(&session.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        // No backups were taken and no rollback ran.
        assert!(status.artifacts.is_empty());
        let backup_step = status.step(STEP_BACKUP_SOURCE).unwrap();
        assert_eq!(backup_step.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failure_after_backup_triggers_rollback() {
        struct FailingTransfer;
        #[async_trait]
        impl FileTransfer for FailingTransfer {
            async fn transfer(
                &self,
                _config: &MigrationConfig,
                _cancel: &CancellationToken,
            ) -> Result<u64> {
                Err(Error::transfer("disk full halfway through"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            orchestrator(dir.path()).with_file_transfer(Arc::new(FailingTransfer));
        let config = local_config(dir.path(), false);

        let session = orchestrator.create_session(config).unwrap();
        let err = orchestrator
            .execute(&session.id, &NullReporter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));

        let status = orchestrator.get_status(&session.id).await.unwrap();
        // Artifacts existed, auto_rollback is on by default, and the
        // rollback plan completed, so the session is rolled back.
        assert_eq!(status.status, SessionStatus::RolledBack);
        assert!(!status.artifacts.is_empty());
        let plan = orchestrator
            .rollback_engine()
            .get_plan(&session.id)
            .unwrap();
        assert_eq!(plan.status, RollbackStatus::Completed);
        // Rollback order is newest artifact first.
        let sequences: Vec<u64> = plan.steps.iter().map(|s| s.artifact.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sequences, sorted);
    }

    #[tokio::test]
    async fn test_cancel_marks_session_cancelled() {
        struct SlowTransfer;
        #[async_trait]
        impl FileTransfer for SlowTransfer {
            async fn transfer(
                &self,
                _config: &MigrationConfig,
                cancel: &CancellationToken,
            ) -> Result<u64> {
                cancel.cancelled().await;
                Err(Error::cancelled("file transfer cancelled"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).with_file_transfer(Arc::new(SlowTransfer));
        let mut config = local_config(dir.path(), false);
        config.transfer.auto_rollback = false;

        let session = orchestrator.create_session(config).unwrap();
        let id = session.id.clone();

        let exec = orchestrator.execute(&id, &NullReporter);
        tokio::pin!(exec);
        // Let the execution reach the transfer step, then cancel.
        tokio::select! {
            _ = &mut exec => panic!("execution finished before cancel"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {
                orchestrator.cancel(&id).unwrap();
            }
        }
        let err = exec.await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        let status = orchestrator.get_status(&id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_terminal_session_cannot_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let config = local_config(dir.path(), false);
        let session = orchestrator.create_session(config).unwrap();
        orchestrator.execute(&session.id, &NullReporter).await.unwrap();

        let err = orchestrator
            .execute(&session.id, &NullReporter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not pending"));
        // The terminal status did not change.
        let status = orchestrator.get_status(&session.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_get_status_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        assert!(matches!(
            orchestrator.get_status("nope").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
