//! Recovery validator.
//!
//! Runs the pre-restore check suite on artifacts before any rollback
//! attempt: existence and readability, digest, kind-dispatched content
//! probe, metadata health, and recovery readiness (external tools on
//! PATH, available disk space). Errors invalidate; warnings do not.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::{
    Artifact, ArtifactKind, DatabaseConfig, EngineFamily, LogEntry, LogLevel, RestoreOptions,
    SystemConfig,
};

use crate::digest::sha256_file;
use crate::error::Result;
use crate::strategy::{self, CONFIG_READ_ERROR_SENTINEL};

/// Verification older than this draws a warning.
const VERIFICATION_MAX_AGE_DAYS: i64 = 30;
/// Restores want at least this multiple of the artifact size free.
const DISK_SPACE_FACTOR: u64 = 2;

/// Result of validating one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub details: BTreeMap<String, serde_json::Value>,
    pub validation_time: DateTime<Utc>,
}

impl ValidationOutcome {
    fn new() -> Self {
        ValidationOutcome {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            details: BTreeMap::new(),
            validation_time: Utc::now(),
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn detail(&mut self, key: &str, value: serde_json::Value) {
        self.details.insert(key.to_string(), value);
    }
}

/// Aggregate report over a set of artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub outcomes: BTreeMap<String, ValidationOutcome>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

pub struct RecoveryValidator {
    logs: Mutex<Vec<LogEntry>>,
}

impl Default for RecoveryValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryValidator {
    pub fn new() -> Self {
        RecoveryValidator {
            logs: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, level: LogLevel, message: String, backup_id: &str) {
        let entry = LogEntry::new(level, message)
            .with_component("RecoveryValidator")
            .with_detail("backup_id", serde_json::json!(backup_id));
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(entry);
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Run the full check suite on one artifact.
    pub fn validate(&self, artifact: &Artifact) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new();
        self.log(
            LogLevel::Info,
            "starting backup validation".to_string(),
            &artifact.id,
        );

        self.check_existence(artifact, &mut outcome);
        if !outcome.is_valid {
            return outcome;
        }

        self.check_checksum(artifact, &mut outcome);
        self.check_content(artifact, &mut outcome);
        self.check_metadata(artifact, &mut outcome);
        self.check_recovery_readiness(artifact, &mut outcome);

        if outcome.is_valid {
            self.log(
                LogLevel::Info,
                "backup validation successful".to_string(),
                &artifact.id,
            );
        } else {
            self.log(
                LogLevel::Error,
                format!("backup validation failed with {} errors", outcome.errors.len()),
                &artifact.id,
            );
        }
        outcome
    }

    /// Validate a set of artifacts with task fan-out.
    pub async fn validate_many(
        self: std::sync::Arc<Self>,
        artifacts: Vec<Artifact>,
    ) -> BTreeMap<String, ValidationOutcome> {
        let mut handles = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let validator = std::sync::Arc::clone(&self);
            handles.push(tokio::task::spawn_blocking(move || {
                (artifact.id.clone(), validator.validate(&artifact))
            }));
        }

        let mut outcomes = BTreeMap::new();
        for handle in handles {
            match handle.await {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(e) => {
                    let mut failed = ValidationOutcome::new();
                    failed.error(format!("validation task panicked: {e}"));
                    outcomes.insert(format!("unknown-{}", outcomes.len()), failed);
                }
            }
        }
        outcomes
    }

    fn check_existence(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        let location = &artifact.location;
        if location.as_os_str().is_empty() {
            outcome.error("backup location is not specified");
            return;
        }
        if !location.exists() {
            outcome.error(format!("backup file does not exist: {}", location.display()));
            return;
        }
        if !location.is_file() {
            outcome.error(format!("backup location is not a file: {}", location.display()));
            return;
        }

        match File::open(location) {
            Ok(mut file) => {
                let mut probe = [0u8; 1];
                if file.read(&mut probe).is_err() {
                    outcome.error(format!("backup file is not readable: {}", location.display()));
                    return;
                }
            }
            Err(_) => {
                outcome.error(format!("backup file is not readable: {}", location.display()));
                return;
            }
        }

        if let Ok(meta) = fs::metadata(location) {
            let actual = meta.len();
            // Tools may re-pad; a size mismatch is suspicious but not fatal.
            if artifact.size > 0 && actual != artifact.size {
                outcome.warn(format!(
                    "file size mismatch: expected {}, actual {actual}",
                    artifact.size
                ));
            }
            outcome.detail("file_size", serde_json::json!(actual));
        }
        outcome.detail("file_accessible", serde_json::json!(true));
    }

    fn check_checksum(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        let Some(recorded) = &artifact.checksum else {
            outcome.warn("no checksum available for validation");
            return;
        };
        match sha256_file(&artifact.location) {
            Ok(actual) if &actual == recorded => {
                outcome.detail("checksum_valid", serde_json::json!(true));
            }
            Ok(actual) => {
                outcome.error(format!(
                    "checksum mismatch: expected {recorded}, actual {actual}"
                ));
            }
            Err(e) => {
                outcome.error(format!("failed to calculate checksum: {e}"));
            }
        }
    }

    fn check_content(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        match artifact.kind {
            ArtifactKind::FileArchive => self.check_archive_content(artifact, outcome),
            ArtifactKind::DatabaseDump => self.check_dump_content(artifact, outcome),
            ArtifactKind::KeyValueDump => self.check_rdb_content(artifact, outcome),
            ArtifactKind::Configuration => self.check_json_content(
                artifact,
                outcome,
                &["backup_id", "timestamp", "system_config"],
                "config",
            ),
            ArtifactKind::CloudResources => self.check_json_content(
                artifact,
                outcome,
                &["backup_id", "timestamp", "cloud_provider"],
                "cloud",
            ),
        }
    }

    fn check_archive_content(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        let file = match File::open(&artifact.location) {
            Ok(f) => f,
            Err(e) => {
                outcome.error(format!("failed to open archive: {e}"));
                return;
            }
        };
        let mut magic = [0u8; 2];
        let gz = {
            let mut reader = &file;
            reader.read(&mut magic).map(|n| n == 2 && magic == [0x1f, 0x8b]).unwrap_or(false)
        };
        let file = match File::open(&artifact.location) {
            Ok(f) => f,
            Err(e) => {
                outcome.error(format!("failed to open archive: {e}"));
                return;
            }
        };
        let reader: Box<dyn Read> = if gz {
            Box::new(flate2::read::GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut archive = tar::Archive::new(reader);
        match archive.entries() {
            Ok(entries) => {
                let mut members = 0usize;
                for entry in entries {
                    if let Err(e) = entry {
                        outcome.error(format!("failed to read archive member: {e}"));
                        return;
                    }
                    members += 1;
                }
                if members == 0 {
                    outcome.error("archive is empty");
                } else {
                    outcome.detail("archive_members", serde_json::json!(members));
                    outcome.detail("archive_validation", serde_json::json!("passed"));
                }
            }
            Err(e) => outcome.error(format!("failed to validate archive content: {e}")),
        }
    }

    fn check_dump_content(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        let family = artifact
            .database_family()
            .and_then(EngineFamily::parse_tag);

        // Binary mongo archives have no textual keywords to probe.
        if family.map(|f| f.base()) == Some(EngineFamily::Mongodb) {
            outcome.detail("database_validation", serde_json::json!("passed"));
            return;
        }

        let mut head = vec![0u8; 10_240];
        let n = match File::open(&artifact.location).and_then(|mut f| f.read(&mut head)) {
            Ok(n) => n,
            Err(e) => {
                outcome.error(format!("failed to validate database content: {e}"));
                return;
            }
        };
        head.truncate(n);
        let content = String::from_utf8_lossy(&head).to_uppercase();
        if content.trim().is_empty() {
            outcome.error("database dump file is empty");
            return;
        }

        let keywords: &[&str] = match family.map(|f| f.base()) {
            Some(EngineFamily::Mysql) => &["CREATE", "INSERT", "DROP", "USE"],
            Some(EngineFamily::Postgres) => &["CREATE", "INSERT", "DROP", "\\CONNECT"],
            Some(EngineFamily::Sqlite) => &["CREATE", "INSERT", "PRAGMA"],
            _ => &["CREATE", "INSERT"],
        };
        let found: Vec<&str> = keywords
            .iter()
            .copied()
            .filter(|kw| content.contains(&kw.to_uppercase()))
            .collect();
        if found.is_empty() {
            outcome.warn("no expected SQL keywords found in dump file");
        } else {
            outcome.detail("sql_keywords_found", serde_json::json!(found));
        }
        outcome.detail("database_validation", serde_json::json!("passed"));
    }

    fn check_rdb_content(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        let mut magic = [0u8; 5];
        match File::open(&artifact.location).and_then(|mut f| f.read(&mut magic)) {
            Ok(5) if &magic == b"REDIS" => {
                outcome.detail("rdb_validation", serde_json::json!("passed"));
            }
            Ok(_) => outcome.error("key-value dump does not start with the RDB magic"),
            Err(e) => outcome.error(format!("failed to validate key-value content: {e}")),
        }
    }

    fn check_json_content(
        &self,
        artifact: &Artifact,
        outcome: &mut ValidationOutcome,
        required: &[&str],
        label: &str,
    ) {
        let contents = match fs::read_to_string(&artifact.location) {
            Ok(c) => c,
            Err(e) => {
                outcome.error(format!("failed to read {label} backup: {e}"));
                return;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                outcome.error(format!("invalid JSON in {label} backup: {e}"));
                return;
            }
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| value.get(key).is_none())
            .collect();
        if !missing.is_empty() {
            outcome.error(format!(
                "missing required fields in {label} backup: {missing:?}"
            ));
            return;
        }
        if let Some(files) = value.get("config_files").and_then(|v| v.as_object()) {
            outcome.detail("config_files_count", serde_json::json!(files.len()));
            let failed_reads = files
                .values()
                .filter(|v| {
                    v.as_str()
                        .is_some_and(|s| s.starts_with(CONFIG_READ_ERROR_SENTINEL))
                })
                .count();
            if failed_reads > 0 {
                outcome.warn(format!(
                    "{failed_reads} captured file(s) recorded a read failure"
                ));
            }
        }
        outcome.detail(&format!("{label}_validation"), serde_json::json!("passed"));
    }

    fn check_metadata(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        if let Some(expires) = artifact.expires_at
            && Utc::now() > expires
        {
            outcome.warn("backup has expired");
        }

        if !artifact.verified {
            outcome.warn("backup has not been previously verified");
        } else if let Some(date) = artifact.verification_date {
            let age = (Utc::now() - date).num_days();
            if age > VERIFICATION_MAX_AGE_DAYS {
                outcome.warn(format!("backup verification is {age} days old"));
            }
        }

        if artifact.metadata.is_empty() {
            outcome.warn("backup metadata is empty");
        } else {
            let keys: Vec<&String> = artifact.metadata.keys().collect();
            outcome.detail("metadata_keys", serde_json::json!(keys));
        }
    }

    fn check_recovery_readiness(&self, artifact: &Artifact, outcome: &mut ValidationOutcome) {
        match artifact.kind {
            ArtifactKind::DatabaseDump | ArtifactKind::KeyValueDump => {
                let tool = artifact
                    .database_family()
                    .and_then(EngineFamily::parse_tag)
                    .map(|f| f.restore_tool());
                if let Some(tool) = tool {
                    if crate::process::find_tool(tool).is_some() {
                        outcome.detail(&format!("{tool}_available"), serde_json::json!(true));
                    } else {
                        outcome.warn(format!(
                            "database restoration tool '{tool}' not found on PATH"
                        ));
                    }
                } else {
                    outcome.warn("dump artifact does not record its database family");
                }
            }
            _ => {}
        }

        let restore_dir = artifact
            .location
            .parent()
            .unwrap_or_else(|| Path::new("."));
        if let Some(free) = crate::process::available_disk_space(restore_dir) {
            let needed = artifact.size.saturating_mul(DISK_SPACE_FACTOR);
            if free < needed {
                outcome.warn(format!(
                    "insufficient disk space for restoration: need {needed} bytes, available {free}"
                ));
            }
            outcome.detail(
                "disk_space",
                serde_json::json!({"free_bytes": free, "needed_bytes": needed}),
            );
        }
    }

    /// Perform a real restore into a scratch directory for kinds that
    /// support it (file archives and config snapshots).
    pub fn test_restore(
        &self,
        artifact: &Artifact,
        system: &SystemConfig,
        db: Option<&DatabaseConfig>,
    ) -> Result<ValidationOutcome> {
        let mut outcome = ValidationOutcome::new();
        self.log(
            LogLevel::Info,
            "starting restore capability test".to_string(),
            &artifact.id,
        );

        if !matches!(
            artifact.kind,
            ArtifactKind::FileArchive | ArtifactKind::Configuration
        ) {
            outcome.warn(format!(
                "test restoration not implemented for backup kind: {}",
                artifact.kind
            ));
            return Ok(outcome);
        }

        let scratch = tempfile::Builder::new()
            .prefix("siteshift_restore_test_")
            .tempdir()
            .map_err(|e| crate::error::Error::storage(format!("cannot create scratch dir: {e}")))?;

        let strategy = strategy::strategy_for_artifact(artifact, system, db)?;
        match strategy.restore(artifact, scratch.path(), &RestoreOptions::default()) {
            Ok(true) => {
                outcome.detail("test_restore_successful", serde_json::json!(true));
                self.log(
                    LogLevel::Info,
                    "test restoration successful".to_string(),
                    &artifact.id,
                );
            }
            Ok(false) => outcome.error("test restoration failed"),
            Err(e) => outcome.error(format!("test restoration failed: {e}")),
        }

        Ok(outcome)
    }

    /// Build the aggregate report with summary counts and
    /// recommendations derived from observed failure patterns.
    pub fn report(&self, outcomes: BTreeMap<String, ValidationOutcome>) -> RecoveryReport {
        let total = outcomes.len();
        let valid = outcomes.values().filter(|o| o.is_valid).count();
        let invalid = total - valid;
        let total_errors: usize = outcomes.values().map(|o| o.errors.len()).sum();
        let total_warnings: usize = outcomes.values().map(|o| o.warnings.len()).sum();

        let mut recommendations = Vec::new();
        if invalid > 0 {
            recommendations.push(format!(
                "immediate attention required: {invalid} backup(s) failed validation"
            ));
        }
        if total_warnings > 0 {
            recommendations.push(format!(
                "review {total_warnings} warning(s) to improve backup reliability"
            ));
        }
        let checksum_failures = outcomes
            .values()
            .filter(|o| o.errors.iter().any(|e| e.to_lowercase().contains("checksum")))
            .count();
        if checksum_failures > 0 {
            recommendations.push(format!(
                "checksum mismatches in {checksum_failures} artifact(s) - possible corruption"
            ));
        }
        let missing_tools = outcomes
            .values()
            .filter(|o| o.warnings.iter().any(|w| w.contains("not found on PATH")))
            .count();
        if missing_tools > 0 {
            recommendations.push(format!(
                "install missing restoration tools before attempting rollback ({missing_tools} artifact(s) affected)"
            ));
        }

        RecoveryReport {
            total,
            valid,
            invalid,
            total_errors,
            total_warnings,
            outcomes,
            recommendations,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::BackupStrategy;
    use siteshift_types::{BackupOptions, SystemKind};
    use std::sync::Arc;

    fn system() -> SystemConfig {
        SystemConfig {
            kind: SystemKind::StaticSite,
            host: "web.example.com".to_string(),
            port: None,
            document_root: None,
            cloud: None,
        }
    }

    fn config_artifact(dir: &Path) -> Artifact {
        let strategy = crate::strategy::ConfigSnapshotStrategy::new(system());
        strategy
            .create("val1", &dir.join("backups"), &BackupOptions::default())
            .unwrap()
    }

    #[test]
    fn test_valid_config_snapshot_passes() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = config_artifact(dir.path());
        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        assert!(outcome.is_valid, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.details["checksum_valid"], serde_json::json!(true));
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = config_artifact(dir.path());
        fs::remove_file(&artifact.location).unwrap();
        artifact.location = dir.path().join("nope.json");

        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("does not exist"));
    }

    #[test]
    fn test_checksum_mismatch_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = config_artifact(dir.path());
        fs::write(
            &artifact.location,
            r#"{"backup_id":"x","timestamp":"t","system_config":{}}"#,
        )
        .unwrap();

        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        assert!(!outcome.is_valid);
        assert!(outcome.errors.iter().any(|e| e.contains("checksum mismatch")));
    }

    #[test]
    fn test_size_mismatch_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = config_artifact(dir.path());
        artifact.size += 100;

        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        // Size mismatch warns; the checksum still matches so the
        // artifact stays valid.
        assert!(outcome.is_valid);
        assert!(outcome.warnings.iter().any(|w| w.contains("size mismatch")));
    }

    #[test]
    fn test_expired_backup_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = config_artifact(dir.path());
        artifact.expires_at = Some(Utc::now() - chrono::TimeDelta::days(1));

        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        assert!(outcome.is_valid);
        assert!(outcome.warnings.iter().any(|w| w.contains("expired")));
    }

    #[test]
    fn test_stale_verification_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = config_artifact(dir.path());
        artifact.verified = true;
        artifact.verification_date = Some(Utc::now() - chrono::TimeDelta::days(45));

        let validator = RecoveryValidator::new();
        let outcome = validator.validate(&artifact);
        assert!(outcome.warnings.iter().any(|w| w.contains("days old")));
    }

    #[test]
    fn test_test_restore_for_config_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = config_artifact(dir.path());
        let validator = RecoveryValidator::new();
        let outcome = validator
            .test_restore(&artifact, &system(), None)
            .unwrap();
        assert!(outcome.is_valid);
        assert_eq!(
            outcome.details["test_restore_successful"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_test_restore_unsupported_kind_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = config_artifact(dir.path());
        artifact.kind = ArtifactKind::CloudResources;

        let validator = RecoveryValidator::new();
        let outcome = validator
            .test_restore(&artifact, &system(), None)
            .unwrap();
        assert!(outcome.is_valid);
        assert!(outcome.warnings[0].contains("not implemented"));
    }

    #[tokio::test]
    async fn test_validate_many_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let good = config_artifact(dir.path());
        let mut bad = config_artifact(dir.path());
        fs::remove_file(&bad.location).unwrap();
        bad.id = "broken".to_string();

        let validator = Arc::new(RecoveryValidator::new());
        let outcomes = validator
            .clone()
            .validate_many(vec![good.clone(), bad])
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[&good.id].is_valid);
        assert!(!outcomes["broken"].is_valid);
    }

    #[test]
    fn test_report_recommendations() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = config_artifact(dir.path());
        let validator = RecoveryValidator::new();

        let mut outcomes = BTreeMap::new();
        outcomes.insert(artifact.id.clone(), validator.validate(&artifact));
        let mut corrupted = ValidationOutcome::new();
        corrupted.error("checksum mismatch: expected a, actual b");
        outcomes.insert("corrupt".to_string(), corrupted);

        let report = validator.report(outcomes);
        assert_eq!(report.total, 2);
        assert_eq!(report.valid, 1);
        assert_eq!(report.invalid, 1);
        assert!(
            report
                .recommendations
                .iter()
                .any(|r| r.contains("possible corruption"))
        );
    }
}
