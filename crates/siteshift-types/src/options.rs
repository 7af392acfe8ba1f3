//! Enumerated option records.
//!
//! Each call site that used to take a free-form dictionary takes one of
//! these instead. Unknown keys are a configuration error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Options accepted by `BackupStrategy::create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupOptions {
    /// Paths archived by the file strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_paths: Vec<PathBuf>,
    /// Entry-name patterns excluded from archives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
    /// Gzip-compress archives. On by default.
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Dump schema definitions only, no data rows.
    #[serde(default)]
    pub schema_only: bool,
    /// Configuration files captured by the config snapshot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_files: Vec<PathBuf>,
    /// Arbitrary config data embedded in the config snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_data: Option<serde_json::Value>,
    /// Resource manifest embedded in the cloud snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    /// Days until the produced artifact expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_after_days: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Options accepted by `BackupStrategy::restore`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreOptions {
    /// Drop existing destination entities before restoring.
    #[serde(default)]
    pub drop_existing: bool,
    /// Overwrite files that already exist at the restore location.
    #[serde(default = "default_true")]
    pub overwrite: bool,
}

/// Options governing rollback execution edge behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackOptions {
    /// Omit the pre-flight recovery validator pass.
    #[serde(default)]
    pub skip_validation: bool,
    /// Proceed even if validation reports invalidating errors.
    #[serde(default)]
    pub force_rollback: bool,
    /// On a step failure, mark it failed and continue with the next
    /// step instead of stopping.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Where file archives are restored to; a scratch directory under
    /// the well-known rollback prefix by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_restore_location: Option<PathBuf>,
    /// Where config snapshots are restored to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_restore_location: Option<PathBuf>,
}

/// Execution options carried by a scheduled migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleOptions {
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    #[serde(default)]
    pub show_progress: bool,
    /// Retry ceiling for failed dispatches.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions {
            auto_rollback: true,
            show_progress: false,
            max_retries: default_max_retries(),
        }
    }
}

/// Options accepted by `MaintenanceController::enable`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceOptions {
    /// Operator-visible message rendered into the maintenance page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Override the maintenance file name (CMS and generic methods).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_file: Option<PathBuf>,
    /// Environment variable used by the env-toggle method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
    /// Host-native commands for enabling and disabling maintenance
    /// (e.g. `php artisan down` / `php artisan up`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_command: Option<String>,
    /// Seconds clients should wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_options_defaults() {
        let opts: BackupOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.compression);
        assert!(!opts.schema_only);
        assert!(opts.source_paths.is_empty());
    }

    #[test]
    fn test_unknown_option_is_configuration_error() {
        let parsed: Result<RollbackOptions, _> =
            serde_json::from_str(r#"{"skip_validation": true, "frobnicate": 1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_schedule_options_defaults() {
        let opts = ScheduleOptions::default();
        assert!(opts.auto_rollback);
        assert_eq!(opts.max_retries, 3);
    }
}
