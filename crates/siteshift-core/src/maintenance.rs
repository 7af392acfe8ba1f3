//! Maintenance controller.
//!
//! Keeps a process-wide registry of active maintenance holds keyed by
//! `<host>:<port>`. Enabling dispatches on the system kind to a method
//! (maintenance file with per-CMS stubs, environment toggle, config
//! flag, host-native command, index or object replacement, replica
//! swap); each hold records the method tag plus the data needed to
//! reverse it, so disable never has to guess the inverse.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::{LogEntry, LogLevel, MaintenanceOptions, SystemConfig, SystemKind};

use crate::error::{Error, Result};
use crate::process::CommandSpec;

const DEFAULT_MESSAGE: &str = "Site is temporarily under maintenance. Please check back soon.";

/// How a hold was applied, with everything needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MaintenanceMethod {
    MaintenanceFile {
        file_path: PathBuf,
    },
    EnvironmentVariable {
        env_var: String,
        value: String,
    },
    ConfigFile {
        file_path: PathBuf,
    },
    HostCommand {
        down_command: String,
        up_command: String,
    },
    IndexReplacement {
        index_path: PathBuf,
        backup_path: PathBuf,
        /// Digest of the maintenance page as written; disable only
        /// removes the index when it is still this page.
        maintenance_digest: String,
    },
    ObjectReplacement {
        maintenance_object: String,
        original_index: String,
    },
    ReplicaSwap {
        maintenance_container: String,
        original_replicas: u32,
    },
}

impl MaintenanceMethod {
    pub fn tag(&self) -> &'static str {
        match self {
            MaintenanceMethod::MaintenanceFile { .. } => "maintenance_file",
            MaintenanceMethod::EnvironmentVariable { .. } => "environment_variable",
            MaintenanceMethod::ConfigFile { .. } => "config_file",
            MaintenanceMethod::HostCommand { .. } => "host_command",
            MaintenanceMethod::IndexReplacement { .. } => "index_replacement",
            MaintenanceMethod::ObjectReplacement { .. } => "object_replacement",
            MaintenanceMethod::ReplicaSwap { .. } => "replica_swap",
        }
    }
}

/// An active maintenance hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceHold {
    pub system_id: String,
    pub system: SystemConfig,
    pub enabled_at: DateTime<Utc>,
    pub method: MaintenanceMethod,
    pub message: String,
}

pub struct MaintenanceController {
    active: Mutex<HashMap<String, MaintenanceHold>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl Default for MaintenanceController {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceController {
    pub fn new() -> Self {
        MaintenanceController {
            active: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, level: LogLevel, message: String, system_id: &str) {
        let entry = LogEntry::new(level, message)
            .with_component("MaintenanceController")
            .with_detail("system_id", serde_json::json!(system_id));
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(entry);
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Enable maintenance isolation on a system. Enabling an
    /// already-held system is idempotent and returns the existing hold.
    pub async fn enable(
        &self,
        system: &SystemConfig,
        options: &MaintenanceOptions,
    ) -> Result<MaintenanceHold> {
        let system_id = system.system_id();
        self.log(
            LogLevel::Info,
            format!("enabling maintenance mode for {}", system.kind),
            &system_id,
        );

        if let Some(existing) = self.get_hold(&system_id) {
            self.log(
                LogLevel::Warning,
                "maintenance mode already active".to_string(),
                &system_id,
            );
            return Ok(existing);
        }

        let message = options
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
        let method = self.apply(system, options, &message).await?;

        let hold = MaintenanceHold {
            system_id: system_id.clone(),
            system: system.clone(),
            enabled_at: Utc::now(),
            method,
            message,
        };

        self.active
            .lock()
            .map_err(|_| Error::transfer("maintenance registry poisoned"))?
            .insert(system_id.clone(), hold.clone());
        self.log(
            LogLevel::Info,
            "maintenance mode enabled successfully".to_string(),
            &system_id,
        );
        Ok(hold)
    }

    /// Disable a hold by executing the recorded inverse. Disabling a
    /// system without a hold succeeds trivially.
    pub async fn disable(&self, system: &SystemConfig) -> Result<bool> {
        let system_id = system.system_id();
        self.log(
            LogLevel::Info,
            format!("disabling maintenance mode for {}", system.kind),
            &system_id,
        );

        let Some(hold) = self.get_hold(&system_id) else {
            self.log(
                LogLevel::Warning,
                "maintenance mode not active".to_string(),
                &system_id,
            );
            return Ok(true);
        };

        self.revert(&hold).await?;

        self.active
            .lock()
            .map_err(|_| Error::transfer("maintenance registry poisoned"))?
            .remove(&system_id);
        self.log(
            LogLevel::Info,
            "maintenance mode disabled successfully".to_string(),
            &system_id,
        );
        Ok(true)
    }

    async fn apply(
        &self,
        system: &SystemConfig,
        options: &MaintenanceOptions,
        message: &str,
    ) -> Result<MaintenanceMethod> {
        match system.kind {
            SystemKind::Wordpress | SystemKind::Drupal | SystemKind::Joomla => {
                let file_name = options
                    .maintenance_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".maintenance"));
                let path = self.docroot(system)?.join(file_name);
                let content = cms_stub(system.kind, message);
                fs::write(&path, content).map_err(|e| {
                    Error::transfer(format!("cannot write {}: {e}", path.display()))
                })?;
                Ok(MaintenanceMethod::MaintenanceFile { file_path: path })
            }
            SystemKind::Django | SystemKind::Flask => {
                if let Some(env_var) = &options.env_var {
                    Ok(MaintenanceMethod::EnvironmentVariable {
                        env_var: env_var.clone(),
                        value: "true".to_string(),
                    })
                } else {
                    let path = self.docroot(system)?.join("maintenance.json");
                    let body = serde_json::json!({
                        "maintenance_mode": true,
                        "message": message,
                        "retry_after": options.retry_after_secs,
                    });
                    fs::write(&path, serde_json::to_string_pretty(&body).unwrap_or_default())
                        .map_err(|e| {
                            Error::transfer(format!("cannot write {}: {e}", path.display()))
                        })?;
                    Ok(MaintenanceMethod::ConfigFile { file_path: path })
                }
            }
            SystemKind::Laravel | SystemKind::Rails => {
                let down = options
                    .down_command
                    .clone()
                    .unwrap_or_else(|| "php artisan down".to_string());
                let up = options
                    .up_command
                    .clone()
                    .unwrap_or_else(|| "php artisan up".to_string());
                self.run_host_command(&down).await?;
                Ok(MaintenanceMethod::HostCommand {
                    down_command: down,
                    up_command: up,
                })
            }
            SystemKind::StaticSite | SystemKind::Nextjs => {
                let docroot = self.docroot(system)?;
                let index_path = docroot.join("index.html");
                let backup_path = docroot.join("index.html.backup");
                if index_path.exists() {
                    fs::rename(&index_path, &backup_path).map_err(|e| {
                        Error::transfer(format!("cannot back up index: {e}"))
                    })?;
                }
                let page = generic_page(message);
                let maintenance_digest = crate::digest::sha256_bytes(page.as_bytes());
                fs::write(&index_path, page).map_err(|e| {
                    Error::transfer(format!("cannot write {}: {e}", index_path.display()))
                })?;
                Ok(MaintenanceMethod::IndexReplacement {
                    index_path,
                    backup_path,
                    maintenance_digest,
                })
            }
            SystemKind::ObjectStorage => Ok(MaintenanceMethod::ObjectReplacement {
                maintenance_object: "maintenance.html".to_string(),
                original_index: "index.html".to_string(),
            }),
            SystemKind::Container => Ok(MaintenanceMethod::ReplicaSwap {
                maintenance_container: "maintenance:latest".to_string(),
                original_replicas: 1,
            }),
            SystemKind::Generic => {
                let file_name = options
                    .maintenance_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("maintenance.html"));
                let path = self.docroot(system)?.join(file_name);
                fs::write(&path, generic_page(message)).map_err(|e| {
                    Error::transfer(format!("cannot write {}: {e}", path.display()))
                })?;
                Ok(MaintenanceMethod::MaintenanceFile { file_path: path })
            }
        }
    }

    async fn revert(&self, hold: &MaintenanceHold) -> Result<()> {
        match &hold.method {
            MaintenanceMethod::MaintenanceFile { file_path }
            | MaintenanceMethod::ConfigFile { file_path } => {
                if file_path.exists() {
                    fs::remove_file(file_path).map_err(|e| {
                        Error::transfer(format!("cannot remove {}: {e}", file_path.display()))
                    })?;
                }
                Ok(())
            }
            MaintenanceMethod::EnvironmentVariable { .. } => Ok(()),
            MaintenanceMethod::HostCommand { up_command, .. } => {
                self.run_host_command(up_command).await
            }
            MaintenanceMethod::IndexReplacement {
                index_path,
                backup_path,
                maintenance_digest,
            } => {
                // The index may have been replaced by the migration in
                // the meantime; only remove it when it is still the
                // maintenance page we wrote.
                let still_ours = crate::digest::sha256_file(index_path)
                    .map(|d| &d == maintenance_digest)
                    .unwrap_or(false);
                if backup_path.exists() {
                    if still_ours {
                        fs::remove_file(index_path).map_err(|e| {
                            Error::transfer(format!("cannot remove {}: {e}", index_path.display()))
                        })?;
                        fs::rename(backup_path, index_path).map_err(|e| {
                            Error::transfer(format!("cannot restore index: {e}"))
                        })?;
                    } else {
                        fs::remove_file(backup_path).map_err(|e| {
                            Error::transfer(format!("cannot discard index backup: {e}"))
                        })?;
                    }
                } else if still_ours {
                    fs::remove_file(index_path).map_err(|e| {
                        Error::transfer(format!("cannot remove {}: {e}", index_path.display()))
                    })?;
                }
                Ok(())
            }
            MaintenanceMethod::ObjectReplacement { .. }
            | MaintenanceMethod::ReplicaSwap { .. } => Ok(()),
        }
    }

    async fn run_host_command(&self, command: &str) -> Result<()> {
        let output = crate::process::run_async(
            CommandSpec::new("sh")
                .arg("-c")
                .arg(command)
                .timeout(Duration::from_secs(120)),
        )
        .await?;
        if !output.success() {
            return Err(Error::transfer(format!(
                "maintenance command '{command}' failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn docroot(&self, system: &SystemConfig) -> Result<PathBuf> {
        system.document_root.clone().ok_or_else(|| {
            Error::config(format!(
                "document_root is required to manage maintenance mode on {}",
                system.host
            ))
        })
    }

    pub fn is_active(&self, system: &SystemConfig) -> bool {
        self.get_hold(&system.system_id()).is_some()
    }

    fn get_hold(&self, system_id: &str) -> Option<MaintenanceHold> {
        self.active.lock().ok()?.get(system_id).cloned()
    }

    pub fn list_active(&self) -> Vec<MaintenanceHold> {
        let mut holds: Vec<MaintenanceHold> = self
            .active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default();
        holds.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        holds
    }

    /// Force-disable holds older than the threshold. Returns the ids of
    /// the systems cleaned up.
    pub async fn cleanup_stale(&self, max_age_hours: u64) -> Vec<String> {
        let now = Utc::now();
        let stale: Vec<MaintenanceHold> = self
            .active
            .lock()
            .map(|a| {
                a.values()
                    .filter(|hold| {
                        (now - hold.enabled_at).num_hours() >= max_age_hours as i64
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut cleaned = Vec::new();
        for hold in stale {
            match self.disable(&hold.system).await {
                Ok(_) => {
                    self.log(
                        LogLevel::Info,
                        "cleaned up stale maintenance hold".to_string(),
                        &hold.system_id,
                    );
                    cleaned.push(hold.system_id);
                }
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("failed to clean up stale maintenance hold: {e}"),
                        &hold.system_id,
                    );
                }
            }
        }
        cleaned
    }
}

fn cms_stub(kind: SystemKind, message: &str) -> String {
    let now = Utc::now().to_rfc3339();
    match kind {
        SystemKind::Wordpress => format!(
            "<?php\n$upgrading = time();\n// Maintenance mode enabled at {now}\n// Message: {message}\n?>"
        ),
        SystemKind::Drupal => format!(
            "<?php\n// Maintenance mode enabled at {now}\n$conf['maintenance_mode'] = 1;\n$conf['maintenance_mode_message'] = '{message}';\n?>"
        ),
        SystemKind::Joomla => format!(
            "<?php\n// Maintenance mode enabled at {now}\nclass JConfig {{\n    public $offline = '1';\n    public $offline_message = '{message}';\n}}\n?>"
        ),
        _ => message.to_string(),
    }
}

fn generic_page(message: &str) -> String {
    let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Under Maintenance</title>
</head>
<body>
    <h1>Under Maintenance</h1>
    <p>{message}</p>
    <p>We apologize for any inconvenience and appreciate your patience.</p>
    <p><small>Maintenance started: {now}</small></p>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(kind: SystemKind, docroot: Option<PathBuf>) -> SystemConfig {
        SystemConfig {
            kind,
            host: "web.example.com".to_string(),
            port: Some(8080),
            document_root: docroot,
            cloud: None,
        }
    }

    #[tokio::test]
    async fn test_wordpress_maintenance_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(SystemKind::Wordpress, Some(dir.path().to_path_buf()));
        let controller = MaintenanceController::new();

        let hold = controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap();
        assert_eq!(hold.method.tag(), "maintenance_file");
        let file = dir.path().join(".maintenance");
        assert!(file.exists());
        let content = fs::read_to_string(&file).unwrap();
        assert!(content.contains("$upgrading = time();"));
        assert!(controller.is_active(&system));

        assert!(controller.disable(&system).await.unwrap());
        assert!(!file.exists());
        assert!(!controller.is_active(&system));
    }

    #[tokio::test]
    async fn test_double_enable_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(SystemKind::Generic, Some(dir.path().to_path_buf()));
        let controller = MaintenanceController::new();

        let first = controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap();
        let second = controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap();
        assert_eq!(first.enabled_at, second.enabled_at);
        assert_eq!(first.method, second.method);
        assert_eq!(controller.list_active().len(), 1);
        // The repeat enable logged a warning.
        assert!(
            controller
                .logs()
                .iter()
                .any(|l| l.level == LogLevel::Warning)
        );
    }

    #[tokio::test]
    async fn test_static_site_index_replacement() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html>live</html>").unwrap();
        let system = system(SystemKind::StaticSite, Some(dir.path().to_path_buf()));
        let controller = MaintenanceController::new();

        controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap();
        let replaced = fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(replaced.contains("Under Maintenance"));
        assert!(dir.path().join("index.html.backup").exists());

        controller.disable(&system).await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<html>live</html>"
        );
        assert!(!dir.path().join("index.html.backup").exists());
    }

    #[tokio::test]
    async fn test_python_app_env_toggle_records_reversal() {
        let controller = MaintenanceController::new();
        let system = system(SystemKind::Django, None);
        let options = MaintenanceOptions {
            env_var: Some("MAINTENANCE_MODE".to_string()),
            ..Default::default()
        };

        let hold = controller.enable(&system, &options).await.unwrap();
        assert_eq!(
            hold.method,
            MaintenanceMethod::EnvironmentVariable {
                env_var: "MAINTENANCE_MODE".to_string(),
                value: "true".to_string(),
            }
        );
        assert!(controller.disable(&system).await.unwrap());
    }

    #[tokio::test]
    async fn test_host_command_method() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("down_marker");
        let system = system(SystemKind::Laravel, None);
        let options = MaintenanceOptions {
            down_command: Some(format!("touch {}", marker.display())),
            up_command: Some(format!("rm {}", marker.display())),
            ..Default::default()
        };

        let controller = MaintenanceController::new();
        controller.enable(&system, &options).await.unwrap();
        assert!(marker.exists());
        controller.disable(&system).await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_disable_without_hold_succeeds() {
        let controller = MaintenanceController::new();
        let system = system(SystemKind::Generic, None);
        assert!(controller.disable(&system).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_docroot_is_config_error() {
        let controller = MaintenanceController::new();
        let system = system(SystemKind::Wordpress, None);
        let err = controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cleanup_stale_force_disables() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(SystemKind::Generic, Some(dir.path().to_path_buf()));
        let controller = MaintenanceController::new();
        controller
            .enable(&system, &MaintenanceOptions::default())
            .await
            .unwrap();

        // Age the hold past the threshold.
        {
            let mut active = controller.active.lock().unwrap();
            let hold = active.get_mut(&system.system_id()).unwrap();
            hold.enabled_at = Utc::now() - chrono::TimeDelta::hours(48);
        }

        let cleaned = controller.cleanup_stale(24).await;
        assert_eq!(cleaned, vec![system.system_id()]);
        assert!(!controller.is_active(&system));
    }
}
