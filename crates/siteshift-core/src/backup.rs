//! Backup manager.
//!
//! Front door over the backup strategies and the artifact store:
//! selects the strategy for a kind, runs creation on the blocking pool,
//! moves the produced file into the store layout, and verifies on
//! demand. The orchestrator's backup phase drives a full system backup
//! (files + database + configuration) through this manager.

use std::sync::{Arc, Mutex};

use siteshift_types::{
    Artifact, ArtifactKind, BackupOptions, DatabaseConfig, EngineFamily, LogEntry, LogLevel,
    MigrationConfig, SystemConfig,
};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::ArtifactStore;
use crate::strategy::{
    BackupStrategy, CloudSnapshotStrategy, ConfigSnapshotStrategy, FileArchiveStrategy,
    KeyValueDumpStrategy, RelationalDumpStrategy,
};

pub struct BackupManager {
    store: Arc<ArtifactStore>,
    logs: Mutex<Vec<LogEntry>>,
}

impl BackupManager {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        BackupManager {
            store,
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    fn log(&self, level: LogLevel, message: String, backup_id: &str) {
        let entry = LogEntry::new(level, message)
            .with_component("BackupManager")
            .with_detail("backup_id", serde_json::json!(backup_id));
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(entry);
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn strategy_for(
        &self,
        kind: ArtifactKind,
        system: &SystemConfig,
        db: Option<&DatabaseConfig>,
    ) -> Result<Box<dyn BackupStrategy>> {
        match kind {
            ArtifactKind::FileArchive => Ok(Box::new(FileArchiveStrategy::new(system.clone()))),
            ArtifactKind::Configuration => {
                Ok(Box::new(ConfigSnapshotStrategy::new(system.clone())))
            }
            ArtifactKind::CloudResources => {
                Ok(Box::new(CloudSnapshotStrategy::new(system.clone())))
            }
            ArtifactKind::DatabaseDump => {
                let db = db.ok_or_else(|| {
                    Error::backup("database configuration required for a database backup")
                })?;
                Ok(Box::new(RelationalDumpStrategy::new(db.clone())))
            }
            ArtifactKind::KeyValueDump => {
                let db = db.ok_or_else(|| {
                    Error::backup("database configuration required for a key-value backup")
                })?;
                Ok(Box::new(KeyValueDumpStrategy::new(db.clone())))
            }
        }
    }

    /// Create one backup, writing into the store's temp space and then
    /// moving the artifact into its final layout position.
    pub async fn create_backup(
        &self,
        kind: ArtifactKind,
        system: &SystemConfig,
        db: Option<&DatabaseConfig>,
        options: BackupOptions,
    ) -> Result<Artifact> {
        let backup_id = Uuid::new_v4().to_string();
        self.log(
            LogLevel::Info,
            format!("creating {kind} backup"),
            &backup_id,
        );

        let strategy = self.strategy_for(kind, system, db)?;
        let temp = self.store.temp_path()?;

        let id_for_task = backup_id.clone();
        let mut artifact = tokio::task::spawn_blocking(move || {
            strategy.create(&id_for_task, &temp, &options)
        })
        .await
        .map_err(|e| Error::backup(format!("backup task panicked: {e}")))??;

        let produced = artifact.location.clone();
        self.store.store(&mut artifact, &produced)?;

        self.log(
            LogLevel::Info,
            format!(
                "backup stored at {} ({} bytes)",
                artifact.location.display(),
                artifact.size
            ),
            &backup_id,
        );
        Ok(artifact)
    }

    /// Verify one backup through its strategy; marks the artifact
    /// verified on success.
    pub async fn verify_backup(
        &self,
        artifact: &mut Artifact,
        system: &SystemConfig,
        db: Option<&DatabaseConfig>,
    ) -> Result<bool> {
        let strategy = self.strategy_for(artifact.kind, system, db)?;
        let snapshot = artifact.clone();
        let ok = tokio::task::spawn_blocking(move || strategy.verify(&snapshot))
            .await
            .map_err(|e| Error::backup(format!("verification task panicked: {e}")))?;
        if ok {
            artifact.mark_verified();
        } else {
            self.log(
                LogLevel::Warning,
                "backup failed verification".to_string(),
                &artifact.id,
            );
        }
        Ok(ok)
    }

    /// The artifact set a full system backup produces for one side of a
    /// migration, per the transfer flags: file archive of the document
    /// root, a dump of the configured database, and a configuration
    /// snapshot.
    pub async fn full_system_backup(
        &self,
        config: &MigrationConfig,
        system: &SystemConfig,
        db: Option<&DatabaseConfig>,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let transfer = &config.transfer;

        if transfer.backup_files
            && let Some(document_root) = &system.document_root
        {
            let options = BackupOptions {
                source_paths: vec![document_root.clone()],
                exclude_patterns: transfer.exclude_patterns.clone(),
                ..Default::default()
            };
            artifacts.push(
                self.create_backup(ArtifactKind::FileArchive, system, None, options)
                    .await?,
            );
        }

        if transfer.backup_database
            && let Some(db) = db
        {
            let kind = if db.family.base() == EngineFamily::Redis {
                ArtifactKind::KeyValueDump
            } else {
                ArtifactKind::DatabaseDump
            };
            artifacts.push(
                self.create_backup(kind, system, Some(db), BackupOptions::default())
                    .await?,
            );
        }

        if transfer.backup_config {
            let options = BackupOptions {
                config_files: transfer.config_files.clone(),
                ..Default::default()
            };
            artifacts.push(
                self.create_backup(ArtifactKind::Configuration, system, None, options)
                    .await?,
            );
        }

        if system.cloud.is_some() {
            artifacts.push(
                self.create_backup(ArtifactKind::CloudResources, system, None, BackupOptions::default())
                    .await?,
            );
        }

        Ok(artifacts)
    }

    /// Rough size estimate for the artifact set a backup would produce.
    pub fn estimate_backup_size(&self, system: &SystemConfig) -> u64 {
        let Some(document_root) = &system.document_root else {
            return 0;
        };
        dir_size(document_root)
    }
}

fn dir_size(path: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use siteshift_types::SystemKind;
    use std::path::Path;

    fn manager(dir: &Path) -> BackupManager {
        let store =
            ArtifactStore::new(dir.join("backups"), RetentionPolicy::keep_everything()).unwrap();
        BackupManager::new(Arc::new(store))
    }

    fn system(docroot: Option<std::path::PathBuf>) -> SystemConfig {
        SystemConfig {
            kind: SystemKind::StaticSite,
            host: "web.example.com".to_string(),
            port: None,
            document_root: docroot,
            cloud: None,
        }
    }

    #[tokio::test]
    async fn test_create_backup_lands_in_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let artifact = manager
            .create_backup(
                ArtifactKind::Configuration,
                &system(None),
                None,
                BackupOptions::default(),
            )
            .await
            .unwrap();

        assert!(artifact.location.exists());
        assert!(
            artifact
                .location
                .to_string_lossy()
                .contains("configuration/static_site/")
        );
        assert!(artifact.checksum.is_some());
        assert!(artifact.sequence > 0);
    }

    #[tokio::test]
    async fn test_verify_backup_marks_verified() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let mut artifact = manager
            .create_backup(
                ArtifactKind::Configuration,
                &system(None),
                None,
                BackupOptions::default(),
            )
            .await
            .unwrap();

        assert!(!artifact.verified);
        assert!(
            manager
                .verify_backup(&mut artifact, &system(None), None)
                .await
                .unwrap()
        );
        assert!(artifact.verified);
        assert!(artifact.verification_date.is_some());
    }

    #[tokio::test]
    async fn test_database_backup_requires_db_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager
            .create_backup(
                ArtifactKind::DatabaseDump,
                &system(None),
                None,
                BackupOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backup(_)));
    }

    #[tokio::test]
    async fn test_full_system_backup_artifact_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let docroot = dir.path().join("site");
        std::fs::create_dir_all(&docroot).unwrap();
        std::fs::write(docroot.join("index.html"), "<html></html>").unwrap();

        let mut config = MigrationConfig::minimal("full-backup");
        config.source = system(Some(docroot));
        // Files + config on, database off.
        config.transfer.backup_files = true;
        config.transfer.backup_config = true;
        config.transfer.backup_database = false;

        let artifacts = manager
            .full_system_backup(&config, &config.source.clone(), None)
            .await
            .unwrap();
        let kinds: Vec<ArtifactKind> = artifacts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ArtifactKind::FileArchive, ArtifactKind::Configuration]
        );
        // Sequence numbers are strictly increasing in creation order.
        assert!(artifacts[0].sequence < artifacts[1].sequence);
    }

    #[tokio::test]
    async fn test_estimate_backup_size() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let docroot = dir.path().join("site");
        std::fs::create_dir_all(docroot.join("nested")).unwrap();
        std::fs::write(docroot.join("a.txt"), "12345").unwrap();
        std::fs::write(docroot.join("nested/b.txt"), "123").unwrap();

        assert_eq!(manager.estimate_backup_size(&system(Some(docroot))), 8);
        assert_eq!(manager.estimate_backup_size(&system(None)), 0);
    }
}
