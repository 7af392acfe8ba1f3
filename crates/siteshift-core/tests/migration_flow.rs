//! End-to-end migration flows over local document roots: the happy
//! path through every phase, and the rollback path when a migration
//! step fails after backups were taken.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use siteshift_core::error::{Error, Result};
use siteshift_core::orchestrator::{FileTransfer, NullReporter, Orchestrator};
use siteshift_core::retention::RetentionPolicy;
use siteshift_core::rollback::RollbackStatus;
use siteshift_core::store::ArtifactStore;
use siteshift_types::{
    ArtifactKind, MigrationConfig, SessionStatus, StepStatus, SystemConfig, SystemKind,
};
use tokio_util::sync::CancellationToken;

fn orchestrator(dir: &Path) -> Orchestrator {
    let store =
        ArtifactStore::new(dir.join("backups"), RetentionPolicy::keep_everything()).unwrap();
    Orchestrator::new(Arc::new(store))
}

fn seeded_config(dir: &Path) -> MigrationConfig {
    let source_root = dir.join("source_site");
    let destination_root = dir.join("destination_site");
    std::fs::create_dir_all(source_root.join("wp-content/uploads")).unwrap();
    std::fs::create_dir_all(&destination_root).unwrap();
    std::fs::write(source_root.join("index.html"), "<html>production</html>").unwrap();
    std::fs::write(
        source_root.join("wp-content/uploads/logo.png"),
        b"\x89PNG-ish",
    )
    .unwrap();
    let config_file = dir.join("app.conf");
    std::fs::write(&config_file, "listen = 8080\n").unwrap();

    let mut config = MigrationConfig::minimal("e2e-host-move");
    config.source = SystemConfig {
        kind: SystemKind::StaticSite,
        host: "old-host.example.com".to_string(),
        port: Some(443),
        document_root: Some(source_root),
        cloud: None,
    };
    config.destination = SystemConfig {
        kind: SystemKind::StaticSite,
        host: "new-host.example.com".to_string(),
        port: Some(443),
        document_root: Some(destination_root),
        cloud: None,
    };
    config.transfer.maintenance_mode = true;
    config.transfer.backup_files = true;
    config.transfer.backup_config = true;
    config.transfer.config_files = vec![config_file];
    config
}

#[tokio::test]
async fn happy_path_migrates_files_and_lifts_maintenance() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let config = seeded_config(dir.path());
    let destination_root = config.destination.document_root.clone().unwrap();

    let session = orchestrator.create_session(config).unwrap();
    let finished = orchestrator
        .execute(&session.id, &NullReporter)
        .await
        .unwrap();

    assert_eq!(finished.status, SessionStatus::Completed);
    assert!(
        finished
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    );

    // The site tree arrived intact, nested paths included.
    assert_eq!(
        std::fs::read_to_string(destination_root.join("index.html")).unwrap(),
        "<html>production</html>"
    );
    assert!(destination_root.join("wp-content/uploads/logo.png").exists());

    // Both sides produced a file archive and a config snapshot, all
    // checksummed and landed in the store layout.
    assert_eq!(finished.artifacts.len(), 4);
    let file_archives = finished
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::FileArchive)
        .count();
    assert_eq!(file_archives, 2);
    for artifact in &finished.artifacts {
        assert!(artifact.location.exists());
        assert!(artifact.checksum.is_some());
    }

    // Maintenance mode was enabled and then lifted again.
    assert!(
        !orchestrator
            .maintenance_controller()
            .is_active(&finished.config.destination)
    );
    // No rollback was invoked.
    assert!(orchestrator.rollback_engine().get_plan(&session.id).is_none());
}

struct FailAfterPartialCopy;

#[async_trait]
impl FileTransfer for FailAfterPartialCopy {
    async fn transfer(
        &self,
        config: &MigrationConfig,
        _cancel: &CancellationToken,
    ) -> Result<u64> {
        // Copy one file, then die: the destination is now dirty, which
        // is exactly what rollback exists for.
        let destination = config.destination.document_root.clone().unwrap();
        std::fs::write(destination.join("partial.html"), "half-moved").unwrap();
        Err(Error::transfer("connection reset by peer during transfer"))
    }
}

#[tokio::test]
async fn failed_transfer_rolls_back_from_newest_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator(dir.path()).with_file_transfer(Arc::new(FailAfterPartialCopy));
    let config = seeded_config(dir.path());

    let session = orchestrator.create_session(config).unwrap();
    let err = orchestrator
        .execute(&session.id, &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transfer(_)));

    let status = orchestrator.get_status(&session.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::RolledBack);
    assert_eq!(
        status.step("migrate_files").unwrap().status,
        StepStatus::Failed
    );
    // Verification never ran; it was skipped after the failure.
    assert_eq!(
        status.step("verify_post_migration").unwrap().status,
        StepStatus::Skipped
    );

    let plan = orchestrator
        .rollback_engine()
        .get_plan(&session.id)
        .unwrap();
    assert_eq!(plan.status, RollbackStatus::Completed);
    assert_eq!(plan.steps.len(), status.artifacts.len());

    // Strictly newest-first restore order.
    let sequences: Vec<u64> = plan.steps.iter().map(|s| s.artifact.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test]
async fn session_error_record_names_failing_step() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        orchestrator(dir.path()).with_file_transfer(Arc::new(FailAfterPartialCopy));
    let mut config = seeded_config(dir.path());
    config.transfer.auto_rollback = false;

    let session = orchestrator.create_session(config).unwrap();
    let _ = orchestrator.execute(&session.id, &NullReporter).await;

    let status = orchestrator.get_status(&session.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Failed);
    let error = status.error.as_ref().unwrap();
    assert_eq!(error.code, "transfer");
    assert_eq!(error.step_id.as_deref(), Some("migrate_files"));
    assert!(error.message.contains("connection reset"));
}
