//! On-disk artifact store.
//!
//! Layout: `<root>/<kind>/<source_label>/<filename>`, with
//! `<root>/temp/` for in-flight work. The filesystem is the source of
//! truth; the store keeps no in-memory index. Once stored, an
//! artifact's location, size, and checksum are immutable; deletion
//! removes the file and the caller's tracking entry in one call.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use siteshift_types::{Artifact, ArtifactKind};

use crate::digest::sha256_file;
use crate::error::{Error, Result};
use crate::retention::RetentionPolicy;

const TEMP_DIR: &str = "temp";

pub struct ArtifactStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

/// Aggregate statistics over everything under the store root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_artifacts: u64,
    pub total_bytes: u64,
    pub by_kind: BTreeMap<String, KindStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindStats {
    pub count: u64,
    pub bytes: u64,
    pub by_source: BTreeMap<String, u64>,
}

/// Verdict for one artifact in an integrity walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactHealth {
    Healthy,
    Missing,
    Unreadable,
    Corrupted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: u64,
    pub healthy: Vec<String>,
    pub missing: Vec<String>,
    pub unreadable: Vec<String>,
    pub corrupted: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty() && self.unreadable.is_empty() && self.corrupted.is_empty()
    }
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("cannot create store root {}: {e}", root.display())))?;
        Ok(ArtifactStore { root, retention })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Directory for artifacts of `kind` taken from `source_label`,
    /// created on demand.
    pub fn path_for(&self, kind: ArtifactKind, source_label: &str) -> Result<PathBuf> {
        let dir = self.root.join(kind.tag()).join(source_label);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::storage(format!("cannot create {}: {e}", dir.display())))?;
        Ok(dir)
    }

    /// Scratch space for in-flight work, created on demand.
    pub fn temp_path(&self) -> Result<PathBuf> {
        let dir = self.root.join(TEMP_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::storage(format!("cannot create {}: {e}", dir.display())))?;
        Ok(dir)
    }

    /// Move an artifact file into its store location and update the
    /// record's location. A no-op when the file is already in place.
    pub fn store(&self, artifact: &mut Artifact, source_path: &Path) -> Result<PathBuf> {
        let dir = self.path_for(artifact.kind, &artifact.source_system)?;
        let filename = artifact
            .location
            .file_name()
            .ok_or_else(|| Error::storage("artifact location has no filename".to_string()))?;
        let destination = dir.join(filename);

        if source_path != destination {
            fs::copy(source_path, &destination).map_err(|e| {
                Error::storage(format!(
                    "failed to store {} as {}: {e}",
                    source_path.display(),
                    destination.display()
                ))
            })?;
            if source_path.starts_with(self.root.join(TEMP_DIR)) {
                let _ = fs::remove_file(source_path);
            }
            artifact.location = destination.clone();
        }

        Ok(destination)
    }

    /// Location of an artifact's file; `NotFound` when absent.
    pub fn retrieve(&self, artifact: &Artifact) -> Result<PathBuf> {
        if !artifact.location.exists() {
            return Err(Error::not_found(format!(
                "artifact file not found: {}",
                artifact.location.display()
            )));
        }
        Ok(artifact.location.clone())
    }

    /// Delete an artifact's file. Returns whether a file was removed.
    pub fn delete(&self, artifact: &Artifact) -> Result<bool> {
        if artifact.location.exists() {
            fs::remove_file(&artifact.location).map_err(|e| {
                Error::storage(format!(
                    "failed to delete {}: {e}",
                    artifact.location.display()
                ))
            })?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Enumerate artifact files, optionally restricted by kind and
    /// source label. Temp space is never listed.
    pub fn list(
        &self,
        kind: Option<ArtifactKind>,
        source_label: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        let kind_dirs: Vec<PathBuf> = match kind {
            Some(kind) => vec![self.root.join(kind.tag())],
            None => read_dirs(&self.root)?
                .into_iter()
                .filter(|d| d.file_name().is_none_or(|n| n != TEMP_DIR))
                .collect(),
        };

        for kind_dir in kind_dirs {
            if !kind_dir.is_dir() {
                continue;
            }
            let source_dirs: Vec<PathBuf> = match source_label {
                Some(label) => vec![kind_dir.join(label)],
                None => read_dirs(&kind_dir)?,
            };
            for source_dir in source_dirs {
                if !source_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&source_dir)
                    .map_err(|e| Error::storage(format!("cannot list {}: {e}", source_dir.display())))?
                {
                    let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
                    if entry.path().is_file() {
                        files.push(entry.path());
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Walk the store and aggregate counts, sizes, and age extremes.
    pub fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        let mut oldest: Option<(SystemTime, PathBuf)> = None;
        let mut newest: Option<(SystemTime, PathBuf)> = None;

        for kind_dir in read_dirs(&self.root)? {
            let Some(kind_name) = kind_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if kind_name == TEMP_DIR || !kind_dir.is_dir() {
                continue;
            }
            let kind_stats = stats.by_kind.entry(kind_name.to_string()).or_default();

            for source_dir in read_dirs(&kind_dir)? {
                let Some(source_name) = source_dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !source_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&source_dir)
                    .map_err(|e| Error::storage(format!("cannot list {}: {e}", source_dir.display())))?
                {
                    let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    let meta = entry.metadata().map_err(|e| Error::storage(e.to_string()))?;
                    let size = meta.len();

                    stats.total_artifacts += 1;
                    stats.total_bytes += size;
                    kind_stats.count += 1;
                    kind_stats.bytes += size;
                    *kind_stats
                        .by_source
                        .entry(source_name.to_string())
                        .or_default() += 1;

                    if let Ok(mtime) = meta.modified() {
                        if oldest.as_ref().is_none_or(|(t, _)| mtime < *t) {
                            oldest = Some((mtime, path.clone()));
                        }
                        if newest.as_ref().is_none_or(|(t, _)| mtime > *t) {
                            newest = Some((mtime, path));
                        }
                    }
                }
            }
        }

        stats.oldest = oldest.map(|(_, p)| p);
        stats.newest = newest.map(|(_, p)| p);
        Ok(stats)
    }

    /// Verify every tracked artifact: existence, a one-byte readability
    /// probe, and (in deep mode) a full digest recomputation against the
    /// recorded checksum.
    pub fn verify_integrity(&self, artifacts: &[Artifact], deep: bool) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        for artifact in artifacts {
            report.checked += 1;
            let id = artifact.id.clone();

            if !artifact.location.exists() {
                report.missing.push(id);
                continue;
            }

            match fs::File::open(&artifact.location) {
                Ok(mut file) => {
                    let mut probe = [0u8; 1];
                    if file.read(&mut probe).is_err() {
                        report.unreadable.push(id);
                        continue;
                    }
                }
                Err(_) => {
                    report.unreadable.push(id);
                    continue;
                }
            }

            if deep && let Some(recorded) = &artifact.checksum {
                match sha256_file(&artifact.location) {
                    Ok(actual) if &actual == recorded => {}
                    Ok(_) => {
                        report.corrupted.push(id);
                        continue;
                    }
                    Err(_) => {
                        report.unreadable.push(id);
                        continue;
                    }
                }
            }

            report.healthy.push(id);
        }

        report
    }

    /// Delete temp files older than `max_age`. Returns how many were
    /// removed.
    pub fn cleanup_temp(&self, max_age: Duration) -> Result<usize> {
        let temp = self.root.join(TEMP_DIR);
        if !temp.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;

        for entry in fs::read_dir(&temp)
            .map_err(|e| Error::storage(format!("cannot list {}: {e}", temp.display())))?
        {
            let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| Error::storage(e.to_string()))?;
            if meta.modified().is_ok_and(|mtime| mtime < cutoff) {
                fs::remove_file(&path)
                    .map_err(|e| Error::storage(format!("cannot delete {}: {e}", path.display())))?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Apply the retention policy over the given artifact population and
    /// delete every artifact the policy evicts. Returns the evicted
    /// artifact ids.
    pub fn cleanup_expired(&self, all: &[Artifact]) -> Result<Vec<String>> {
        let (_, evicted) = self.retention.evaluate(all);
        let mut deleted = Vec::new();
        for artifact in evicted {
            if self.delete(artifact)? {
                deleted.push(artifact.id.clone());
            }
        }
        Ok(deleted)
    }
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::storage(format!("cannot list {}: {e}", dir.display())))?
    {
        let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
        out.push(entry.path());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::io::Write;

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::new(dir.join("backups"), RetentionPolicy::keep_everything()).unwrap()
    }

    fn seed_artifact(store: &ArtifactStore, id: &str, age_days: i64, content: &[u8]) -> Artifact {
        let dir = store
            .path_for(ArtifactKind::FileArchive, "web")
            .unwrap();
        let path = dir.join(format!("files_{id}.tar.gz"));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        drop(f);

        Artifact {
            id: id.to_string(),
            kind: ArtifactKind::FileArchive,
            source_system: "web".to_string(),
            location: path,
            size: content.len() as u64,
            checksum: Some(crate::digest::sha256_bytes(content)),
            created_at: Utc::now() - TimeDelta::days(age_days),
            sequence: 0,
            expires_at: None,
            compression_used: true,
            encryption_used: false,
            verified: false,
            verification_date: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = store
            .path_for(ArtifactKind::DatabaseDump, "db.example.com")
            .unwrap();
        assert!(path.ends_with("database_dump/db.example.com"));
        assert!(path.is_dir());
        assert!(store.temp_path().unwrap().ends_with("temp"));
    }

    #[test]
    fn test_store_moves_temp_file_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let temp = store.temp_path().unwrap().join("files_x_20250101_000000.tar.gz");
        fs::write(&temp, b"archive-bytes").unwrap();

        let mut artifact = seed_artifact(&store, "x", 0, b"placeholder");
        fs::remove_file(&artifact.location).unwrap();
        artifact.location = temp.clone();

        let stored = store.store(&mut artifact, &temp).unwrap();
        assert!(stored.exists());
        assert!(!temp.exists());
        assert_eq!(artifact.location, stored);
    }

    #[test]
    fn test_retrieve_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let artifact = seed_artifact(&store, "gone", 0, b"data");
        fs::remove_file(&artifact.location).unwrap();
        let err = store.retrieve(&artifact).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let artifact = seed_artifact(&store, "d", 0, b"data");
        assert!(store.delete(&artifact).unwrap());
        assert!(!store.delete(&artifact).unwrap());
    }

    #[test]
    fn test_list_skips_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_artifact(&store, "a", 0, b"one");
        fs::write(store.temp_path().unwrap().join("scratch"), b"x").unwrap();

        let all = store.list(None, None).unwrap();
        assert_eq!(all.len(), 1);
        let by_kind = store.list(Some(ArtifactKind::FileArchive), Some("web")).unwrap();
        assert_eq!(by_kind.len(), 1);
        let none = store.list(Some(ArtifactKind::Configuration), None).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_stats_counts_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed_artifact(&store, "a", 0, b"12345");
        seed_artifact(&store, "b", 0, b"123");

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_artifacts, 2);
        assert_eq!(stats.total_bytes, 8);
        assert_eq!(stats.by_kind["file_archive"].count, 2);
        assert_eq!(stats.by_kind["file_archive"].by_source["web"], 2);
        assert!(stats.newest.is_some());
    }

    #[test]
    fn test_verify_integrity_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let healthy = seed_artifact(&store, "ok", 0, b"fine");
        let missing = {
            let a = seed_artifact(&store, "gone", 0, b"bye");
            fs::remove_file(&a.location).unwrap();
            a
        };
        let corrupted = {
            let a = seed_artifact(&store, "bad", 0, b"original");
            fs::write(&a.location, b"tampered").unwrap();
            a
        };

        let report = store.verify_integrity(&[healthy, missing, corrupted], true);
        assert_eq!(report.checked, 3);
        assert_eq!(report.healthy, vec!["ok"]);
        assert_eq!(report.missing, vec!["gone"]);
        assert_eq!(report.corrupted, vec!["bad"]);
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_shallow_integrity_ignores_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tampered = {
            let a = seed_artifact(&store, "t", 0, b"original");
            fs::write(&a.location, b"tampered").unwrap();
            a
        };
        let report = store.verify_integrity(&[tampered], false);
        assert_eq!(report.healthy.len(), 1);
    }

    #[test]
    fn test_cleanup_expired_respects_max_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(
            dir.path().join("backups"),
            RetentionPolicy::with_max_count(10),
        )
        .unwrap();

        // 15 artifacts spanning 120 days of creation times.
        let all: Vec<Artifact> = (0..15)
            .map(|i| seed_artifact(&store, &format!("r{i}"), (i * 8) as i64, b"payload"))
            .collect();

        let deleted = store.cleanup_expired(&all).unwrap();
        assert_eq!(deleted.len(), 5);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_artifacts, 10);

        // Every deleted artifact is older than every survivor.
        let deleted_max = all
            .iter()
            .filter(|a| deleted.contains(&a.id))
            .map(|a| a.created_at)
            .max()
            .unwrap();
        let kept_min = all
            .iter()
            .filter(|a| !deleted.contains(&a.id))
            .map(|a| a.created_at)
            .min()
            .unwrap();
        assert!(deleted_max < kept_min);
    }

    #[test]
    fn test_cleanup_temp_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let stale = store.temp_path().unwrap().join("stale");
        fs::write(&stale, b"x").unwrap();

        // Everything is younger than an hour; nothing goes.
        assert_eq!(store.cleanup_temp(Duration::from_secs(3600)).unwrap(), 0);
        // Zero tolerance deletes it.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.cleanup_temp(Duration::ZERO).unwrap(), 1);
        assert!(!stale.exists());
    }
}
