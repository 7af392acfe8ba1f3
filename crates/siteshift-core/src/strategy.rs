//! Backup strategies.
//!
//! A strategy is polymorphic over {create, verify, restore} and is
//! selected by the artifact kind tag. Artifacts carry enough metadata
//! to reconstruct their strategy at rollback time
//! ([`strategy_for_artifact`]); they never hold a reference to one.
//!
//! Produced files are named `<family>_<backupId>_<YYYYMMDD_HHMMSS>.<ext>`
//! with UTC, zero-padded timestamps.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use siteshift_types::{
    Artifact, ArtifactKind, BackupOptions, DatabaseConfig, EngineFamily, RestoreOptions,
    SystemConfig,
};

use crate::digest::sha256_file;
use crate::error::{Error, Result};
use crate::process::CommandSpec;

/// Process-wide monotonic sequence for artifact ordering. Rollback
/// sorts on this, not on wall-clock creation time.
static ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub fn next_artifact_sequence() -> u64 {
    ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Build the canonical backup filename for `kind`.
pub fn backup_filename(kind: ArtifactKind, backup_id: &str, ext: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}_{}.{}", kind.family(), backup_id, timestamp, ext)
}

/// The polymorphic backup capability set.
///
/// `restore` runs `verify` first and fails fast when it does not pass.
pub trait BackupStrategy: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact>;

    fn verify(&self, artifact: &Artifact) -> bool;

    fn restore(
        &self,
        artifact: &Artifact,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<bool>;
}

fn finish_artifact(
    id: &str,
    kind: ArtifactKind,
    source_system: String,
    location: PathBuf,
    compression_used: bool,
    expires_after_days: Option<u32>,
    metadata: BTreeMap<String, serde_json::Value>,
) -> Result<Artifact> {
    let checksum = sha256_file(&location)?;
    let size = fs::metadata(&location)
        .map_err(|e| Error::backup(format!("cannot stat {}: {e}", location.display())))?
        .len();
    let created_at = Utc::now();
    Ok(Artifact {
        id: id.to_string(),
        kind,
        source_system,
        location,
        size,
        checksum: Some(checksum),
        created_at,
        sequence: next_artifact_sequence(),
        expires_at: expires_after_days
            .map(|days| created_at + chrono::TimeDelta::days(days as i64)),
        compression_used,
        encryption_used: false,
        verified: false,
        verification_date: None,
        metadata,
    })
}

fn checksum_matches(artifact: &Artifact) -> bool {
    match &artifact.checksum {
        Some(recorded) => sha256_file(&artifact.location)
            .map(|actual| &actual == recorded)
            .unwrap_or(false),
        // An artifact without a digest can still be structurally probed.
        None => true,
    }
}

// ---------------------------------------------------------------------------
// File archives
// ---------------------------------------------------------------------------

/// Gzip-compressed tar of one or more source paths, honoring an
/// exclusion filter evaluated against each entry's logical name.
pub struct FileArchiveStrategy {
    pub system: SystemConfig,
}

impl FileArchiveStrategy {
    pub fn new(system: SystemConfig) -> Self {
        FileArchiveStrategy { system }
    }

    fn append_tree<W: Write>(
        builder: &mut tar::Builder<W>,
        source: &Path,
        logical: &str,
        exclude: &[String],
    ) -> Result<()> {
        let excluded = |name: &str| exclude.iter().any(|pattern| name.contains(pattern));
        if excluded(logical) {
            return Ok(());
        }

        if source.is_dir() {
            builder
                .append_dir(logical, source)
                .map_err(|e| Error::backup(format!("archive error at {logical}: {e}")))?;
            for entry in fs::read_dir(source)
                .map_err(|e| Error::backup(format!("cannot read {}: {e}", source.display())))?
            {
                let entry = entry.map_err(|e| Error::backup(e.to_string()))?;
                let child = entry.path();
                let child_logical =
                    format!("{logical}/{}", entry.file_name().to_string_lossy());
                Self::append_tree(builder, &child, &child_logical, exclude)?;
            }
        } else {
            builder
                .append_path_with_name(source, logical)
                .map_err(|e| Error::backup(format!("archive error at {logical}: {e}")))?;
        }
        Ok(())
    }

    fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
        let mut file = File::open(path)
            .map_err(|e| Error::backup(format!("cannot open {}: {e}", path.display())))?;
        let mut magic = [0u8; 2];
        let n = file
            .read(&mut magic)
            .map_err(|e| Error::backup(e.to_string()))?;
        let file = File::open(path).map_err(|e| Error::backup(e.to_string()))?;
        let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(tar::Archive::new(reader))
    }
}

impl BackupStrategy for FileArchiveStrategy {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::FileArchive
    }

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact> {
        if options.source_paths.is_empty() {
            return Err(Error::backup("no source paths specified for file backup"));
        }

        fs::create_dir_all(destination)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", destination.display())))?;
        let filename = backup_filename(self.kind(), backup_id, "tar.gz");
        let archive_path = destination.join(&filename);

        let file = File::create(&archive_path)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", archive_path.display())))?;

        let build = |writer: &mut dyn Write| -> Result<()> {
            let mut builder = tar::Builder::new(writer);
            for source in &options.source_paths {
                if !source.exists() {
                    continue;
                }
                let logical = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "root".to_string());
                Self::append_tree(&mut builder, source, &logical, &options.exclude_patterns)?;
            }
            builder
                .finish()
                .map_err(|e| Error::backup(format!("archive finalize failed: {e}")))?;
            Ok(())
        };

        if options.compression {
            let mut encoder = GzEncoder::new(file, Compression::default());
            build(&mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::backup(format!("gzip finalize failed: {e}")))?;
        } else {
            let mut plain = file;
            build(&mut plain)?;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backup_type".to_string(),
            serde_json::json!(self.kind().tag()),
        );
        metadata.insert(
            "source_paths".to_string(),
            serde_json::json!(options.source_paths),
        );
        if !options.exclude_patterns.is_empty() {
            metadata.insert(
                "exclude_patterns".to_string(),
                serde_json::json!(options.exclude_patterns),
            );
        }
        metadata.insert(
            "compression".to_string(),
            serde_json::json!(if options.compression { "gzip" } else { "none" }),
        );

        finish_artifact(
            backup_id,
            self.kind(),
            self.system.kind.to_string(),
            archive_path,
            options.compression,
            options.expires_after_days,
            metadata,
        )
    }

    fn verify(&self, artifact: &Artifact) -> bool {
        if !artifact.location.exists() || !checksum_matches(artifact) {
            return false;
        }
        // Structural probe: the table of contents must be readable.
        let Ok(mut archive) = Self::open_archive(&artifact.location) else {
            return false;
        };
        match archive.entries() {
            Ok(entries) => {
                let mut count = 0usize;
                for entry in entries {
                    if entry.is_err() {
                        return false;
                    }
                    count += 1;
                }
                count > 0
            }
            Err(_) => false,
        }
    }

    fn restore(
        &self,
        artifact: &Artifact,
        target: &Path,
        _options: &RestoreOptions,
    ) -> Result<bool> {
        if !self.verify(artifact) {
            return Err(Error::backup("backup verification failed before restore"));
        }
        fs::create_dir_all(target)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", target.display())))?;
        let mut archive = Self::open_archive(&artifact.location)?;
        archive
            .unpack(target)
            .map_err(|e| Error::backup(format!("archive extraction failed: {e}")))?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Relational dumps
// ---------------------------------------------------------------------------

/// Drives the engine family's external dumper; credentials go on the
/// command line for the mysql family and through `PGPASSWORD` for the
/// postgres family, never on argv.
pub struct RelationalDumpStrategy {
    pub db: DatabaseConfig,
    /// Per-invocation timeout for the external tools.
    pub tool_timeout: Duration,
}

impl RelationalDumpStrategy {
    pub fn new(db: DatabaseConfig) -> Self {
        RelationalDumpStrategy {
            db,
            tool_timeout: crate::process::DEFAULT_TIMEOUT,
        }
    }

    fn dump_command(&self, output: &Path, schema_only: bool) -> Result<CommandSpec> {
        let db = &self.db;
        let name = db.database.clone().unwrap_or_default();
        let spec = match db.family.base() {
            EngineFamily::Mysql => {
                let mut spec = CommandSpec::new("mysqldump")
                    .arg(format!("--host={}", db.host))
                    .arg(format!("--port={}", db.effective_port()))
                    .arg(format!("--user={}", db.username.clone().unwrap_or_default()))
                    .arg(format!(
                        "--password={}",
                        db.password.clone().unwrap_or_default()
                    ))
                    .arg("--single-transaction")
                    .arg("--routines")
                    .arg("--triggers")
                    .arg("--add-drop-table");
                if schema_only {
                    spec = spec.arg("--no-data");
                }
                spec.arg(&name).stdout_file(output)
            }
            EngineFamily::Postgres => {
                let mut spec = CommandSpec::new("pg_dump")
                    .arg(format!("--host={}", db.host))
                    .arg(format!("--port={}", db.effective_port()))
                    .arg(format!(
                        "--username={}",
                        db.username.clone().unwrap_or_default()
                    ))
                    .arg("--clean")
                    .arg("--if-exists")
                    .env("PGPASSWORD", db.password.clone().unwrap_or_default());
                if schema_only {
                    spec = spec.arg("--schema-only");
                }
                spec.arg(&name).stdout_file(output)
            }
            EngineFamily::Sqlite => {
                let path = db
                    .database_path
                    .as_ref()
                    .ok_or_else(|| Error::config("sqlite dump requires database_path"))?;
                CommandSpec::new("sqlite3")
                    .arg(path.to_string_lossy().to_string())
                    .arg(".dump")
                    .stdout_file(output)
            }
            EngineFamily::Mongodb => {
                let mut spec = CommandSpec::new("mongodump")
                    .arg("--host")
                    .arg(format!("{}:{}", db.host, db.effective_port()))
                    .arg("--db")
                    .arg(&name)
                    .arg("--archive")
                    .arg(output.to_string_lossy().to_string());
                if let Some(user) = &db.username {
                    spec = spec.arg("--username").arg(user);
                }
                if let Some(pass) = &db.password {
                    spec = spec.arg("--password").arg(pass);
                }
                spec
            }
            other => {
                return Err(Error::backup(format!(
                    "unsupported database family for dump: {other}"
                )));
            }
        };
        Ok(spec.timeout(self.tool_timeout))
    }

    fn restore_command(&self, dump: &Path, options: &RestoreOptions) -> Result<CommandSpec> {
        let db = &self.db;
        let name = db.database.clone().unwrap_or_default();
        let spec = match db.family.base() {
            EngineFamily::Mysql => CommandSpec::new("mysql")
                .arg(format!("--host={}", db.host))
                .arg(format!("--port={}", db.effective_port()))
                .arg(format!("--user={}", db.username.clone().unwrap_or_default()))
                .arg(format!(
                    "--password={}",
                    db.password.clone().unwrap_or_default()
                ))
                .arg(&name)
                .stdin_file(dump),
            EngineFamily::Postgres => CommandSpec::new("psql")
                .arg(format!("--host={}", db.host))
                .arg(format!("--port={}", db.effective_port()))
                .arg(format!(
                    "--username={}",
                    db.username.clone().unwrap_or_default()
                ))
                .arg("--dbname")
                .arg(&name)
                .env("PGPASSWORD", db.password.clone().unwrap_or_default())
                .stdin_file(dump),
            EngineFamily::Sqlite => {
                let path = db
                    .database_path
                    .as_ref()
                    .ok_or_else(|| Error::config("sqlite restore requires database_path"))?;
                CommandSpec::new("sqlite3")
                    .arg(path.to_string_lossy().to_string())
                    .stdin_file(dump)
            }
            EngineFamily::Mongodb => {
                let mut spec = CommandSpec::new("mongorestore")
                    .arg("--host")
                    .arg(format!("{}:{}", db.host, db.effective_port()))
                    .arg("--archive")
                    .arg(dump.to_string_lossy().to_string());
                if let Some(user) = &db.username {
                    spec = spec.arg("--username").arg(user);
                }
                if let Some(pass) = &db.password {
                    spec = spec.arg("--password").arg(pass);
                }
                if options.drop_existing {
                    spec = spec.arg("--drop");
                }
                spec
            }
            other => {
                return Err(Error::backup(format!(
                    "unsupported database family for restore: {other}"
                )));
            }
        };
        Ok(spec.timeout(self.tool_timeout))
    }

    /// Family-expected keywords probed in the leading region of a dump.
    fn expected_keywords(family: EngineFamily) -> &'static [&'static str] {
        match family.base() {
            EngineFamily::Mysql => &["CREATE", "INSERT", "DROP", "USE"],
            EngineFamily::Postgres => &["CREATE", "INSERT", "DROP", "\\CONNECT"],
            EngineFamily::Sqlite => &["CREATE", "INSERT", "PRAGMA"],
            _ => &["CREATE", "INSERT"],
        }
    }
}

impl BackupStrategy for RelationalDumpStrategy {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::DatabaseDump
    }

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact> {
        fs::create_dir_all(destination)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", destination.display())))?;

        let ext = if self.db.family.base() == EngineFamily::Mongodb {
            "archive"
        } else {
            "sql"
        };
        let dump_path = destination.join(backup_filename(self.kind(), backup_id, ext));

        let output = self.dump_command(&dump_path, options.schema_only)?.run()?;
        if !output.success() {
            let _ = fs::remove_file(&dump_path);
            return Err(Error::backup(format!(
                "{} dump failed: {}",
                self.db.family,
                output.stderr.trim()
            )));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backup_type".to_string(),
            serde_json::json!(self.kind().tag()),
        );
        metadata.insert(
            "database_type".to_string(),
            serde_json::json!(self.db.family.tag()),
        );
        if let Some(name) = &self.db.database {
            metadata.insert("database_name".to_string(), serde_json::json!(name));
        }

        finish_artifact(
            backup_id,
            self.kind(),
            self.db.family.tag().to_string(),
            dump_path,
            false,
            options.expires_after_days,
            metadata,
        )
    }

    fn verify(&self, artifact: &Artifact) -> bool {
        if !artifact.location.exists() || !checksum_matches(artifact) {
            return false;
        }
        let Ok(meta) = fs::metadata(&artifact.location) else {
            return false;
        };
        if meta.len() == 0 {
            return false;
        }

        // Mongo archives are binary; presence and digest are the probe.
        if self.db.family.base() == EngineFamily::Mongodb {
            return true;
        }

        let Ok(mut file) = File::open(&artifact.location) else {
            return false;
        };
        let mut head = vec![0u8; 10_240];
        let n = file.read(&mut head).unwrap_or(0);
        head.truncate(n);
        let content = String::from_utf8_lossy(&head).to_uppercase();
        Self::expected_keywords(self.db.family)
            .iter()
            .any(|kw| content.contains(&kw.to_uppercase()))
    }

    fn restore(
        &self,
        artifact: &Artifact,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<bool> {
        if !self.verify(artifact) {
            return Err(Error::backup("backup verification failed before restore"));
        }

        // Embedded engines restore into a fresh file under the target
        // directory rather than clobbering the live database.
        let spec = if self.db.family.base() == EngineFamily::Sqlite {
            fs::create_dir_all(target)
                .map_err(|e| Error::backup(format!("cannot create {}: {e}", target.display())))?;
            let original = self
                .db
                .database_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "database.sqlite".to_string());
            let restored = target.join(format!("restored_{original}"));
            CommandSpec::new("sqlite3")
                .arg(restored.to_string_lossy().to_string())
                .stdin_file(&artifact.location)
                .timeout(self.tool_timeout)
        } else {
            self.restore_command(&artifact.location, options)?
        };

        let output = spec.run()?;
        if !output.success() {
            return Err(Error::backup(format!(
                "{} restore failed: {}",
                self.db.family,
                output.stderr.trim()
            )));
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Key-value dumps
// ---------------------------------------------------------------------------

/// Key-value backups use the engine's native archive format: an RDB
/// snapshot produced by `redis-cli --rdb`. Restore places the verified
/// snapshot where the engine's native loader picks it up.
pub struct KeyValueDumpStrategy {
    pub db: DatabaseConfig,
    pub tool_timeout: Duration,
}

/// RDB files open with this magic.
const RDB_MAGIC: &[u8] = b"REDIS";

impl KeyValueDumpStrategy {
    pub fn new(db: DatabaseConfig) -> Self {
        KeyValueDumpStrategy {
            db,
            tool_timeout: crate::process::DEFAULT_TIMEOUT,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.db.host.clone(),
            "-p".to_string(),
            self.db.effective_port().to_string(),
        ];
        if let Some(pass) = &self.db.password {
            args.push("-a".to_string());
            args.push(pass.clone());
        }
        if let Some(index) = self.db.db_index {
            args.push("-n".to_string());
            args.push(index.to_string());
        }
        args
    }
}

impl BackupStrategy for KeyValueDumpStrategy {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::KeyValueDump
    }

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact> {
        fs::create_dir_all(destination)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", destination.display())))?;
        let dump_path = destination.join(backup_filename(self.kind(), backup_id, "archive"));

        let output = CommandSpec::new("redis-cli")
            .args(self.base_args())
            .arg("--rdb")
            .arg(dump_path.to_string_lossy().to_string())
            .timeout(self.tool_timeout)
            .run()?;
        if !output.success() {
            let _ = fs::remove_file(&dump_path);
            return Err(Error::backup(format!(
                "redis rdb snapshot failed: {}",
                output.stderr.trim()
            )));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backup_type".to_string(),
            serde_json::json!(self.kind().tag()),
        );
        metadata.insert("database_type".to_string(), serde_json::json!("redis"));
        if let Some(index) = self.db.db_index {
            metadata.insert("db_index".to_string(), serde_json::json!(index));
        }

        finish_artifact(
            backup_id,
            self.kind(),
            self.db.family.tag().to_string(),
            dump_path,
            false,
            options.expires_after_days,
            metadata,
        )
    }

    fn verify(&self, artifact: &Artifact) -> bool {
        if !artifact.location.exists() || !checksum_matches(artifact) {
            return false;
        }
        let Ok(mut file) = File::open(&artifact.location) else {
            return false;
        };
        let mut magic = [0u8; 5];
        match file.read(&mut magic) {
            Ok(5) => magic == RDB_MAGIC[..5],
            _ => false,
        }
    }

    fn restore(
        &self,
        artifact: &Artifact,
        target: &Path,
        _options: &RestoreOptions,
    ) -> Result<bool> {
        if !self.verify(artifact) {
            return Err(Error::backup("backup verification failed before restore"));
        }
        // The native loader reads dump.rdb from the data directory on
        // startup; restoring means putting the verified snapshot there.
        fs::create_dir_all(target)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", target.display())))?;
        let restored = target.join("dump.rdb");
        fs::copy(&artifact.location, &restored)
            .map_err(|e| Error::backup(format!("cannot place rdb snapshot: {e}")))?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Configuration snapshots
// ---------------------------------------------------------------------------

/// Per-file read failures are recorded with this prefix instead of
/// aborting the snapshot.
pub const CONFIG_READ_ERROR_SENTINEL: &str = "Error reading file:";

pub struct ConfigSnapshotStrategy {
    pub system: SystemConfig,
}

impl ConfigSnapshotStrategy {
    pub fn new(system: SystemConfig) -> Self {
        ConfigSnapshotStrategy { system }
    }
}

impl BackupStrategy for ConfigSnapshotStrategy {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Configuration
    }

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact> {
        fs::create_dir_all(destination)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", destination.display())))?;
        let snapshot_path = destination.join(backup_filename(self.kind(), backup_id, "json"));

        let mut config_files = serde_json::Map::new();
        for file in &options.config_files {
            let key = file.to_string_lossy().to_string();
            let value = match fs::read_to_string(file) {
                Ok(contents) => contents,
                Err(e) => format!("{CONFIG_READ_ERROR_SENTINEL} {e}"),
            };
            config_files.insert(key, serde_json::Value::String(value));
        }

        let snapshot = serde_json::json!({
            "backup_id": backup_id,
            "timestamp": Utc::now().to_rfc3339(),
            "system_config": serde_json::to_value(&self.system)
                .map_err(|e| Error::backup(format!("cannot serialize system config: {e}")))?,
            "config_data": options.config_data.clone().unwrap_or(serde_json::json!({})),
            "config_files": serde_json::Value::Object(config_files),
        });

        let mut file = File::create(&snapshot_path)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", snapshot_path.display())))?;
        let body = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::backup(format!("cannot serialize snapshot: {e}")))?;
        file.write_all(body.as_bytes())
            .map_err(|e| Error::backup(format!("cannot write snapshot: {e}")))?;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backup_type".to_string(),
            serde_json::json!(self.kind().tag()),
        );
        metadata.insert(
            "config_files".to_string(),
            serde_json::json!(options.config_files),
        );

        finish_artifact(
            backup_id,
            self.kind(),
            self.system.kind.to_string(),
            snapshot_path,
            false,
            options.expires_after_days,
            metadata,
        )
    }

    fn verify(&self, artifact: &Artifact) -> bool {
        if !artifact.location.exists() || !checksum_matches(artifact) {
            return false;
        }
        let Ok(contents) = fs::read_to_string(&artifact.location) else {
            return false;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
            return false;
        };
        ["backup_id", "timestamp", "system_config"]
            .iter()
            .all(|key| value.get(key).is_some())
    }

    fn restore(
        &self,
        artifact: &Artifact,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<bool> {
        if !self.verify(artifact) {
            return Err(Error::backup("backup verification failed before restore"));
        }

        let contents = fs::read_to_string(&artifact.location)
            .map_err(|e| Error::backup(format!("cannot read snapshot: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| Error::backup(format!("invalid snapshot JSON: {e}")))?;

        let Some(files) = value.get("config_files").and_then(|v| v.as_object()) else {
            return Ok(true);
        };

        for (path, content) in files {
            let Some(content) = content.as_str() else {
                continue;
            };
            if content.starts_with(CONFIG_READ_ERROR_SENTINEL) {
                continue;
            }
            // Absolute capture paths are re-rooted under the target so
            // restores never write outside it.
            let relative: PathBuf = Path::new(path)
                .components()
                .filter(|c| matches!(c, std::path::Component::Normal(_)))
                .collect();
            let restored = target.join(relative);
            if restored.exists() && !options.overwrite {
                continue;
            }
            if let Some(parent) = restored.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::backup(format!("cannot create {}: {e}", parent.display())))?;
            }
            fs::write(&restored, content)
                .map_err(|e| Error::backup(format!("cannot write {}: {e}", restored.display())))?;
        }

        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Cloud snapshots
// ---------------------------------------------------------------------------

/// JSON manifest of provider, region, and enumerated resources.
/// Restoration is provider-driven and deliberately fails requiring
/// operator action; it never silently succeeds.
pub struct CloudSnapshotStrategy {
    pub system: SystemConfig,
}

impl CloudSnapshotStrategy {
    pub fn new(system: SystemConfig) -> Self {
        CloudSnapshotStrategy { system }
    }
}

impl BackupStrategy for CloudSnapshotStrategy {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::CloudResources
    }

    fn create(
        &self,
        backup_id: &str,
        destination: &Path,
        options: &BackupOptions,
    ) -> Result<Artifact> {
        fs::create_dir_all(destination)
            .map_err(|e| Error::backup(format!("cannot create {}: {e}", destination.display())))?;
        let snapshot_path = destination.join(backup_filename(self.kind(), backup_id, "json"));

        let provider = self
            .system
            .cloud
            .as_ref()
            .map(|c| c.provider.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let snapshot = serde_json::json!({
            "backup_id": backup_id,
            "timestamp": Utc::now().to_rfc3339(),
            "cloud_provider": provider,
            "resources": options.resources.clone().unwrap_or(serde_json::json!({})),
            "configurations": options.config_data.clone().unwrap_or(serde_json::json!({})),
            "metadata": {
                "region": self.system.cloud.as_ref().map(|c| c.region.clone()),
            },
        });

        fs::write(
            &snapshot_path,
            serde_json::to_string_pretty(&snapshot)
                .map_err(|e| Error::backup(format!("cannot serialize manifest: {e}")))?,
        )
        .map_err(|e| Error::backup(format!("cannot write manifest: {e}")))?;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backup_type".to_string(),
            serde_json::json!(self.kind().tag()),
        );
        metadata.insert("cloud_provider".to_string(), serde_json::json!(provider));

        finish_artifact(
            backup_id,
            self.kind(),
            self.system.kind.to_string(),
            snapshot_path,
            false,
            options.expires_after_days,
            metadata,
        )
    }

    fn verify(&self, artifact: &Artifact) -> bool {
        if !artifact.location.exists() || !checksum_matches(artifact) {
            return false;
        }
        let Ok(contents) = fs::read_to_string(&artifact.location) else {
            return false;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
            return false;
        };
        ["backup_id", "timestamp", "cloud_provider"]
            .iter()
            .all(|key| value.get(key).is_some())
    }

    fn restore(
        &self,
        artifact: &Artifact,
        _target: &Path,
        _options: &RestoreOptions,
    ) -> Result<bool> {
        if !self.verify(artifact) {
            return Err(Error::backup("backup verification failed before restore"));
        }
        Err(Error::rollback(format!(
            "cloud resource restore for backup {} requires manual intervention with the \
             provider's tooling; the manifest at {} enumerates the affected resources",
            artifact.id,
            artifact.location.display()
        )))
    }
}

// ---------------------------------------------------------------------------
// Kind-tag routing
// ---------------------------------------------------------------------------

/// Rebuild the strategy an artifact was produced by, from its kind tag
/// and metadata. Dump kinds need the database connection settings of
/// the restore destination.
pub fn strategy_for_artifact(
    artifact: &Artifact,
    system: &SystemConfig,
    db: Option<&DatabaseConfig>,
) -> Result<Box<dyn BackupStrategy>> {
    match artifact.kind {
        ArtifactKind::FileArchive => Ok(Box::new(FileArchiveStrategy::new(system.clone()))),
        ArtifactKind::Configuration => Ok(Box::new(ConfigSnapshotStrategy::new(system.clone()))),
        ArtifactKind::CloudResources => Ok(Box::new(CloudSnapshotStrategy::new(system.clone()))),
        ArtifactKind::DatabaseDump => {
            let db = db.ok_or_else(|| {
                Error::rollback("database configuration required to restore a database dump")
            })?;
            Ok(Box::new(RelationalDumpStrategy::new(db.clone())))
        }
        ArtifactKind::KeyValueDump => {
            let db = db.ok_or_else(|| {
                Error::rollback("database configuration required to restore a key-value dump")
            })?;
            Ok(Box::new(KeyValueDumpStrategy::new(db.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteshift_types::SystemKind;

    fn system() -> SystemConfig {
        SystemConfig {
            kind: SystemKind::StaticSite,
            host: "web.example.com".to_string(),
            port: Some(443),
            document_root: None,
            cloud: None,
        }
    }

    fn file_options(paths: Vec<PathBuf>) -> BackupOptions {
        BackupOptions {
            source_paths: paths,
            ..Default::default()
        }
    }

    #[test]
    fn test_backup_filename_format() {
        let name = backup_filename(ArtifactKind::FileArchive, "abc123", "tar.gz");
        assert!(name.starts_with("files_abc123_"));
        assert!(name.ends_with(".tar.gz"));
        // files_abc123_YYYYMMDD_HHMMSS.tar.gz
        let stem = name.strip_suffix(".tar.gz").unwrap();
        let parts: Vec<&str> = stem.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[3].len(), 6);
    }

    #[test]
    fn test_artifact_sequence_is_monotonic() {
        let a = next_artifact_sequence();
        let b = next_artifact_sequence();
        assert!(b > a);
    }

    #[test]
    fn test_file_archive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("site");
        fs::create_dir_all(source.join("assets")).unwrap();
        fs::write(source.join("index.html"), "<html>hi</html>").unwrap();
        fs::write(source.join("assets").join("app.js"), "console.log(1)").unwrap();

        let strategy = FileArchiveStrategy::new(system());
        let dest = dir.path().join("backups");
        let artifact = strategy
            .create("rt1", &dest, &file_options(vec![source.clone()]))
            .unwrap();

        assert!(artifact.location.exists());
        assert!(artifact.size > 0);
        assert!(artifact.checksum.is_some());
        assert!(strategy.verify(&artifact));

        let restored = dir.path().join("restored");
        assert!(
            strategy
                .restore(&artifact, &restored, &RestoreOptions::default())
                .unwrap()
        );
        assert_eq!(
            fs::read_to_string(restored.join("site/index.html")).unwrap(),
            "<html>hi</html>"
        );
        assert_eq!(
            fs::read_to_string(restored.join("site/assets/app.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[test]
    fn test_file_archive_exclusion_filter() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("site");
        fs::create_dir_all(source.join("cache")).unwrap();
        fs::write(source.join("keep.txt"), "keep").unwrap();
        fs::write(source.join("cache").join("drop.txt"), "drop").unwrap();

        let strategy = FileArchiveStrategy::new(system());
        let mut options = file_options(vec![source.clone()]);
        options.exclude_patterns = vec!["cache".to_string()];
        let artifact = strategy
            .create("ex1", &dir.path().join("backups"), &options)
            .unwrap();

        let restored = dir.path().join("restored");
        strategy
            .restore(&artifact, &restored, &RestoreOptions::default())
            .unwrap();
        assert!(restored.join("site/keep.txt").exists());
        assert!(!restored.join("site/cache").exists());
    }

    #[test]
    fn test_file_archive_requires_sources() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = FileArchiveStrategy::new(system());
        let err = strategy
            .create("none", dir.path(), &BackupOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Backup(_)));
    }

    #[test]
    fn test_file_archive_verify_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("site");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), "a").unwrap();

        let strategy = FileArchiveStrategy::new(system());
        let artifact = strategy
            .create("tamper", &dir.path().join("backups"), &file_options(vec![source]))
            .unwrap();

        fs::write(&artifact.location, b"not a tar").unwrap();
        assert!(!strategy.verify(&artifact));
        assert!(
            strategy
                .restore(&artifact, &dir.path().join("r"), &RestoreOptions::default())
                .is_err()
        );
    }

    #[test]
    fn test_config_snapshot_roundtrip_with_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("app.conf");
        fs::write(&present, "debug = false\n").unwrap();
        let absent = dir.path().join("missing.conf");

        let strategy = ConfigSnapshotStrategy::new(system());
        let options = BackupOptions {
            config_files: vec![present.clone(), absent.clone()],
            config_data: Some(serde_json::json!({"php_version": "8.3"})),
            ..Default::default()
        };
        let artifact = strategy
            .create("cfg1", &dir.path().join("backups"), &options)
            .unwrap();
        assert!(strategy.verify(&artifact));

        // The missing file is recorded with the sentinel, not an error.
        let body: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&artifact.location).unwrap()).unwrap();
        let files = body["config_files"].as_object().unwrap();
        assert!(
            files[&absent.to_string_lossy().to_string()]
                .as_str()
                .unwrap()
                .starts_with(CONFIG_READ_ERROR_SENTINEL)
        );

        let restored = dir.path().join("restored");
        assert!(
            strategy
                .restore(&artifact, &restored, &RestoreOptions::default())
                .unwrap()
        );
        // Present file restored under the re-rooted path; sentinel skipped.
        let rerooted: PathBuf = present
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        assert_eq!(
            fs::read_to_string(restored.join(&rerooted)).unwrap(),
            "debug = false\n"
        );
        let absent_rerooted: PathBuf = absent
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        assert!(!restored.join(absent_rerooted).exists());
    }

    #[test]
    fn test_config_snapshot_verify_requires_fields() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = ConfigSnapshotStrategy::new(system());
        let artifact = strategy
            .create("cfg2", &dir.path().join("backups"), &BackupOptions::default())
            .unwrap();

        // Strip a required field and re-checksum so only the structural
        // probe can catch it.
        let mut body: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&artifact.location).unwrap()).unwrap();
        body.as_object_mut().unwrap().remove("system_config");
        fs::write(&artifact.location, serde_json::to_string(&body).unwrap()).unwrap();
        let mut tampered = artifact.clone();
        tampered.checksum = Some(sha256_file(&tampered.location).unwrap());
        assert!(!strategy.verify(&tampered));
    }

    #[test]
    fn test_cloud_snapshot_restore_requires_operator() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system();
        sys.cloud = Some(siteshift_types::CloudConfig {
            provider: "aws".to_string(),
            region: "eu-central-1".to_string(),
            instance_identifier: None,
        });
        let strategy = CloudSnapshotStrategy::new(sys);
        let options = BackupOptions {
            resources: Some(serde_json::json!({"s3_buckets": ["site-assets"]})),
            ..Default::default()
        };
        let artifact = strategy
            .create("cloud1", &dir.path().join("backups"), &options)
            .unwrap();
        assert!(strategy.verify(&artifact));

        let err = strategy
            .restore(&artifact, dir.path(), &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Rollback(_)));
        assert!(err.to_string().contains("manual intervention"));
    }

    #[test]
    fn test_relational_dump_keyword_verification() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("db_k_20240101_000000.sql");
        fs::write(&dump, "-- dump\nCREATE TABLE users (id INT);\nINSERT INTO users VALUES (1);\n")
            .unwrap();

        let mut db = DatabaseConfig::new(EngineFamily::Mysql);
        db.database = Some("app".to_string());
        let strategy = RelationalDumpStrategy::new(db);

        let artifact = Artifact {
            id: "k".to_string(),
            kind: ArtifactKind::DatabaseDump,
            source_system: "mysql".to_string(),
            location: dump.clone(),
            size: fs::metadata(&dump).unwrap().len(),
            checksum: Some(sha256_file(&dump).unwrap()),
            created_at: Utc::now(),
            sequence: next_artifact_sequence(),
            expires_at: None,
            compression_used: false,
            encryption_used: false,
            verified: false,
            verification_date: None,
            metadata: Default::default(),
        };
        assert!(strategy.verify(&artifact));

        // A dump with none of the family keywords fails the probe.
        fs::write(&dump, "just some prose with no statements").unwrap();
        let mut no_keywords = artifact.clone();
        no_keywords.checksum = Some(sha256_file(&dump).unwrap());
        no_keywords.size = fs::metadata(&dump).unwrap().len();
        assert!(!strategy.verify(&no_keywords));
    }

    #[test]
    fn test_keyvalue_dump_verifies_rdb_magic() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("db_kv_20240101_000000.archive");
        fs::write(&dump, b"REDIS0011\x00payload").unwrap();

        let strategy = KeyValueDumpStrategy::new(DatabaseConfig::new(EngineFamily::Redis));
        let artifact = Artifact {
            id: "kv".to_string(),
            kind: ArtifactKind::KeyValueDump,
            source_system: "redis".to_string(),
            location: dump.clone(),
            size: fs::metadata(&dump).unwrap().len(),
            checksum: Some(sha256_file(&dump).unwrap()),
            created_at: Utc::now(),
            sequence: next_artifact_sequence(),
            expires_at: None,
            compression_used: false,
            encryption_used: false,
            verified: false,
            verification_date: None,
            metadata: Default::default(),
        };
        assert!(strategy.verify(&artifact));

        let restored = dir.path().join("data");
        assert!(
            strategy
                .restore(&artifact, &restored, &RestoreOptions::default())
                .unwrap()
        );
        assert!(restored.join("dump.rdb").exists());
    }

    #[test]
    fn test_strategy_routing_by_kind_tag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x");
        fs::write(&file, "x").unwrap();
        let mut artifact = Artifact {
            id: "route".to_string(),
            kind: ArtifactKind::FileArchive,
            source_system: "static_site".to_string(),
            location: file,
            size: 1,
            checksum: None,
            created_at: Utc::now(),
            sequence: 0,
            expires_at: None,
            compression_used: false,
            encryption_used: false,
            verified: false,
            verification_date: None,
            metadata: Default::default(),
        };

        let sys = system();
        assert_eq!(
            strategy_for_artifact(&artifact, &sys, None).unwrap().kind(),
            ArtifactKind::FileArchive
        );

        artifact.kind = ArtifactKind::DatabaseDump;
        assert!(strategy_for_artifact(&artifact, &sys, None).is_err());
        let db = DatabaseConfig::new(EngineFamily::Postgres);
        assert_eq!(
            strategy_for_artifact(&artifact, &sys, Some(&db))
                .unwrap()
                .kind(),
            ArtifactKind::DatabaseDump
        );
    }
}
