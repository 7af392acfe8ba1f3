//! Typed migration configuration.
//!
//! A [`MigrationConfig`] is the frozen input a session is created from.
//! Free-form option dictionaries are deliberately absent: every knob is
//! an explicit field, and unknown keys are a configuration error
//! (`deny_unknown_fields`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of web property being migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Wordpress,
    Drupal,
    Joomla,
    Django,
    Flask,
    Laravel,
    Rails,
    Nextjs,
    StaticSite,
    ObjectStorage,
    Container,
    Generic,
}

impl SystemKind {
    /// CMS families get a PHP maintenance stub; everything else a
    /// generic HTML page unless another method is configured.
    pub fn is_cms(&self) -> bool {
        matches!(
            self,
            SystemKind::Wordpress | SystemKind::Drupal | SystemKind::Joomla
        )
    }
}

impl std::fmt::Display for SystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            SystemKind::Wordpress => "wordpress",
            SystemKind::Drupal => "drupal",
            SystemKind::Joomla => "joomla",
            SystemKind::Django => "django",
            SystemKind::Flask => "flask",
            SystemKind::Laravel => "laravel",
            SystemKind::Rails => "rails",
            SystemKind::Nextjs => "nextjs",
            SystemKind::StaticSite => "static_site",
            SystemKind::ObjectStorage => "object_storage",
            SystemKind::Container => "container",
            SystemKind::Generic => "generic",
        };
        f.write_str(tag)
    }
}

/// Cloud placement of a system or database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    pub provider: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_identifier: Option<String>,
}

/// One endpoint of the migration: a host plus enough context to back it
/// up, isolate it, and move its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    pub kind: SystemKind,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Root of the site's file tree on this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,
}

impl SystemConfig {
    /// Registry key for maintenance holds.
    pub fn system_id(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(80))
    }
}

/// Database engine families, including managed-cloud variants that share
/// their self-hosted counterpart's engine implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    Mysql,
    Postgres,
    Sqlite,
    Mongodb,
    Redis,
    AwsRdsMysql,
    AwsRdsPostgres,
    GoogleCloudSql,
    AzureSql,
}

impl EngineFamily {
    /// Collapse managed-cloud variants onto the self-hosted family whose
    /// engine implementation they share.
    pub fn base(&self) -> EngineFamily {
        match self {
            EngineFamily::AwsRdsMysql | EngineFamily::GoogleCloudSql | EngineFamily::AzureSql => {
                EngineFamily::Mysql
            }
            EngineFamily::AwsRdsPostgres => EngineFamily::Postgres,
            other => *other,
        }
    }

    pub fn is_cloud_managed(&self) -> bool {
        matches!(
            self,
            EngineFamily::AwsRdsMysql
                | EngineFamily::AwsRdsPostgres
                | EngineFamily::GoogleCloudSql
                | EngineFamily::AzureSql
        )
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self.base(),
            EngineFamily::Mysql | EngineFamily::Postgres | EngineFamily::Sqlite
        )
    }

    /// External dump utility this family needs on PATH, if any.
    pub fn dump_tool(&self) -> Option<&'static str> {
        match self.base() {
            EngineFamily::Mysql => Some("mysqldump"),
            EngineFamily::Postgres => Some("pg_dump"),
            EngineFamily::Sqlite => Some("sqlite3"),
            EngineFamily::Mongodb => Some("mongodump"),
            EngineFamily::Redis => None,
            _ => None,
        }
    }

    /// External client utility this family needs on PATH for queries
    /// and restores.
    pub fn client_tool(&self) -> &'static str {
        match self.base() {
            EngineFamily::Mysql => "mysql",
            EngineFamily::Postgres => "psql",
            EngineFamily::Sqlite => "sqlite3",
            EngineFamily::Mongodb => "mongosh",
            EngineFamily::Redis => "redis-cli",
            _ => unreachable!("base() collapses cloud variants"),
        }
    }

    /// Restore-side tool probed by the recovery validator.
    pub fn restore_tool(&self) -> &'static str {
        match self.base() {
            EngineFamily::Mysql => "mysql",
            EngineFamily::Postgres => "psql",
            EngineFamily::Sqlite => "sqlite3",
            EngineFamily::Mongodb => "mongorestore",
            EngineFamily::Redis => "redis-cli",
            _ => unreachable!("base() collapses cloud variants"),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self.base() {
            EngineFamily::Mysql => 3306,
            EngineFamily::Postgres => 5432,
            EngineFamily::Sqlite => 0,
            EngineFamily::Mongodb => 27017,
            EngineFamily::Redis => 6379,
            _ => 0,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            EngineFamily::Mysql => "mysql",
            EngineFamily::Postgres => "postgres",
            EngineFamily::Sqlite => "sqlite",
            EngineFamily::Mongodb => "mongodb",
            EngineFamily::Redis => "redis",
            EngineFamily::AwsRdsMysql => "aws_rds_mysql",
            EngineFamily::AwsRdsPostgres => "aws_rds_postgres",
            EngineFamily::GoogleCloudSql => "google_cloud_sql",
            EngineFamily::AzureSql => "azure_sql",
        }
    }

    pub fn parse_tag(tag: &str) -> Option<EngineFamily> {
        match tag {
            "mysql" => Some(EngineFamily::Mysql),
            "postgres" => Some(EngineFamily::Postgres),
            "sqlite" => Some(EngineFamily::Sqlite),
            "mongodb" => Some(EngineFamily::Mongodb),
            "redis" => Some(EngineFamily::Redis),
            "aws_rds_mysql" => Some(EngineFamily::AwsRdsMysql),
            "aws_rds_postgres" => Some(EngineFamily::AwsRdsPostgres),
            "google_cloud_sql" => Some(EngineFamily::GoogleCloudSql),
            "azure_sql" => Some(EngineFamily::AzureSql),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Connection settings for one database endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub family: EngineFamily,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// On-disk database file for embedded engines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// MySQL-family connection charset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    /// MongoDB authentication database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_source: Option<String>,
    /// Redis logical database index (0-15).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_index: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    pub fn new(family: EngineFamily) -> Self {
        DatabaseConfig {
            family,
            host: default_host(),
            port: None,
            username: None,
            password: None,
            database: None,
            database_path: None,
            ssl_enabled: false,
            connection_timeout_secs: default_connection_timeout(),
            charset: None,
            auth_source: None,
            db_index: None,
            cloud: None,
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.family.default_port())
    }

    /// Reject configurations that cannot possibly connect.
    pub fn validate(&self) -> Result<(), String> {
        if self.family.base() == EngineFamily::Sqlite {
            if self.database_path.is_none() {
                return Err("database_path is required for sqlite".to_string());
            }
        } else if self.host.is_empty() {
            return Err(format!("host is required for {}", self.family));
        }
        if let Some(db) = self.db_index
            && db > 15
        {
            return Err("redis db_index must be between 0 and 15".to_string());
        }
        Ok(())
    }
}

/// The algorithmic strategy by which data moves between databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    DumpRestore,
    DirectTransfer,
    Streaming,
    CloudNative,
    BulkCopy,
    FileCopy,
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            TransferMethod::DumpRestore => "dump_restore",
            TransferMethod::DirectTransfer => "direct_transfer",
            TransferMethod::Streaming => "streaming",
            TransferMethod::CloudNative => "cloud_native",
            TransferMethod::BulkCopy => "bulk_copy",
            TransferMethod::FileCopy => "file_copy",
        };
        f.write_str(tag)
    }
}

/// Depth of post-migration integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Row counts only.
    Basic,
    /// Row counts plus table digests and constraint comparison.
    Standard,
    /// Everything, plus sample-row comparison.
    Comprehensive,
}

impl Default for ValidationLevel {
    fn default() -> Self {
        ValidationLevel::Standard
    }
}

/// What the migration should actually do, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default = "default_true")]
    pub backup_files: bool,
    #[serde(default)]
    pub backup_database: bool,
    #[serde(default = "default_true")]
    pub backup_config: bool,
    #[serde(default = "default_true")]
    pub migrate_files: bool,
    #[serde(default)]
    pub migrate_database: bool,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default = "default_true")]
    pub verify_after: bool,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    /// Records per batch during data copy; also the minimum unit
    /// between cancellation checks.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub validation_level: ValidationLevel,
    /// Forced transfer method; when absent the compatibility analyzer's
    /// recommendation is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_method: Option<TransferMethod>,
    /// Upper bound on dependency-disjoint steps executing concurrently.
    /// Sequential by default so operator progress output stays
    /// deterministic.
    #[serde(default = "default_step_concurrency")]
    pub step_concurrency: usize,
    /// Entry-name patterns excluded from file archives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
    /// Configuration files captured by the config snapshot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_files: Vec<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_step_concurrency() -> usize {
    1
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            backup_files: true,
            backup_database: false,
            backup_config: true,
            migrate_files: true,
            migrate_database: false,
            maintenance_mode: false,
            verify_after: true,
            auto_rollback: true,
            batch_size: default_batch_size(),
            validation_level: ValidationLevel::default(),
            transfer_method: None,
            step_concurrency: default_step_concurrency(),
            exclude_patterns: Vec::new(),
            config_files: Vec::new(),
        }
    }
}

/// The frozen input of a migration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    pub name: String,
    pub source: SystemConfig,
    pub destination: SystemConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_database: Option<DatabaseConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_database: Option<DatabaseConfig>,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Extra free-form labels carried through to reports.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MigrationConfig {
    /// Smallest valid configuration; used by tests and as a starting
    /// point for builders.
    pub fn minimal(name: impl Into<String>) -> Self {
        let system = |host: &str| SystemConfig {
            kind: SystemKind::Generic,
            host: host.to_string(),
            port: None,
            document_root: None,
            cloud: None,
        };
        MigrationConfig {
            name: name.into(),
            source: system("source.example.com"),
            destination: system("destination.example.com"),
            source_database: None,
            destination_database: None,
            transfer: TransferConfig::default(),
            labels: BTreeMap::new(),
        }
    }

    /// Surface configuration errors before a session is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("migration name must not be empty".to_string());
        }
        if self.transfer.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.transfer.step_concurrency == 0 {
            return Err("step_concurrency must be at least 1".to_string());
        }
        if self.transfer.migrate_database {
            let src = self
                .source_database
                .as_ref()
                .ok_or("migrate_database requires source_database")?;
            let dst = self
                .destination_database
                .as_ref()
                .ok_or("migrate_database requires destination_database")?;
            src.validate()?;
            dst.validate()?;
            if src.family.base() != dst.family.base() {
                return Err(format!(
                    "cross-family database migration is not supported ({} -> {})",
                    src.family, dst.family
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_family_base_collapses_cloud_variants() {
        assert_eq!(EngineFamily::AwsRdsMysql.base(), EngineFamily::Mysql);
        assert_eq!(EngineFamily::AwsRdsPostgres.base(), EngineFamily::Postgres);
        assert_eq!(EngineFamily::GoogleCloudSql.base(), EngineFamily::Mysql);
        assert_eq!(EngineFamily::AzureSql.base(), EngineFamily::Mysql);
        assert_eq!(EngineFamily::Redis.base(), EngineFamily::Redis);
    }

    #[test]
    fn test_engine_family_tools() {
        assert_eq!(EngineFamily::Mysql.dump_tool(), Some("mysqldump"));
        assert_eq!(EngineFamily::Postgres.client_tool(), "psql");
        assert_eq!(EngineFamily::Mongodb.restore_tool(), "mongorestore");
        assert_eq!(EngineFamily::Redis.dump_tool(), None);
        assert_eq!(EngineFamily::AwsRdsPostgres.client_tool(), "psql");
    }

    #[test]
    fn test_database_config_validation() {
        let mut cfg = DatabaseConfig::new(EngineFamily::Sqlite);
        assert!(cfg.validate().is_err());
        cfg.database_path = Some(PathBuf::from("/var/db/app.sqlite"));
        assert!(cfg.validate().is_ok());

        let mut redis = DatabaseConfig::new(EngineFamily::Redis);
        redis.db_index = Some(16);
        assert!(redis.validate().is_err());
    }

    #[test]
    fn test_migration_config_requires_db_configs() {
        let mut cfg = MigrationConfig::minimal("db-move");
        cfg.transfer.migrate_database = true;
        assert!(cfg.validate().is_err());

        cfg.source_database = Some(DatabaseConfig::new(EngineFamily::Mysql));
        cfg.destination_database = Some(DatabaseConfig::new(EngineFamily::AwsRdsMysql));
        assert!(cfg.validate().is_ok());

        // Cross-family transfers are rejected.
        cfg.destination_database = Some(DatabaseConfig::new(EngineFamily::Postgres));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let json = r#"{
            "kind": "generic",
            "host": "a.example.com",
            "frobnicate": true
        }"#;
        let parsed: Result<SystemConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_transfer_config_defaults() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.step_concurrency, 1);
        assert!(cfg.auto_rollback);
        assert_eq!(cfg.validation_level, ValidationLevel::Standard);
    }
}
