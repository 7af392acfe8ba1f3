//! Database migration engine contract.
//!
//! Engines are polymorphic over {connect, extract-schema,
//! validate-compatibility, estimate-size, migrate-schema, migrate-data,
//! verify, supported-methods}. They drive the engine family's external
//! client and dump utilities; nothing here links a database driver.
//!
//! Data migration emits a pull-based progress stream over a bounded
//! channel: the producer blocks when the consumer is slow, and the
//! batch size is the minimum unit between cancellation checks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siteshift_types::{DatabaseConfig, EngineFamily, TransferMethod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::process::{CommandSpec, run_async};

/// Which endpoint an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// One progress record in a data migration stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
    pub entities_completed: u64,
    pub total_entities: u64,
    pub records_processed: u64,
    pub current_operation: String,
}

/// Terminal summary of a data migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataOutcome {
    pub records_migrated: u64,
    pub entities_migrated: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DataOutcome {
    pub fn is_successful(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of schema migration. Per-entity failures accumulate; the
/// operation fails only when no entity succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaOutcome {
    pub entities_created: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SchemaOutcome {
    /// Per-entity failures do not sink the operation as long as at
    /// least one entity succeeded.
    pub fn is_successful(&self) -> bool {
        self.errors.is_empty() || self.entities_created > 0
    }
}

/// Result of post-migration verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub success: bool,
    pub entities_verified: u64,
    pub matches: u64,
    pub mismatches: Vec<String>,
    pub errors: Vec<String>,
}

/// Size and shape estimate for planning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationEstimate {
    pub entities: u64,
    pub records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// One entity (table, collection, key pattern) in a schema summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub entities: Vec<EntityInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Compatibility findings: issues invalidate, warnings do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompatibilityFindings {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompatibilityFindings {
    pub fn compatible(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub source: bool,
    pub destination: bool,
}

/// Parameters of one data migration run.
#[derive(Debug, Clone)]
pub struct DataMigrationSpec {
    /// Entities to migrate; `None` means all.
    pub entities: Option<Vec<String>>,
    pub batch_size: usize,
    pub method: TransferMethod,
    pub cancel: CancellationToken,
}

impl DataMigrationSpec {
    pub fn new(method: TransferMethod, batch_size: usize) -> Self {
        DataMigrationSpec {
            entities: None,
            batch_size: batch_size.max(1),
            method,
            cancel: CancellationToken::new(),
        }
    }
}

/// A running data migration: a finite, single-producer progress stream
/// plus the producer's terminal outcome.
#[derive(Debug)]
pub struct DataMigrationStream {
    pub progress: mpsc::Receiver<MigrationProgress>,
    handle: tokio::task::JoinHandle<Result<DataOutcome>>,
}

impl DataMigrationStream {
    pub fn new(
        progress: mpsc::Receiver<MigrationProgress>,
        handle: tokio::task::JoinHandle<Result<DataOutcome>>,
    ) -> Self {
        DataMigrationStream { progress, handle }
    }

    /// Pull the next progress record; `None` when the producer is done.
    pub async fn next_progress(&mut self) -> Option<MigrationProgress> {
        self.progress.recv().await
    }

    /// Drain remaining progress and return the terminal outcome.
    pub async fn finish(mut self) -> Result<DataOutcome> {
        while self.progress.recv().await.is_some() {}
        self.handle
            .await
            .map_err(|e| Error::database(format!("data migration task panicked: {e}")))?
    }
}

/// Capacity of every progress channel; small so slow consumers apply
/// backpressure to the producer.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// The uniform engine contract.
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn family(&self) -> EngineFamily;

    async fn connect_source(&self) -> Result<()>;
    async fn connect_destination(&self) -> Result<()>;

    async fn test_connectivity(&self) -> ConnectivityReport {
        ConnectivityReport {
            source: self.connect_source().await.is_ok(),
            destination: self.connect_destination().await.is_ok(),
        }
    }

    async fn extract_schema(&self, side: Side) -> Result<SchemaSummary>;
    async fn validate_compatibility(&self) -> Result<CompatibilityFindings>;
    async fn estimate_size(&self) -> Result<MigrationEstimate>;
    async fn migrate_schema(&self) -> Result<SchemaOutcome>;
    async fn migrate_data(&self, spec: DataMigrationSpec) -> Result<DataMigrationStream>;
    async fn verify(&self, entities: Option<Vec<String>>) -> Result<VerificationOutcome>;
    fn supported_methods(&self) -> Vec<TransferMethod>;
}

/// Build the engine for a source/destination pair. Managed-cloud
/// variants share their base family's engine.
pub fn engine_for(
    source: &DatabaseConfig,
    destination: &DatabaseConfig,
) -> Result<Box<dyn DatabaseEngine>> {
    let src_base = source.family.base();
    let dst_base = destination.family.base();
    if src_base != dst_base {
        return Err(Error::config(format!(
            "cross-family database migration is not supported ({} -> {})",
            source.family, destination.family
        )));
    }

    let engine: Box<dyn DatabaseEngine> = match src_base {
        EngineFamily::Mysql => Box::new(crate::db_mysql::MySqlEngine::new(
            source.clone(),
            destination.clone(),
        )),
        EngineFamily::Postgres => Box::new(crate::db_postgres::PostgresEngine::new(
            source.clone(),
            destination.clone(),
        )),
        EngineFamily::Sqlite => Box::new(crate::db_sqlite::SqliteEngine::new(
            source.clone(),
            destination.clone(),
        )),
        EngineFamily::Mongodb => Box::new(crate::db_mongo::MongoEngine::new(
            source.clone(),
            destination.clone(),
        )),
        EngineFamily::Redis => Box::new(crate::db_redis::RedisEngine::new(
            source.clone(),
            destination.clone(),
        )),
        other => {
            return Err(Error::config(format!(
                "no migration engine available for {other}"
            )));
        }
    };
    Ok(engine)
}

// ---------------------------------------------------------------------------
// SQL-over-CLI plumbing shared by the relational engines
// ---------------------------------------------------------------------------

/// Runs SQL through the family's client utility, parsing tab-separated
/// output. MySQL renders NULL as `\N`; postgres and sqlite render it as
/// an empty field.
#[derive(Debug, Clone)]
pub(crate) struct SqlClient {
    pub db: DatabaseConfig,
    pub timeout: Duration,
}

impl SqlClient {
    pub fn new(db: DatabaseConfig) -> Self {
        let timeout = Duration::from_secs(db.connection_timeout_secs.max(1) * 20);
        SqlClient { db, timeout }
    }

    fn command(&self, sql: &str) -> Result<CommandSpec> {
        let db = &self.db;
        let spec = match db.family.base() {
            EngineFamily::Mysql => CommandSpec::new("mysql")
                .arg(format!("--host={}", db.host))
                .arg(format!("--port={}", db.effective_port()))
                .arg(format!("--user={}", db.username.clone().unwrap_or_default()))
                .arg(format!(
                    "--password={}",
                    db.password.clone().unwrap_or_default()
                ))
                .arg("--batch")
                .arg("--skip-column-names")
                .arg("-e")
                .arg(sql)
                .arg(db.database.clone().unwrap_or_default()),
            EngineFamily::Postgres => CommandSpec::new("psql")
                .arg(format!("--host={}", db.host))
                .arg(format!("--port={}", db.effective_port()))
                .arg(format!(
                    "--username={}",
                    db.username.clone().unwrap_or_default()
                ))
                .arg("--dbname")
                .arg(db.database.clone().unwrap_or_default())
                .arg("-X")
                .arg("-q")
                .arg("-A")
                .arg("-t")
                .arg("-F")
                .arg("\t")
                .arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("-c")
                .arg(sql)
                .env("PGPASSWORD", db.password.clone().unwrap_or_default()),
            EngineFamily::Sqlite => {
                let path = db
                    .database_path
                    .as_ref()
                    .ok_or_else(|| Error::config("sqlite client requires database_path"))?;
                CommandSpec::new("sqlite3")
                    .arg("-batch")
                    .arg("-noheader")
                    .arg("-separator")
                    .arg("\t")
                    .arg(path.to_string_lossy().to_string())
                    .arg(sql)
            }
            other => {
                return Err(Error::config(format!(
                    "no SQL client for engine family {other}"
                )));
            }
        };
        Ok(spec.timeout(self.timeout))
    }

    /// Run a query and parse rows of optional string values.
    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let output = run_async(self.command(sql)?).await?;
        if !output.success() {
            return Err(Error::database(format!(
                "{} query failed: {}",
                self.db.family,
                output.stderr.trim()
            )));
        }
        Ok(parse_tsv(&output.stdout, self.db.family))
    }

    /// Run a single scalar query.
    pub async fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.query(sql).await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()).flatten())
    }

    /// Run a statement for effect.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let output = run_async(self.command(sql)?).await?;
        if !output.success() {
            return Err(Error::database(format!(
                "{} statement failed: {}",
                self.db.family,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// `true` when a trivial probe round-trips.
    pub async fn ping(&self) -> Result<()> {
        self.query_scalar("SELECT 1").await.map(|_| ())
    }
}

/// Parse the client utility's tab-separated output. `family` decides
/// the NULL rendering.
pub(crate) fn parse_tsv(output: &str, family: EngineFamily) -> Vec<Vec<Option<String>>> {
    let null_marker = match family.base() {
        EngineFamily::Mysql => Some("\\N"),
        _ => None,
    };
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split('\t')
                .map(|field| match null_marker {
                    Some(marker) if field == marker => None,
                    _ if field.is_empty() && null_marker.is_none() => None,
                    _ => Some(field.to_string()),
                })
                .collect()
        })
        .collect()
}

/// Quote a TSV field as a SQL literal for INSERT reconstruction.
pub(crate) fn sql_literal(value: Option<&str>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) => format!("'{}'", v.replace('\'', "''")),
    }
}

/// Quote an identifier with the family's quoting character.
pub(crate) fn quote_ident(name: &str, family: EngineFamily) -> String {
    match family.base() {
        EngineFamily::Mysql => format!("`{}`", name.replace('`', "``")),
        _ => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Build a batched INSERT from reconstructed rows.
pub(crate) fn build_insert(
    table: &str,
    columns: &[String],
    rows: &[Vec<Option<String>>],
    family: EngineFamily,
) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c, family))
        .collect::<Vec<_>>()
        .join(", ");
    let values = rows
        .iter()
        .map(|row| {
            let fields = row
                .iter()
                .map(|v| sql_literal(v.as_deref()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({fields})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({cols}) VALUES {values};",
        quote_ident(table, family)
    )
}

/// Keyset pagination query: rows strictly after `last_key` in primary
/// key order. LIMIT/OFFSET is deliberately not used; it is unstable
/// under concurrent writes to the source.
pub(crate) fn keyset_query(
    table: &str,
    columns: &[String],
    pk: &str,
    last_key: Option<&str>,
    batch_size: usize,
    family: EngineFamily,
) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c, family))
        .collect::<Vec<_>>()
        .join(", ");
    let table = quote_ident(table, family);
    let pk = quote_ident(pk, family);
    match last_key {
        Some(last) => format!(
            "SELECT {cols} FROM {table} WHERE {pk} > {} ORDER BY {pk} LIMIT {batch_size}",
            sql_literal(Some(last))
        ),
        None => format!("SELECT {cols} FROM {table} ORDER BY {pk} LIMIT {batch_size}"),
    }
}

/// Compare dotted version strings component-wise.
pub(crate) fn version_older(destination: &str, source: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .take(3)
            .filter_map(|part| part.parse().ok())
            .collect()
    };
    let d = parse(destination);
    let s = parse(source);
    for i in 0..d.len().max(s.len()) {
        let dv = d.get(i).copied().unwrap_or(0);
        let sv = s.get(i).copied().unwrap_or(0);
        if dv != sv {
            return dv < sv;
        }
    }
    false
}
