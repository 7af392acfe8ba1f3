//! MySQL-family migration engine (self-hosted MySQL/MariaDB and the
//! managed variants that share the wire protocol).
//!
//! All work goes through `mysql` / `mysqldump`; data transfer uses
//! keyset pagination on the primary key.

use async_trait::async_trait;
use siteshift_types::{DatabaseConfig, EngineFamily, TransferMethod};
use tokio::sync::mpsc;

use crate::dbengine::{
    CompatibilityFindings, DataMigrationSpec, DataMigrationStream, DataOutcome, DatabaseEngine,
    EntityInfo, MigrationEstimate, MigrationProgress, PROGRESS_CHANNEL_CAPACITY, SchemaOutcome,
    SchemaSummary, Side, SqlClient, VerificationOutcome, build_insert, keyset_query, quote_ident,
    version_older,
};
use crate::error::{Error, Result};
use crate::process::{CommandSpec, run_async};

pub struct MySqlEngine {
    source: DatabaseConfig,
    destination: DatabaseConfig,
    source_client: SqlClient,
    destination_client: SqlClient,
}

impl MySqlEngine {
    pub fn new(source: DatabaseConfig, destination: DatabaseConfig) -> Self {
        MySqlEngine {
            source_client: SqlClient::new(source.clone()),
            destination_client: SqlClient::new(destination.clone()),
            source,
            destination,
        }
    }

    fn client(&self, side: Side) -> &SqlClient {
        match side {
            Side::Source => &self.source_client,
            Side::Destination => &self.destination_client,
        }
    }

    fn config(&self, side: Side) -> &DatabaseConfig {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    async fn table_names(&self, side: Side) -> Result<Vec<String>> {
        let db = self.config(side).database.clone().unwrap_or_default();
        let sql = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{db}' AND table_type = 'BASE TABLE' ORDER BY table_name"
        );
        let rows = self.client(side).query(&sql).await?;
        Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
    }

    async fn columns_of(&self, side: Side, table: &str) -> Result<Vec<String>> {
        let db = self.config(side).database.clone().unwrap_or_default();
        let sql = format!(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = '{db}' AND table_name = '{table}' ORDER BY ordinal_position"
        );
        let rows = self.client(side).query(&sql).await?;
        Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
    }

    async fn primary_key_of(&self, side: Side, table: &str) -> Result<Option<String>> {
        let db = self.config(side).database.clone().unwrap_or_default();
        let sql = format!(
            "SELECT column_name FROM information_schema.key_column_usage \
             WHERE table_schema = '{db}' AND table_name = '{table}' \
             AND constraint_name = 'PRIMARY' ORDER BY ordinal_position"
        );
        let rows = self.client(side).query(&sql).await?;
        let mut columns: Vec<String> = rows
            .into_iter()
            .filter_map(|r| r.into_iter().next().flatten())
            .collect();
        // Keyset pagination needs a single-column key.
        if columns.len() == 1 {
            Ok(columns.pop())
        } else {
            Ok(None)
        }
    }

    async fn count_rows(&self, side: Side, table: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            quote_ident(table, EngineFamily::Mysql)
        );
        let value = self.client(side).query_scalar(&sql).await?;
        value
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::database(format!("count query returned no rows for {table}")))
    }

    fn dump_table_command(&self, table: &str, output: &std::path::Path) -> CommandSpec {
        let db = &self.source;
        CommandSpec::new("mysqldump")
            .arg(format!("--host={}", db.host))
            .arg(format!("--port={}", db.effective_port()))
            .arg(format!("--user={}", db.username.clone().unwrap_or_default()))
            .arg(format!(
                "--password={}",
                db.password.clone().unwrap_or_default()
            ))
            .arg("--single-transaction")
            .arg("--skip-add-drop-table")
            .arg("--no-create-info")
            .arg(db.database.clone().unwrap_or_default())
            .arg(table)
            .stdout_file(output)
            .timeout(self.source_client.timeout)
    }

    fn load_dump_command(&self, dump: &std::path::Path) -> CommandSpec {
        let db = &self.destination;
        CommandSpec::new("mysql")
            .arg(format!("--host={}", db.host))
            .arg(format!("--port={}", db.effective_port()))
            .arg(format!("--user={}", db.username.clone().unwrap_or_default()))
            .arg(format!(
                "--password={}",
                db.password.clone().unwrap_or_default()
            ))
            .arg(db.database.clone().unwrap_or_default())
            .stdin_file(dump)
            .timeout(self.destination_client.timeout)
    }

    async fn charset_of(&self, side: Side) -> Result<Option<String>> {
        let db = self.config(side).database.clone().unwrap_or_default();
        let sql = format!(
            "SELECT default_character_set_name FROM information_schema.schemata \
             WHERE schema_name = '{db}'"
        );
        self.client(side).query_scalar(&sql).await
    }
}

#[async_trait]
impl DatabaseEngine for MySqlEngine {
    fn family(&self) -> EngineFamily {
        self.source.family
    }

    async fn connect_source(&self) -> Result<()> {
        self.source_client.ping().await
    }

    async fn connect_destination(&self) -> Result<()> {
        self.destination_client.ping().await
    }

    async fn extract_schema(&self, side: Side) -> Result<SchemaSummary> {
        let db = self.config(side).database.clone().unwrap_or_default();
        let sql = format!(
            "SELECT table_name, table_rows FROM information_schema.tables \
             WHERE table_schema = '{db}' AND table_type = 'BASE TABLE' ORDER BY table_name"
        );
        let rows = self.client(side).query(&sql).await?;
        let entities = rows
            .into_iter()
            .map(|row| {
                let mut fields = row.into_iter();
                EntityInfo {
                    name: fields.next().flatten().unwrap_or_default(),
                    records: fields.next().flatten().and_then(|v| v.parse().ok()),
                }
            })
            .collect();
        let version = self.client(side).query_scalar("SELECT VERSION()").await?;
        Ok(SchemaSummary { entities, version })
    }

    async fn validate_compatibility(&self) -> Result<CompatibilityFindings> {
        let mut findings = CompatibilityFindings::default();

        if let Err(e) = self.connect_destination().await {
            findings
                .issues
                .push(format!("destination unreachable: {e}"));
            return Ok(findings);
        }

        let source_tables = self.table_names(Side::Source).await?;
        let destination_tables = self.table_names(Side::Destination).await.unwrap_or_default();
        let collisions: Vec<&String> = source_tables
            .iter()
            .filter(|t| destination_tables.contains(t))
            .collect();
        if !collisions.is_empty() {
            findings.issues.push(format!(
                "table name conflicts on destination: {collisions:?}"
            ));
        }

        let source_version = self
            .source_client
            .query_scalar("SELECT VERSION()")
            .await?
            .unwrap_or_default();
        let destination_version = self
            .destination_client
            .query_scalar("SELECT VERSION()")
            .await?
            .unwrap_or_default();
        if version_older(&destination_version, &source_version) {
            findings.issues.push(format!(
                "destination server {destination_version} is older than source {source_version}"
            ));
        }

        let source_charset = self.charset_of(Side::Source).await?;
        let destination_charset = self.charset_of(Side::Destination).await?;
        if source_charset.is_some() && source_charset != destination_charset {
            findings.warnings.push(format!(
                "character set mismatch: source {source_charset:?}, destination {destination_charset:?}"
            ));
        }

        let db = self.source.database.clone().unwrap_or_default();
        let hazards = self
            .source_client
            .query(&format!(
                "SELECT table_name, column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = '{db}' \
                 AND data_type IN ('enum', 'set', 'json', 'geometry', 'point', 'polygon')"
            ))
            .await?;
        for row in hazards {
            let table = row.first().cloned().flatten().unwrap_or_default();
            let column = row.get(1).cloned().flatten().unwrap_or_default();
            let dtype = row.get(2).cloned().flatten().unwrap_or_default();
            findings.warnings.push(format!(
                "{dtype} column {table}.{column} may map lossily on the destination"
            ));
        }

        Ok(findings)
    }

    async fn estimate_size(&self) -> Result<MigrationEstimate> {
        let db = self.source.database.clone().unwrap_or_default();
        let rows = self
            .source_client
            .query(&format!(
                "SELECT COUNT(*), COALESCE(SUM(table_rows), 0), \
                 COALESCE(SUM(data_length + index_length), 0) \
                 FROM information_schema.tables \
                 WHERE table_schema = '{db}' AND table_type = 'BASE TABLE'"
            ))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::database("size estimate query returned nothing"))?;
        Ok(MigrationEstimate {
            entities: row.first().cloned().flatten().and_then(|v| v.parse().ok()).unwrap_or(0),
            records: row.get(1).cloned().flatten().and_then(|v| v.parse().ok()).unwrap_or(0),
            bytes: row.get(2).cloned().flatten().and_then(|v| v.parse().ok()),
        })
    }

    async fn migrate_schema(&self) -> Result<SchemaOutcome> {
        let mut outcome = SchemaOutcome::default();
        for table in self.table_names(Side::Source).await? {
            let show = format!(
                "SHOW CREATE TABLE {}",
                quote_ident(&table, EngineFamily::Mysql)
            );
            let rows = self.source_client.query(&show).await?;
            let Some(create) = rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().nth(1).flatten())
            else {
                outcome
                    .errors
                    .push(format!("no CREATE TABLE definition for {table}"));
                continue;
            };

            match self.destination_client.execute(&create).await {
                Ok(()) => outcome.entities_created += 1,
                Err(e) if e.to_string().contains("already exists") => {
                    outcome
                        .warnings
                        .push(format!("table {table} already exists on destination"));
                    outcome.entities_created += 1;
                }
                Err(e) => outcome.errors.push(format!("{table}: {e}")),
            }
        }
        Ok(outcome)
    }

    async fn migrate_data(&self, spec: DataMigrationSpec) -> Result<DataMigrationStream> {
        if !self.supported_methods().contains(&spec.method) {
            return Err(Error::database(format!(
                "transfer method {} is not supported by the mysql engine",
                spec.method
            )));
        }

        let tables = match &spec.entities {
            Some(tables) => tables.clone(),
            None => self.table_names(Side::Source).await?,
        };

        // Resolve per-table shape up front so the producer task only
        // moves owned data.
        let mut plans = Vec::new();
        for table in &tables {
            let columns = self.columns_of(Side::Source, table).await?;
            let pk = self.primary_key_of(Side::Source, table).await?;
            plans.push((table.clone(), columns, pk));
        }

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let source = self.source_client.clone();
        let destination = self.destination_client.clone();
        let engine = MySqlEngine::new(self.source.clone(), self.destination.clone());
        let method = spec.method;
        let batch_size = spec.batch_size;
        let cancel = spec.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut outcome = DataOutcome::default();
            let total = plans.len() as u64;

            for (index, (table, columns, pk)) in plans.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled(format!(
                        "data migration cancelled before table {table}"
                    )));
                }

                let _ = tx
                    .send(MigrationProgress {
                        current_entity: Some(table.clone()),
                        entities_completed: index as u64,
                        total_entities: total,
                        records_processed: outcome.records_migrated,
                        current_operation: format!("migrating table {table}"),
                    })
                    .await;

                let result = match method {
                    TransferMethod::DumpRestore | TransferMethod::BulkCopy => {
                        engine.transfer_table_by_dump(&table).await
                    }
                    _ => {
                        transfer_table_keyset(
                            &source,
                            &destination,
                            &table,
                            &columns,
                            pk.as_deref(),
                            batch_size,
                            &cancel,
                            &tx,
                            index as u64,
                            total,
                            &mut outcome,
                        )
                        .await
                    }
                };

                match result {
                    Ok(records) => {
                        outcome.records_migrated += records;
                        outcome.entities_migrated += 1;
                    }
                    Err(e) if matches!(e, Error::Cancelled(_)) => return Err(e),
                    Err(e) => outcome.errors.push(format!("{table}: {e}")),
                }

                let _ = tx
                    .send(MigrationProgress {
                        current_entity: Some(table.clone()),
                        entities_completed: index as u64 + 1,
                        total_entities: total,
                        records_processed: outcome.records_migrated,
                        current_operation: format!("finished table {table}"),
                    })
                    .await;
            }

            Ok(outcome)
        });

        Ok(DataMigrationStream::new(rx, handle))
    }

    async fn verify(&self, entities: Option<Vec<String>>) -> Result<VerificationOutcome> {
        let tables = match entities {
            Some(tables) => tables,
            None => self.table_names(Side::Source).await?,
        };

        let mut outcome = VerificationOutcome {
            success: true,
            ..Default::default()
        };

        for table in tables {
            outcome.entities_verified += 1;
            let source_count = match self.count_rows(Side::Source, &table).await {
                Ok(n) => n,
                Err(e) => {
                    outcome.errors.push(format!("{table}: {e}"));
                    outcome.success = false;
                    continue;
                }
            };
            let destination_count = match self.count_rows(Side::Destination, &table).await {
                Ok(n) => n,
                Err(e) => {
                    outcome.errors.push(format!("{table}: {e}"));
                    outcome.success = false;
                    continue;
                }
            };

            if source_count != destination_count {
                outcome.mismatches.push(format!(
                    "{table}: source has {source_count} rows, destination has {destination_count}"
                ));
                outcome.success = false;
                continue;
            }

            // Spot-check identifiers when a single-column key exists.
            if let Some(pk) = self.primary_key_of(Side::Source, &table).await? {
                let sample = format!(
                    "SELECT {pk} FROM {table} ORDER BY {pk} LIMIT 10",
                    pk = quote_ident(&pk, EngineFamily::Mysql),
                    table = quote_ident(&table, EngineFamily::Mysql),
                );
                let source_ids = self.source_client.query(&sample).await?;
                let destination_ids = self.destination_client.query(&sample).await?;
                if source_ids != destination_ids {
                    outcome
                        .mismatches
                        .push(format!("{table}: sampled primary keys differ"));
                    outcome.success = false;
                    continue;
                }
            }
            outcome.matches += 1;
        }

        Ok(outcome)
    }

    fn supported_methods(&self) -> Vec<TransferMethod> {
        vec![
            TransferMethod::DumpRestore,
            TransferMethod::DirectTransfer,
            TransferMethod::BulkCopy,
        ]
    }
}

impl MySqlEngine {
    async fn transfer_table_by_dump(&self, table: &str) -> Result<u64> {
        let scratch = tempfile::Builder::new()
            .prefix("siteshift_mysql_")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| Error::database(format!("cannot create dump scratch file: {e}")))?;

        let dump = run_async(self.dump_table_command(table, scratch.path())).await?;
        if !dump.success() {
            return Err(Error::database(format!(
                "mysqldump failed for {table}: {}",
                dump.stderr.trim()
            )));
        }

        let mut load = run_async(self.load_dump_command(scratch.path())).await?;
        if !load.success() {
            let failure = Error::database(format!(
                "mysql load failed for {table}: {}",
                load.stderr.trim()
            ));
            // One retry for transient network failures.
            if failure.is_transient() {
                load = run_async(self.load_dump_command(scratch.path())).await?;
            }
            if !load.success() {
                return Err(failure);
            }
        }

        self.count_rows(Side::Destination, table).await
    }
}

/// Keyset-paginated transfer shared by direct and streaming methods.
/// Falls back from batched INSERT to per-row inserts on failure.
#[allow(clippy::too_many_arguments)]
async fn transfer_table_keyset(
    source: &SqlClient,
    destination: &SqlClient,
    table: &str,
    columns: &[String],
    pk: Option<&str>,
    batch_size: usize,
    cancel: &tokio_util::sync::CancellationToken,
    tx: &mpsc::Sender<MigrationProgress>,
    entity_index: u64,
    total_entities: u64,
    outcome: &mut DataOutcome,
) -> Result<u64> {
    if columns.is_empty() {
        return Err(Error::database(format!("table {table} has no columns")));
    }

    let Some(pk) = pk else {
        // No usable single-column primary key: one full-scan batch.
        outcome.warnings.push(format!(
            "table {table} has no single-column primary key; transferring in one unpaginated batch"
        ));
        let cols = columns
            .iter()
            .map(|c| quote_ident(c, source.db.family))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {cols} FROM {}",
            quote_ident(table, source.db.family)
        );
        let rows = source.query(&sql).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len() as u64;
        insert_rows(destination, table, columns, &rows, outcome).await?;
        return Ok(count);
    };

    let pk_index = columns
        .iter()
        .position(|c| c == pk)
        .ok_or_else(|| Error::database(format!("primary key {pk} not in column list of {table}")))?;

    let mut transferred: u64 = 0;
    let mut last_key: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!(
                "data migration cancelled inside table {table}"
            )));
        }

        let sql = keyset_query(
            table,
            columns,
            pk,
            last_key.as_deref(),
            batch_size,
            source.db.family,
        );
        let rows = source.query(&sql).await?;
        if rows.is_empty() {
            break;
        }

        last_key = rows
            .last()
            .and_then(|row| row.get(pk_index).cloned().flatten());
        let batch_len = rows.len();
        insert_rows(destination, table, columns, &rows, outcome).await?;
        transferred += batch_len as u64;

        let _ = tx
            .send(MigrationProgress {
                current_entity: Some(table.to_string()),
                entities_completed: entity_index,
                total_entities,
                records_processed: outcome.records_migrated + transferred,
                current_operation: format!("copied {transferred} rows from {table}"),
            })
            .await;

        if batch_len < batch_size {
            break;
        }
        if last_key.is_none() {
            // A NULL key would loop forever; stop with what we have.
            outcome.warnings.push(format!(
                "table {table}: pagination stopped at a NULL primary key value"
            ));
            break;
        }
    }

    Ok(transferred)
}

/// Batched insert with single-row fallback on failure.
async fn insert_rows(
    destination: &SqlClient,
    table: &str,
    columns: &[String],
    rows: &[Vec<Option<String>>],
    outcome: &mut DataOutcome,
) -> Result<()> {
    let family = destination.db.family;
    let batch_sql = build_insert(table, columns, rows, family);
    let mut result = destination.execute(&batch_sql).await;
    if let Err(e) = &result
        && e.is_transient()
    {
        result = destination.execute(&batch_sql).await;
    }
    if result.is_ok() {
        return Ok(());
    }

    // Batch failed: fall back to per-row inserts so one bad tuple does
    // not sink the batch.
    for row in rows {
        let row_sql = build_insert(table, columns, std::slice::from_ref(row), family);
        if let Err(e) = destination.execute(&row_sql).await {
            outcome
                .errors
                .push(format!("{table}: row insert failed: {e}"));
        }
    }
    Ok(())
}
