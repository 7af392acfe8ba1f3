//! PostgreSQL-family migration engine.
//!
//! Drives `psql` / `pg_dump`; the password travels in `PGPASSWORD`,
//! never on the command line. Streaming uses COPY through the client;
//! direct transfer uses keyset pagination like the mysql engine.

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

pub struct PostgresEngine {
    source: DatabaseConfig,
    destination: DatabaseConfig,
    source_client: SqlClient,
    destination_client: SqlClient,
}

impl PostgresEngine {
    pub fn new(source: DatabaseConfig, destination: DatabaseConfig) -> Self {
        PostgresEngine {
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

    async fn table_names(&self, side: Side) -> Result<Vec<String>> {
        let rows = self
            .client(side)
            .query(
                "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
            )
            .await?;
        Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
    }

    async fn columns_of(&self, side: Side, table: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = '{table}' ORDER BY ordinal_position"
        );
        let rows = self.client(side).query(&sql).await?;
        Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
    }

    async fn primary_key_of(&self, side: Side, table: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT a.attname FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = 'public.\"{table}\"'::regclass AND i.indisprimary \
             ORDER BY a.attnum"
        );
        let rows = self.client(side).query(&sql).await?;
        let mut columns: Vec<String> = rows
            .into_iter()
            .filter_map(|r| r.into_iter().next().flatten())
            .collect();
        if columns.len() == 1 {
            Ok(columns.pop())
        } else {
            Ok(None)
        }
    }

    async fn count_rows(&self, side: Side, table: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            quote_ident(table, EngineFamily::Postgres)
        );
        let value = self.client(side).query_scalar(&sql).await?;
        value
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::database(format!("count query returned no rows for {table}")))
    }

    /// `\copy` a table to or from a scratch file through psql.
    fn copy_command(&self, side: Side, table: &str, file: &std::path::Path, to_file: bool) -> CommandSpec {
        let db = match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        };
        let direction = if to_file {
            format!(
                "\\copy {} TO '{}' WITH (FORMAT csv)",
                quote_ident(table, EngineFamily::Postgres),
                file.display()
            )
        } else {
            format!(
                "\\copy {} FROM '{}' WITH (FORMAT csv)",
                quote_ident(table, EngineFamily::Postgres),
                file.display()
            )
        };
        CommandSpec::new("psql")
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
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-c")
            .arg(direction)
            .env("PGPASSWORD", db.password.clone().unwrap_or_default())
            .timeout(self.source_client.timeout)
    }

    async fn transfer_table_by_copy(&self, table: &str) -> Result<u64> {
        let scratch = tempfile::Builder::new()
            .prefix("siteshift_pg_")
            .suffix(".csv")
            .tempfile()
            .map_err(|e| Error::database(format!("cannot create copy scratch file: {e}")))?;

        let export = run_async(self.copy_command(Side::Source, table, scratch.path(), true)).await?;
        if !export.success() {
            return Err(Error::database(format!(
                "COPY TO failed for {table}: {}",
                export.stderr.trim()
            )));
        }

        let mut import =
            run_async(self.copy_command(Side::Destination, table, scratch.path(), false)).await?;
        if !import.success() {
            let failure = Error::database(format!(
                "COPY FROM failed for {table}: {}",
                import.stderr.trim()
            ));
            if failure.is_transient() {
                import =
                    run_async(self.copy_command(Side::Destination, table, scratch.path(), false))
                        .await?;
            }
            if !import.success() {
                return Err(failure);
            }
        }

        self.count_rows(Side::Destination, table).await
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
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
        let rows = self
            .client(side)
            .query(
                "SELECT relname, n_live_tup FROM pg_stat_user_tables ORDER BY relname",
            )
            .await?;
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
        let version = self.client(side).query_scalar("SHOW server_version").await?;
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
            .query_scalar("SHOW server_version")
            .await?
            .unwrap_or_default();
        let destination_version = self
            .destination_client
            .query_scalar("SHOW server_version")
            .await?
            .unwrap_or_default();
        if version_older(&destination_version, &source_version) {
            findings.issues.push(format!(
                "destination server {destination_version} is older than source {source_version}"
            ));
        }

        // Sequences need recreation and sequence-value sync.
        let sequences = self
            .source_client
            .query("SELECT sequencename FROM pg_sequences WHERE schemaname = 'public'")
            .await?;
        if !sequences.is_empty() {
            findings.warnings.push(format!(
                "{} sequence(s) on the source; current values must be synchronized after transfer",
                sequences.len()
            ));
        }

        let hazards = self
            .source_client
            .query(
                "SELECT table_name, column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = 'public' \
                 AND (data_type = 'USER-DEFINED' OR data_type IN ('json', 'jsonb', 'point', 'polygon'))",
            )
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
        let rows = self
            .source_client
            .query(
                "SELECT COUNT(*), COALESCE(SUM(n_live_tup), 0), \
                 COALESCE(SUM(pg_total_relation_size(relid)), 0) \
                 FROM pg_stat_user_tables",
            )
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
        // Schema definitions move through pg_dump --schema-only; psql
        // applies them statement by statement.
        let scratch = tempfile::Builder::new()
            .prefix("siteshift_pg_schema_")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| Error::database(format!("cannot create schema scratch file: {e}")))?;

        let db = &self.source;
        let dump = run_async(
            CommandSpec::new("pg_dump")
                .arg(format!("--host={}", db.host))
                .arg(format!("--port={}", db.effective_port()))
                .arg(format!(
                    "--username={}",
                    db.username.clone().unwrap_or_default()
                ))
                .arg("--schema-only")
                .arg("--no-owner")
                .arg(db.database.clone().unwrap_or_default())
                .env("PGPASSWORD", db.password.clone().unwrap_or_default())
                .stdout_file(scratch.path())
                .timeout(self.source_client.timeout),
        )
        .await?;
        if !dump.success() {
            return Err(Error::database(format!(
                "pg_dump --schema-only failed: {}",
                dump.stderr.trim()
            )));
        }

        let dst = &self.destination;
        let apply = run_async(
            CommandSpec::new("psql")
                .arg(format!("--host={}", dst.host))
                .arg(format!("--port={}", dst.effective_port()))
                .arg(format!(
                    "--username={}",
                    dst.username.clone().unwrap_or_default()
                ))
                .arg("--dbname")
                .arg(dst.database.clone().unwrap_or_default())
                .arg("-X")
                .arg("-q")
                .env("PGPASSWORD", dst.password.clone().unwrap_or_default())
                .stdin_file(scratch.path())
                .timeout(self.destination_client.timeout),
        )
        .await?;

        let mut outcome = SchemaOutcome::default();
        let created = self.table_names(Side::Destination).await?.len() as u64;
        outcome.entities_created = created;
        if !apply.success() {
            outcome.errors.push(format!(
                "schema apply reported errors: {}",
                apply.stderr.trim()
            ));
        } else {
            // "already exists" noise from re-runs is logged, not fatal.
            for line in apply.stderr.lines().filter(|l| l.contains("already exists")) {
                outcome.warnings.push(line.trim().to_string());
            }
        }
        Ok(outcome)
    }

    async fn migrate_data(&self, spec: DataMigrationSpec) -> Result<DataMigrationStream> {
        if !self.supported_methods().contains(&spec.method) {
            return Err(Error::database(format!(
                "transfer method {} is not supported by the postgres engine",
                spec.method
            )));
        }

        let tables = match &spec.entities {
            Some(tables) => tables.clone(),
            None => self.table_names(Side::Source).await?,
        };

        let mut plans = Vec::new();
        for table in &tables {
            let columns = self.columns_of(Side::Source, table).await?;
            let pk = self.primary_key_of(Side::Source, table).await?;
            plans.push((table.clone(), columns, pk));
        }

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let engine = PostgresEngine::new(self.source.clone(), self.destination.clone());
        let source = self.source_client.clone();
        let destination = self.destination_client.clone();
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
                    TransferMethod::DumpRestore
                    | TransferMethod::BulkCopy
                    | TransferMethod::Streaming => engine.transfer_table_by_copy(&table).await,
                    _ => {
                        keyset_transfer(
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

            if let Some(pk) = self.primary_key_of(Side::Source, &table).await? {
                let sample = format!(
                    "SELECT {pk} FROM {table} ORDER BY {pk} LIMIT 10",
                    pk = quote_ident(&pk, EngineFamily::Postgres),
                    table = quote_ident(&table, EngineFamily::Postgres),
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
            TransferMethod::Streaming,
            TransferMethod::BulkCopy,
        ]
    }
}

/// Keyset-paginated transfer shared with the streaming path's fallback.
#[allow(clippy::too_many_arguments)]
async fn keyset_transfer(
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
        outcome.warnings.push(format!(
            "table {table} has no single-column primary key; transferring in one unpaginated batch"
        ));
        let cols = columns
            .iter()
            .map(|c| quote_ident(c, EngineFamily::Postgres))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {cols} FROM {}",
            quote_ident(table, EngineFamily::Postgres)
        );
        let rows = source.query(&sql).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len() as u64;
        let insert = build_insert(table, columns, &rows, EngineFamily::Postgres);
        destination.execute(&insert).await?;
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
            EngineFamily::Postgres,
        );
        let rows = source.query(&sql).await?;
        if rows.is_empty() {
            break;
        }

        last_key = rows
            .last()
            .and_then(|row| row.get(pk_index).cloned().flatten());
        let batch_len = rows.len();
        let insert = build_insert(table, columns, &rows, EngineFamily::Postgres);
        let mut result = destination.execute(&insert).await;
        if let Err(e) = &result
            && e.is_transient()
        {
            result = destination.execute(&insert).await;
        }
        if result.is_err() {
            // Per-row fallback so one bad tuple does not sink the batch.
            for row in &rows {
                let row_sql =
                    build_insert(table, columns, std::slice::from_ref(row), EngineFamily::Postgres);
                if let Err(e) = destination.execute(&row_sql).await {
                    outcome
                        .errors
                        .push(format!("{table}: row insert failed: {e}"));
                }
            }
        }
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
            outcome.warnings.push(format!(
                "table {table}: pagination stopped at a NULL primary key value"
            ));
            break;
        }
    }

    Ok(transferred)
}
