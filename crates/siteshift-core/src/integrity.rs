//! Post-migration data integrity validation.
//!
//! Checks run within one database pair: row-count equality, ordered
//! table digests, sampled row comparison, and constraint comparison.
//! The validation level gates which checks run: basic (row counts),
//! standard (plus digests and constraints), comprehensive (plus sample
//! rows). Single-database integrity covers orphaned foreign keys and
//! duplicate primary keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::config::ValidationLevel;
use siteshift_types::{DatabaseConfig, EngineFamily};

use crate::dbengine::{SqlClient, quote_ident};
use crate::digest::RowHasher;
use crate::error::{Error, Result};

/// Outcome of one integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Passed,
    Failed,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub table_name: String,
    pub check_type: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_value: Option<serde_json::Value>,
    pub message: String,
}

impl CheckResult {
    fn new(table: &str, check_type: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        CheckResult {
            table_name: table.to_string(),
            check_type: check_type.to_string(),
            status,
            source_value: None,
            destination_value: None,
            message: message.into(),
        }
    }

    fn with_values(
        mut self,
        source: serde_json::Value,
        destination: serde_json::Value,
    ) -> Self {
        self.source_value = Some(source);
        self.destination_value = Some(destination);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableValidationSummary {
    pub table_name: String,
    pub total_checks: u32,
    pub passed_checks: u32,
    pub failed_checks: u32,
    pub warning_checks: u32,
    pub validation_time_secs: f64,
    pub results: Vec<CheckResult>,
}

impl TableValidationSummary {
    fn new(table: &str) -> Self {
        TableValidationSummary {
            table_name: table.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, result: CheckResult) {
        self.total_checks += 1;
        match result.status {
            CheckStatus::Passed => self.passed_checks += 1,
            CheckStatus::Failed => self.failed_checks += 1,
            CheckStatus::Warning | CheckStatus::Pending => self.warning_checks += 1,
        }
        self.results.push(result);
    }

    pub fn overall_status(&self) -> CheckStatus {
        if self.failed_checks > 0 {
            CheckStatus::Failed
        } else if self.warning_checks > 0 {
            CheckStatus::Warning
        } else if self.passed_checks > 0 {
            CheckStatus::Passed
        } else {
            CheckStatus::Pending
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.passed_checks as f64 / self.total_checks as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataValidationReport {
    pub validation_time: DateTime<Utc>,
    pub level: ValidationLevel,
    pub table_summaries: BTreeMap<String, TableValidationSummary>,
    pub overall_status: CheckStatus,
    pub total_validation_secs: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DataValidationReport {
    fn new(level: ValidationLevel) -> Self {
        DataValidationReport {
            validation_time: Utc::now(),
            level,
            table_summaries: BTreeMap::new(),
            overall_status: CheckStatus::Pending,
            total_validation_secs: 0.0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn finalize(&mut self) {
        if self.table_summaries.is_empty() {
            self.overall_status = CheckStatus::Failed;
            return;
        }
        let failed = self
            .table_summaries
            .values()
            .any(|s| s.overall_status() == CheckStatus::Failed);
        let warned = self
            .table_summaries
            .values()
            .any(|s| s.overall_status() == CheckStatus::Warning);
        self.overall_status = if failed {
            CheckStatus::Failed
        } else if warned {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };
    }

    pub fn passed(&self) -> bool {
        matches!(self.overall_status, CheckStatus::Passed | CheckStatus::Warning)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.table_summaries
            .values()
            .filter(|s| s.overall_status() == CheckStatus::Failed)
            .map(|s| s.table_name.as_str())
            .collect()
    }
}

/// Single-database integrity findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityFindings {
    pub success: bool,
    pub tables_validated: u32,
    pub integrity_issues: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct DataValidator;

impl Default for DataValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl DataValidator {
    pub fn new() -> Self {
        DataValidator
    }

    /// Validate data integrity across a migrated pair.
    pub async fn validate_migration(
        &self,
        source: &DatabaseConfig,
        destination: &DatabaseConfig,
        tables: Option<Vec<String>>,
        level: ValidationLevel,
        sample_size: Option<usize>,
    ) -> Result<DataValidationReport> {
        if !source.family.is_relational() {
            return Err(Error::verification(format!(
                "data validation is not supported for {}",
                source.family
            )));
        }

        let mut report = DataValidationReport::new(level);
        let started = Utc::now();

        let source_client = SqlClient::new(source.clone());
        let destination_client = SqlClient::new(destination.clone());

        let tables = match tables {
            Some(tables) => tables,
            None => table_names(&source_client).await?,
        };

        for table in tables {
            let summary = self
                .validate_table(
                    &source_client,
                    &destination_client,
                    &table,
                    level,
                    sample_size,
                )
                .await;
            match summary {
                Ok(summary) => {
                    report.table_summaries.insert(table, summary);
                }
                Err(e) => {
                    let message = format!("failed to validate table {table}: {e}");
                    report.errors.push(message.clone());
                    let mut failed = TableValidationSummary::new(&table);
                    failed.record(CheckResult::new(
                        &table,
                        "validation_error",
                        CheckStatus::Failed,
                        message,
                    ));
                    report.table_summaries.insert(table, failed);
                }
            }
        }

        report.total_validation_secs =
            (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        report.finalize();
        Ok(report)
    }

    async fn validate_table(
        &self,
        source: &SqlClient,
        destination: &SqlClient,
        table: &str,
        level: ValidationLevel,
        sample_size: Option<usize>,
    ) -> Result<TableValidationSummary> {
        let mut summary = TableValidationSummary::new(table);
        let started = Utc::now();

        summary.record(self.row_count_check(source, destination, table).await);

        if level >= ValidationLevel::Standard {
            summary.record(self.checksum_check(source, destination, table).await);
            for result in self.constraint_checks(source, destination, table).await {
                summary.record(result);
            }
        }

        if level >= ValidationLevel::Comprehensive {
            for result in self
                .sample_check(source, destination, table, sample_size)
                .await
            {
                summary.record(result);
            }
        }

        summary.validation_time_secs =
            (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        Ok(summary)
    }

    async fn row_count_check(
        &self,
        source: &SqlClient,
        destination: &SqlClient,
        table: &str,
    ) -> CheckResult {
        let count = |client: &SqlClient| {
            let sql = format!(
                "SELECT COUNT(*) FROM {}",
                quote_ident(table, client.db.family)
            );
            let client = client.clone();
            async move {
                client
                    .query_scalar(&sql)
                    .await?
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| Error::verification("count query returned no rows"))
            }
        };

        let source_count = match count(source).await {
            Ok(n) => n,
            Err(e) => {
                return CheckResult::new(
                    table,
                    "row_count",
                    CheckStatus::Failed,
                    format!("row count validation failed: {e}"),
                );
            }
        };
        let destination_count = match count(destination).await {
            Ok(n) => n,
            Err(e) => {
                return CheckResult::new(
                    table,
                    "row_count",
                    CheckStatus::Failed,
                    format!("row count validation failed: {e}"),
                );
            }
        };

        if source_count == destination_count {
            CheckResult::new(
                table,
                "row_count",
                CheckStatus::Passed,
                format!("row counts match: {source_count} rows"),
            )
            .with_values(source_count.into(), destination_count.into())
        } else {
            CheckResult::new(
                table,
                "row_count",
                CheckStatus::Failed,
                format!(
                    "row count mismatch: source={source_count}, destination={destination_count}"
                ),
            )
            .with_values(source_count.into(), destination_count.into())
        }
    }

    /// Ordered-tuple content hash of both sides; columns ordered, rows
    /// ordered by every column, NULLs folded to a sentinel.
    async fn checksum_check(
        &self,
        source: &SqlClient,
        destination: &SqlClient,
        table: &str,
    ) -> CheckResult {
        let columns = match columns_of(source, table).await {
            Ok(columns) if !columns.is_empty() => columns,
            Ok(_) => {
                return CheckResult::new(
                    table,
                    "checksum",
                    CheckStatus::Warning,
                    "no columns found for checksum validation",
                );
            }
            Err(e) => {
                return CheckResult::new(
                    table,
                    "checksum",
                    CheckStatus::Failed,
                    format!("checksum validation failed: {e}"),
                );
            }
        };

        let digest = |client: &SqlClient| {
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c, client.db.family))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {column_list} FROM {} ORDER BY {column_list}",
                quote_ident(table, client.db.family)
            );
            let client = client.clone();
            async move {
                let rows = client.query(&sql).await?;
                let mut hasher = RowHasher::new();
                for row in &rows {
                    hasher.add_row(row.iter().map(|v| v.as_deref()));
                }
                Ok::<String, Error>(hasher.finish())
            }
        };

        let source_digest = match digest(source).await {
            Ok(d) => d,
            Err(e) => {
                return CheckResult::new(
                    table,
                    "checksum",
                    CheckStatus::Failed,
                    format!("checksum validation failed: {e}"),
                );
            }
        };
        let destination_digest = match digest(destination).await {
            Ok(d) => d,
            Err(e) => {
                return CheckResult::new(
                    table,
                    "checksum",
                    CheckStatus::Failed,
                    format!("checksum validation failed: {e}"),
                );
            }
        };

        if source_digest == destination_digest {
            CheckResult::new(table, "checksum", CheckStatus::Passed, "table checksums match")
        } else {
            CheckResult::new(
                table,
                "checksum",
                CheckStatus::Failed,
                "table checksums do not match",
            )
            .with_values(source_digest.into(), destination_digest.into())
        }
    }

    /// Sample rows ordered by primary key, compared field by field. The
    /// first five mismatching rows are reported individually, then a
    /// summary carries the total.
    async fn sample_check(
        &self,
        source: &SqlClient,
        destination: &SqlClient,
        table: &str,
        sample_size: Option<usize>,
    ) -> Vec<CheckResult> {
        let mut results = Vec::new();

        let columns = match columns_of(source, table).await {
            Ok(columns) if !columns.is_empty() => columns,
            _ => {
                results.push(CheckResult::new(
                    table,
                    "sample_data",
                    CheckStatus::Warning,
                    "no columns found for sample data validation",
                ));
                return results;
            }
        };
        let order_key = primary_key_of(source, table)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| columns[0].clone());
        let sample_size = sample_size.unwrap_or(100);

        let fetch = |client: &SqlClient| {
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c, client.db.family))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {column_list} FROM {} ORDER BY {} LIMIT {sample_size}",
                quote_ident(table, client.db.family),
                quote_ident(&order_key, client.db.family)
            );
            let client = client.clone();
            async move { client.query(&sql).await }
        };

        let source_rows = match fetch(source).await {
            Ok(rows) => rows,
            Err(e) => {
                results.push(CheckResult::new(
                    table,
                    "sample_data",
                    CheckStatus::Failed,
                    format!("sample data validation failed: {e}"),
                ));
                return results;
            }
        };
        let destination_rows = match fetch(destination).await {
            Ok(rows) => rows,
            Err(e) => {
                results.push(CheckResult::new(
                    table,
                    "sample_data",
                    CheckStatus::Failed,
                    format!("sample data validation failed: {e}"),
                ));
                return results;
            }
        };

        if source_rows.len() != destination_rows.len() {
            results.push(
                CheckResult::new(
                    table,
                    "sample_data_count",
                    CheckStatus::Failed,
                    format!(
                        "sample data count mismatch: source={}, destination={}",
                        source_rows.len(),
                        destination_rows.len()
                    ),
                )
                .with_values(source_rows.len().into(), destination_rows.len().into()),
            );
            return results;
        }

        let mut mismatches = 0;
        for (index, (source_row, destination_row)) in
            source_rows.iter().zip(destination_rows.iter()).enumerate()
        {
            if source_row != destination_row {
                mismatches += 1;
                if mismatches <= 5 {
                    results.push(CheckResult::new(
                        table,
                        "sample_data_row",
                        CheckStatus::Failed,
                        format!("row {} data mismatch", index + 1),
                    ));
                }
            }
        }

        if mismatches == 0 {
            results.push(CheckResult::new(
                table,
                "sample_data",
                CheckStatus::Passed,
                format!("all {} sample rows match", source_rows.len()),
            ));
        } else if mismatches > 5 {
            results.push(CheckResult::new(
                table,
                "sample_data_summary",
                CheckStatus::Failed,
                format!(
                    "total {mismatches} row mismatches found in sample of {} rows",
                    source_rows.len()
                ),
            ));
        }

        results
    }

    /// Primary-key columns must match; foreign-key and unique counts
    /// draw warnings on divergence.
    async fn constraint_checks(
        &self,
        source: &SqlClient,
        destination: &SqlClient,
        table: &str,
    ) -> Vec<CheckResult> {
        let mut results = Vec::new();

        let source_pk = primary_key_columns(source, table).await.unwrap_or_default();
        let destination_pk = primary_key_columns(destination, table)
            .await
            .unwrap_or_default();
        if source_pk == destination_pk {
            results.push(CheckResult::new(
                table,
                "primary_key",
                CheckStatus::Passed,
                "primary key constraints match",
            ));
        } else {
            results.push(
                CheckResult::new(
                    table,
                    "primary_key",
                    CheckStatus::Failed,
                    "primary key constraints do not match",
                )
                .with_values(
                    serde_json::json!(source_pk),
                    serde_json::json!(destination_pk),
                ),
            );
        }

        let source_fks = foreign_key_count(source, table).await.unwrap_or(0);
        let destination_fks = foreign_key_count(destination, table).await.unwrap_or(0);
        if source_fks == destination_fks {
            results.push(CheckResult::new(
                table,
                "foreign_keys",
                CheckStatus::Passed,
                format!("foreign key count matches: {source_fks} constraints"),
            ));
        } else {
            results.push(
                CheckResult::new(
                    table,
                    "foreign_keys",
                    CheckStatus::Warning,
                    format!(
                        "foreign key count mismatch: source={source_fks}, destination={destination_fks}"
                    ),
                )
                .with_values(source_fks.into(), destination_fks.into()),
            );
        }

        let source_unique = unique_constraint_count(source, table).await.unwrap_or(0);
        let destination_unique = unique_constraint_count(destination, table)
            .await
            .unwrap_or(0);
        if source_unique == destination_unique {
            results.push(CheckResult::new(
                table,
                "unique_constraints",
                CheckStatus::Passed,
                format!("unique constraint count matches: {source_unique} constraints"),
            ));
        } else {
            results.push(
                CheckResult::new(
                    table,
                    "unique_constraints",
                    CheckStatus::Warning,
                    format!(
                        "unique constraint count mismatch: source={source_unique}, destination={destination_unique}"
                    ),
                )
                .with_values(source_unique.into(), destination_unique.into()),
            );
        }

        results
    }

    /// Orphaned foreign-key rows and duplicate primary keys within one
    /// database.
    pub async fn validate_data_integrity(
        &self,
        config: &DatabaseConfig,
        tables: Option<Vec<String>>,
    ) -> Result<IntegrityFindings> {
        if !config.family.is_relational() {
            return Err(Error::verification(format!(
                "data integrity validation is not supported for {}",
                config.family
            )));
        }

        let client = SqlClient::new(config.clone());
        let mut findings = IntegrityFindings {
            success: true,
            ..Default::default()
        };

        let tables = match tables {
            Some(tables) => tables,
            None => table_names(&client).await?,
        };

        for table in tables {
            // Orphaned rows: a left anti-join per foreign key.
            match foreign_keys_of(&client, &table).await {
                Ok(fks) => {
                    for (column, referred_table, referred_column) in fks {
                        let family = client.db.family;
                        let sql = format!(
                            "SELECT COUNT(*) FROM {t} t1 LEFT JOIN {rt} t2 \
                             ON t1.{c} = t2.{rc} WHERE t1.{c} IS NOT NULL AND t2.{rc} IS NULL",
                            t = quote_ident(&table, family),
                            rt = quote_ident(&referred_table, family),
                            c = quote_ident(&column, family),
                            rc = quote_ident(&referred_column, family),
                        );
                        match client.query_scalar(&sql).await {
                            Ok(Some(count)) if count != "0" => {
                                findings.integrity_issues.push(format!(
                                    "table {table}: {count} orphaned records found in foreign key \
                                     {column} -> {referred_table}.{referred_column}"
                                ));
                                findings.success = false;
                            }
                            Ok(_) => {}
                            Err(e) => findings
                                .warnings
                                .push(format!("could not check foreign key integrity for {table}: {e}")),
                        }
                    }
                }
                Err(e) => findings
                    .warnings
                    .push(format!("could not enumerate foreign keys for {table}: {e}")),
            }

            // Duplicate primary key groups.
            match primary_key_columns(&client, &table).await {
                Ok(pk_columns) if !pk_columns.is_empty() => {
                    let family = client.db.family;
                    let pk_list = pk_columns
                        .iter()
                        .map(|c| quote_ident(c, family))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "SELECT COUNT(*) FROM (SELECT {pk_list} FROM {} \
                         GROUP BY {pk_list} HAVING COUNT(*) > 1) duplicates",
                        quote_ident(&table, family)
                    );
                    match client.query_scalar(&sql).await {
                        Ok(Some(count)) if count != "0" => {
                            findings.integrity_issues.push(format!(
                                "table {table}: {count} duplicate primary key values found"
                            ));
                            findings.success = false;
                        }
                        Ok(_) => {}
                        Err(e) => findings
                            .warnings
                            .push(format!("could not check primary key integrity for {table}: {e}")),
                    }
                }
                _ => {}
            }

            findings.tables_validated += 1;
        }

        Ok(findings)
    }
}

// Family-dispatched catalog helpers.

async fn table_names(client: &SqlClient) -> Result<Vec<String>> {
    let sql = match client.db.family.base() {
        EngineFamily::Mysql => format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_type = 'BASE TABLE' ORDER BY table_name",
            client.db.database.clone().unwrap_or_default()
        ),
        EngineFamily::Postgres => {
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename"
                .to_string()
        }
        EngineFamily::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name"
                .to_string()
        }
        other => return Err(Error::verification(format!("no catalog access for {other}"))),
    };
    let rows = client.query(&sql).await?;
    Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
}

async fn columns_of(client: &SqlClient, table: &str) -> Result<Vec<String>> {
    match client.db.family.base() {
        EngineFamily::Sqlite => {
            let rows = client
                .query(&format!("PRAGMA table_info(\"{table}\")"))
                .await?;
            Ok(rows
                .into_iter()
                .filter_map(|r| r.into_iter().nth(1).flatten())
                .collect())
        }
        EngineFamily::Mysql => {
            let db = client.db.database.clone().unwrap_or_default();
            let rows = client
                .query(&format!(
                    "SELECT column_name FROM information_schema.columns \
                     WHERE table_schema = '{db}' AND table_name = '{table}' \
                     ORDER BY ordinal_position"
                ))
                .await?;
            Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
        }
        _ => {
            let rows = client
                .query(&format!(
                    "SELECT column_name FROM information_schema.columns \
                     WHERE table_schema = 'public' AND table_name = '{table}' \
                     ORDER BY ordinal_position"
                ))
                .await?;
            Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
        }
    }
}

async fn primary_key_columns(client: &SqlClient, table: &str) -> Result<Vec<String>> {
    match client.db.family.base() {
        EngineFamily::Mysql => {
            let db = client.db.database.clone().unwrap_or_default();
            let rows = client
                .query(&format!(
                    "SELECT column_name FROM information_schema.key_column_usage \
                     WHERE table_schema = '{db}' AND table_name = '{table}' \
                     AND constraint_name = 'PRIMARY' ORDER BY ordinal_position"
                ))
                .await?;
            Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
        }
        EngineFamily::Postgres => {
            let rows = client
                .query(&format!(
                    "SELECT a.attname FROM pg_index i \
                     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                     WHERE i.indrelid = 'public.\"{table}\"'::regclass AND i.indisprimary \
                     ORDER BY a.attnum"
                ))
                .await?;
            Ok(rows.into_iter().filter_map(|r| r.into_iter().next().flatten()).collect())
        }
        EngineFamily::Sqlite => {
            let rows = client
                .query(&format!("PRAGMA table_info(\"{table}\")"))
                .await?;
            Ok(rows
                .into_iter()
                .filter(|r| {
                    r.get(5)
                        .cloned()
                        .flatten()
                        .and_then(|v| v.parse::<u32>().ok())
                        .unwrap_or(0)
                        > 0
                })
                .filter_map(|r| r.into_iter().nth(1).flatten())
                .collect())
        }
        other => Err(Error::verification(format!("no catalog access for {other}"))),
    }
}

async fn primary_key_of(client: &SqlClient, table: &str) -> Result<Option<String>> {
    let mut columns = primary_key_columns(client, table).await?;
    if columns.len() == 1 {
        Ok(columns.pop())
    } else {
        Ok(None)
    }
}

/// `(column, referred_table, referred_column)` triples.
async fn foreign_keys_of(
    client: &SqlClient,
    table: &str,
) -> Result<Vec<(String, String, String)>> {
    match client.db.family.base() {
        EngineFamily::Mysql => {
            let db = client.db.database.clone().unwrap_or_default();
            let rows = client
                .query(&format!(
                    "SELECT column_name, referenced_table_name, referenced_column_name \
                     FROM information_schema.key_column_usage \
                     WHERE table_schema = '{db}' AND table_name = '{table}' \
                     AND referenced_table_name IS NOT NULL"
                ))
                .await?;
            Ok(extract_fk_triples(rows))
        }
        EngineFamily::Postgres => {
            let rows = client
                .query(&format!(
                    "SELECT kcu.column_name, ccu.table_name, ccu.column_name \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                     JOIN information_schema.constraint_column_usage ccu \
                       ON tc.constraint_name = ccu.constraint_name \
                     WHERE tc.constraint_type = 'FOREIGN KEY' \
                     AND tc.table_schema = 'public' AND tc.table_name = '{table}'"
                ))
                .await?;
            Ok(extract_fk_triples(rows))
        }
        EngineFamily::Sqlite => {
            let rows = client
                .query(&format!("PRAGMA foreign_key_list(\"{table}\")"))
                .await?;
            Ok(rows
                .into_iter()
                .filter_map(|r| {
                    let referred_table = r.get(2).cloned().flatten()?;
                    let column = r.get(3).cloned().flatten()?;
                    let referred_column = r.get(4).cloned().flatten()?;
                    Some((column, referred_table, referred_column))
                })
                .collect())
        }
        other => Err(Error::verification(format!("no catalog access for {other}"))),
    }
}

async fn foreign_key_count(client: &SqlClient, table: &str) -> Result<usize> {
    Ok(foreign_keys_of(client, table).await?.len())
}

async fn unique_constraint_count(client: &SqlClient, table: &str) -> Result<u64> {
    match client.db.family.base() {
        EngineFamily::Mysql => {
            let db = client.db.database.clone().unwrap_or_default();
            let value = client
                .query_scalar(&format!(
                    "SELECT COUNT(*) FROM information_schema.table_constraints \
                     WHERE table_schema = '{db}' AND table_name = '{table}' \
                     AND constraint_type = 'UNIQUE'"
                ))
                .await?;
            Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
        }
        EngineFamily::Postgres => {
            let value = client
                .query_scalar(&format!(
                    "SELECT COUNT(*) FROM information_schema.table_constraints \
                     WHERE table_schema = 'public' AND table_name = '{table}' \
                     AND constraint_type = 'UNIQUE'"
                ))
                .await?;
            Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
        }
        EngineFamily::Sqlite => {
            let rows = client
                .query(&format!("PRAGMA index_list(\"{table}\")"))
                .await?;
            Ok(rows
                .into_iter()
                .filter(|r| r.get(2).cloned().flatten().as_deref() == Some("1"))
                .count() as u64)
        }
        other => Err(Error::verification(format!("no catalog access for {other}"))),
    }
}

fn extract_fk_triples(rows: Vec<Vec<Option<String>>>) -> Vec<(String, String, String)> {
    rows.into_iter()
        .filter_map(|r| {
            let column = r.first().cloned().flatten()?;
            let referred_table = r.get(1).cloned().flatten()?;
            let referred_column = r.get(2).cloned().flatten()?;
            Some((column, referred_table, referred_column))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(table: &str, check: &str) -> CheckResult {
        CheckResult::new(table, check, CheckStatus::Passed, "ok")
    }

    fn failed(table: &str, check: &str) -> CheckResult {
        CheckResult::new(table, check, CheckStatus::Failed, "bad")
    }

    fn warned(table: &str, check: &str) -> CheckResult {
        CheckResult::new(table, check, CheckStatus::Warning, "hm")
    }

    #[test]
    fn test_summary_aggregation() {
        let mut summary = TableValidationSummary::new("users");
        summary.record(passed("users", "row_count"));
        summary.record(warned("users", "foreign_keys"));
        assert_eq!(summary.total_checks, 2);
        assert_eq!(summary.overall_status(), CheckStatus::Warning);
        assert_eq!(summary.success_rate(), 50.0);

        summary.record(failed("users", "checksum"));
        assert_eq!(summary.overall_status(), CheckStatus::Failed);
    }

    #[test]
    fn test_report_finalize_rules() {
        let mut report = DataValidationReport::new(ValidationLevel::Standard);
        report.finalize();
        // No tables at all: failed.
        assert_eq!(report.overall_status, CheckStatus::Failed);

        let mut ok = TableValidationSummary::new("a");
        ok.record(passed("a", "row_count"));
        report.table_summaries.insert("a".to_string(), ok);
        report.finalize();
        assert_eq!(report.overall_status, CheckStatus::Passed);
        assert!(report.passed());

        let mut warned_summary = TableValidationSummary::new("b");
        warned_summary.record(warned("b", "foreign_keys"));
        report
            .table_summaries
            .insert("b".to_string(), warned_summary);
        report.finalize();
        assert_eq!(report.overall_status, CheckStatus::Warning);
        assert!(report.passed());

        let mut bad = TableValidationSummary::new("c");
        bad.record(failed("c", "row_count"));
        report.table_summaries.insert("c".to_string(), bad);
        report.finalize();
        assert_eq!(report.overall_status, CheckStatus::Failed);
        assert_eq!(report.failed_tables(), vec!["c"]);
        assert!(!report.passed());
    }

    #[test]
    fn test_validation_level_ordering() {
        assert!(ValidationLevel::Basic < ValidationLevel::Standard);
        assert!(ValidationLevel::Standard < ValidationLevel::Comprehensive);
    }

    #[tokio::test]
    async fn test_non_relational_rejected() {
        let validator = DataValidator::new();
        let redis = DatabaseConfig::new(EngineFamily::Redis);
        let err = validator
            .validate_migration(&redis, &redis, None, ValidationLevel::Basic, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
        let err = validator
            .validate_data_integrity(&redis, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_extract_fk_triples_skips_incomplete_rows() {
        let rows = vec![
            vec![
                Some("user_id".to_string()),
                Some("users".to_string()),
                Some("id".to_string()),
            ],
            vec![Some("dangling".to_string()), None, Some("id".to_string())],
        ];
        let triples = extract_fk_triples(rows);
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].1, "users");
    }
}
