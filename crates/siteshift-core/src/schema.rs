//! Schema analysis and cross-endpoint compatibility scoring.
//!
//! The analyzer extracts table, constraint, index, view, sequence, and
//! routine inventories through the relational families' client
//! utilities. Compatibility analysis is a pure function over two
//! analyses plus the endpoint configurations; the complexity score and
//! recommended transfer method come out of it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::{DatabaseConfig, EngineFamily, TransferMethod};

use crate::dbengine::SqlClient;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub table: String,
    pub columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineInfo {
    pub name: String,
    pub kind: String,
}

/// Full inventory of one database's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAnalysis {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub family: EngineFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub tables: BTreeMap<String, TableInfo>,
    pub views: Vec<String>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub unique_constraints: u64,
    pub check_constraints: u64,
    pub sequences: Vec<String>,
    pub functions: Vec<RoutineInfo>,
    pub analysis_time: DateTime<Utc>,
}

impl SchemaAnalysis {
    fn new(family: EngineFamily) -> Self {
        SchemaAnalysis {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            family,
            version: None,
            tables: BTreeMap::new(),
            views: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: 0,
            check_constraints: 0,
            sequences: Vec::new(),
            functions: Vec::new(),
            analysis_time: Utc::now(),
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.success = false;
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.values().filter_map(|t| t.row_count).sum()
    }

    pub fn foreign_key_count(&self) -> usize {
        self.foreign_keys.len()
    }
}

/// Difficulty classification of a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Result of comparing a source schema against a destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub complexity: Complexity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_method: Option<TransferMethod>,
    pub unsupported_features: Vec<String>,
}

impl CompatibilityReport {
    fn new() -> Self {
        CompatibilityReport {
            compatible: true,
            issues: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
            complexity: Complexity::Simple,
            recommended_method: None,
            unsupported_features: Vec::new(),
        }
    }

    fn issue(&mut self, message: impl Into<String>) {
        self.issues.push(message.into());
        self.compatible = false;
    }
}

pub struct SchemaAnalyzer;

impl Default for SchemaAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaAnalyzer {
    pub fn new() -> Self {
        SchemaAnalyzer
    }

    /// Analyze one database. Only relational families are supported.
    pub async fn analyze(
        &self,
        config: &DatabaseConfig,
        include_stats: bool,
    ) -> Result<SchemaAnalysis> {
        if !config.family.is_relational() {
            return Err(Error::database(format!(
                "schema analysis is not supported for {}",
                config.family
            )));
        }

        let client = SqlClient::new(config.clone());
        let mut analysis = SchemaAnalysis::new(config.family);

        match config.family.base() {
            EngineFamily::Mysql => {
                self.analyze_mysql(&client, config, include_stats, &mut analysis)
                    .await
            }
            EngineFamily::Postgres => {
                self.analyze_postgres(&client, include_stats, &mut analysis)
                    .await
            }
            EngineFamily::Sqlite => {
                self.analyze_sqlite(&client, include_stats, &mut analysis)
                    .await
            }
            _ => unreachable!("is_relational() covers the remaining families"),
        }

        Ok(analysis)
    }

    async fn analyze_mysql(
        &self,
        client: &SqlClient,
        config: &DatabaseConfig,
        include_stats: bool,
        analysis: &mut SchemaAnalysis,
    ) {
        let db = config.database.clone().unwrap_or_default();

        analysis.version = client.query_scalar("SELECT VERSION()").await.ok().flatten();

        let tables = client
            .query(&format!(
                "SELECT table_name, table_rows, data_length + index_length \
                 FROM information_schema.tables \
                 WHERE table_schema = '{db}' AND table_type = 'BASE TABLE' ORDER BY table_name"
            ))
            .await;
        let tables = match tables {
            Ok(rows) => rows,
            Err(e) => {
                analysis.error(format!("failed to enumerate tables: {e}"));
                return;
            }
        };

        for row in tables {
            let name = row.first().cloned().flatten().unwrap_or_default();
            let mut info = TableInfo {
                name: name.clone(),
                ..Default::default()
            };
            if include_stats {
                info.row_count = row.get(1).cloned().flatten().and_then(|v| v.parse().ok());
                info.size_bytes = row.get(2).cloned().flatten().and_then(|v| v.parse().ok());
            }

            match client
                .query(&format!(
                    "SELECT column_name, data_type, is_nullable, column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = '{db}' AND table_name = '{name}' \
                     ORDER BY ordinal_position"
                ))
                .await
            {
                Ok(columns) => {
                    info.columns = columns
                        .into_iter()
                        .map(|col| ColumnInfo {
                            name: col.first().cloned().flatten().unwrap_or_default(),
                            data_type: col.get(1).cloned().flatten().unwrap_or_default(),
                            nullable: col.get(2).cloned().flatten().as_deref() == Some("YES"),
                            default: col.get(3).cloned().flatten(),
                        })
                        .collect();
                }
                Err(e) => analysis.warn(format!("failed to analyze table {name}: {e}")),
            }

            if let Ok(pk) = client
                .query(&format!(
                    "SELECT column_name FROM information_schema.key_column_usage \
                     WHERE table_schema = '{db}' AND table_name = '{name}' \
                     AND constraint_name = 'PRIMARY' ORDER BY ordinal_position"
                ))
                .await
            {
                let columns: Vec<String> = pk
                    .into_iter()
                    .filter_map(|r| r.into_iter().next().flatten())
                    .collect();
                if !columns.is_empty() {
                    info.primary_key = Some(columns);
                }
            }

            analysis.tables.insert(name, info);
        }

        match client
            .query(&format!(
                "SELECT table_name, column_name, referenced_table_name, referenced_column_name \
                 FROM information_schema.key_column_usage \
                 WHERE table_schema = '{db}' AND referenced_table_name IS NOT NULL"
            ))
            .await
        {
            Ok(rows) => {
                for row in rows {
                    analysis.foreign_keys.push(ForeignKeyInfo {
                        table: row.first().cloned().flatten().unwrap_or_default(),
                        columns: vec![row.get(1).cloned().flatten().unwrap_or_default()],
                        referred_table: row.get(2).cloned().flatten().unwrap_or_default(),
                        referred_columns: vec![row.get(3).cloned().flatten().unwrap_or_default()],
                    });
                }
            }
            Err(e) => analysis.warn(format!("could not get foreign keys: {e}")),
        }

        match client
            .query(&format!(
                "SELECT DISTINCT index_name, table_name, non_unique \
                 FROM information_schema.statistics WHERE table_schema = '{db}'"
            ))
            .await
        {
            Ok(rows) => {
                for row in rows {
                    analysis.indexes.push(IndexInfo {
                        name: row.first().cloned().flatten().unwrap_or_default(),
                        table: row.get(1).cloned().flatten().unwrap_or_default(),
                        unique: row.get(2).cloned().flatten().as_deref() == Some("0"),
                    });
                }
            }
            Err(e) => analysis.warn(format!("could not get indexes: {e}")),
        }

        if let Ok(rows) = client
            .query(&format!(
                "SELECT constraint_type, COUNT(*) FROM information_schema.table_constraints \
                 WHERE table_schema = '{db}' GROUP BY constraint_type"
            ))
            .await
        {
            for row in rows {
                let kind = row.first().cloned().flatten().unwrap_or_default();
                let count: u64 = row
                    .get(1)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                match kind.as_str() {
                    "UNIQUE" => analysis.unique_constraints = count,
                    "CHECK" => analysis.check_constraints = count,
                    _ => {}
                }
            }
        }

        match client
            .query(&format!(
                "SELECT table_name FROM information_schema.views WHERE table_schema = '{db}'"
            ))
            .await
        {
            Ok(rows) => {
                analysis.views = rows
                    .into_iter()
                    .filter_map(|r| r.into_iter().next().flatten())
                    .collect();
            }
            Err(e) => analysis.warn(format!("could not analyze views: {e}")),
        }

        match client
            .query(&format!(
                "SELECT routine_name, routine_type FROM information_schema.routines \
                 WHERE routine_schema = '{db}'"
            ))
            .await
        {
            Ok(rows) => {
                for row in rows {
                    analysis.functions.push(RoutineInfo {
                        name: row.first().cloned().flatten().unwrap_or_default(),
                        kind: row
                            .get(1)
                            .cloned()
                            .flatten()
                            .unwrap_or_default()
                            .to_lowercase(),
                    });
                }
            }
            Err(e) => analysis.warn(format!("could not get functions/procedures: {e}")),
        }
    }

    async fn analyze_postgres(
        &self,
        client: &SqlClient,
        include_stats: bool,
        analysis: &mut SchemaAnalysis,
    ) {
        analysis.version = client
            .query_scalar("SHOW server_version")
            .await
            .ok()
            .flatten();

        let tables = match client
            .query("SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename")
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                analysis.error(format!("failed to enumerate tables: {e}"));
                return;
            }
        };

        for row in tables {
            let name = row.into_iter().next().flatten().unwrap_or_default();
            let mut info = TableInfo {
                name: name.clone(),
                ..Default::default()
            };

            match client
                .query(&format!(
                    "SELECT column_name, data_type, is_nullable, column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = 'public' AND table_name = '{name}' \
                     ORDER BY ordinal_position"
                ))
                .await
            {
                Ok(columns) => {
                    info.columns = columns
                        .into_iter()
                        .map(|col| ColumnInfo {
                            name: col.first().cloned().flatten().unwrap_or_default(),
                            data_type: col.get(1).cloned().flatten().unwrap_or_default(),
                            nullable: col.get(2).cloned().flatten().as_deref() == Some("YES"),
                            default: col.get(3).cloned().flatten(),
                        })
                        .collect();
                }
                Err(e) => analysis.warn(format!("failed to analyze table {name}: {e}")),
            }

            if let Ok(pk) = client
                .query(&format!(
                    "SELECT a.attname FROM pg_index i \
                     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                     WHERE i.indrelid = 'public.\"{name}\"'::regclass AND i.indisprimary \
                     ORDER BY a.attnum"
                ))
                .await
            {
                let columns: Vec<String> = pk
                    .into_iter()
                    .filter_map(|r| r.into_iter().next().flatten())
                    .collect();
                if !columns.is_empty() {
                    info.primary_key = Some(columns);
                }
            }

            if include_stats {
                info.row_count = client
                    .query_scalar(&format!(
                        "SELECT n_live_tup FROM pg_stat_user_tables WHERE relname = '{name}'"
                    ))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok());
                info.size_bytes = client
                    .query_scalar(&format!("SELECT pg_total_relation_size('public.\"{name}\"')"))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok());
            }

            analysis.tables.insert(name, info);
        }

        match client
            .query(
                "SELECT tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON tc.constraint_name = ccu.constraint_name \
                 WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'",
            )
            .await
        {
            Ok(rows) => {
                for row in rows {
                    analysis.foreign_keys.push(ForeignKeyInfo {
                        table: row.first().cloned().flatten().unwrap_or_default(),
                        columns: vec![row.get(1).cloned().flatten().unwrap_or_default()],
                        referred_table: row.get(2).cloned().flatten().unwrap_or_default(),
                        referred_columns: vec![row.get(3).cloned().flatten().unwrap_or_default()],
                    });
                }
            }
            Err(e) => analysis.warn(format!("could not get foreign keys: {e}")),
        }

        if let Ok(rows) = client
            .query("SELECT indexname, tablename, indexdef FROM pg_indexes WHERE schemaname = 'public'")
            .await
        {
            for row in rows {
                let def = row.get(2).cloned().flatten().unwrap_or_default();
                analysis.indexes.push(IndexInfo {
                    name: row.first().cloned().flatten().unwrap_or_default(),
                    table: row.get(1).cloned().flatten().unwrap_or_default(),
                    unique: def.contains("UNIQUE"),
                });
            }
        }

        if let Ok(rows) = client
            .query(
                "SELECT constraint_type, COUNT(*) FROM information_schema.table_constraints \
                 WHERE table_schema = 'public' GROUP BY constraint_type",
            )
            .await
        {
            for row in rows {
                let kind = row.first().cloned().flatten().unwrap_or_default();
                let count: u64 = row
                    .get(1)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                match kind.as_str() {
                    "UNIQUE" => analysis.unique_constraints = count,
                    "CHECK" => analysis.check_constraints = count,
                    _ => {}
                }
            }
        }

        match client
            .query("SELECT table_name FROM information_schema.views WHERE table_schema = 'public'")
            .await
        {
            Ok(rows) => {
                analysis.views = rows
                    .into_iter()
                    .filter_map(|r| r.into_iter().next().flatten())
                    .collect();
            }
            Err(e) => analysis.warn(format!("could not analyze views: {e}")),
        }

        match client
            .query("SELECT sequencename FROM pg_sequences WHERE schemaname = 'public'")
            .await
        {
            Ok(rows) => {
                analysis.sequences = rows
                    .into_iter()
                    .filter_map(|r| r.into_iter().next().flatten())
                    .collect();
            }
            Err(e) => analysis.warn(format!("could not get sequences: {e}")),
        }

        match client
            .query(
                "SELECT proname, CASE prokind WHEN 'p' THEN 'procedure' \
                 WHEN 'a' THEN 'aggregate' ELSE 'function' END \
                 FROM pg_proc WHERE pronamespace = 'public'::regnamespace",
            )
            .await
        {
            Ok(rows) => {
                for row in rows {
                    analysis.functions.push(RoutineInfo {
                        name: row.first().cloned().flatten().unwrap_or_default(),
                        kind: row.get(1).cloned().flatten().unwrap_or_default(),
                    });
                }
            }
            Err(e) => analysis.warn(format!("could not get functions/procedures: {e}")),
        }
    }

    async fn analyze_sqlite(
        &self,
        client: &SqlClient,
        include_stats: bool,
        analysis: &mut SchemaAnalysis,
    ) {
        analysis.version = client
            .query_scalar("SELECT sqlite_version()")
            .await
            .ok()
            .flatten();

        let tables = match client
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                analysis.error(format!("failed to enumerate tables: {e}"));
                return;
            }
        };

        for row in tables {
            let name = row.into_iter().next().flatten().unwrap_or_default();
            let mut info = TableInfo {
                name: name.clone(),
                ..Default::default()
            };

            match client.query(&format!("PRAGMA table_info(\"{name}\")")).await {
                Ok(columns) => {
                    let mut pk_columns = Vec::new();
                    for col in columns {
                        let col_name = col.get(1).cloned().flatten().unwrap_or_default();
                        let pk_flag: u32 = col
                            .get(5)
                            .cloned()
                            .flatten()
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        if pk_flag > 0 {
                            pk_columns.push(col_name.clone());
                        }
                        info.columns.push(ColumnInfo {
                            name: col_name,
                            data_type: col.get(2).cloned().flatten().unwrap_or_default(),
                            nullable: col.get(3).cloned().flatten().as_deref() == Some("0"),
                            default: col.get(4).cloned().flatten(),
                        });
                    }
                    if !pk_columns.is_empty() {
                        info.primary_key = Some(pk_columns);
                    }
                }
                Err(e) => analysis.warn(format!("failed to analyze table {name}: {e}")),
            }

            if let Ok(fks) = client
                .query(&format!("PRAGMA foreign_key_list(\"{name}\")"))
                .await
            {
                for fk in fks {
                    analysis.foreign_keys.push(ForeignKeyInfo {
                        table: name.clone(),
                        columns: vec![fk.get(3).cloned().flatten().unwrap_or_default()],
                        referred_table: fk.get(2).cloned().flatten().unwrap_or_default(),
                        referred_columns: vec![fk.get(4).cloned().flatten().unwrap_or_default()],
                    });
                }
            }

            if include_stats {
                info.row_count = client
                    .query_scalar(&format!("SELECT COUNT(*) FROM \"{name}\""))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok());
            }

            analysis.tables.insert(name, info);
        }

        if let Ok(rows) = client
            .query("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")
            .await
        {
            analysis.views = rows
                .into_iter()
                .filter_map(|r| r.into_iter().next().flatten())
                .collect();
        }

        if let Ok(rows) = client
            .query(
                "SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' \
                 AND name NOT LIKE 'sqlite_%'",
            )
            .await
        {
            for row in rows {
                analysis.indexes.push(IndexInfo {
                    name: row.first().cloned().flatten().unwrap_or_default(),
                    table: row.get(1).cloned().flatten().unwrap_or_default(),
                    unique: false,
                });
            }
        }
    }

    /// Compare a source analysis against a destination analysis and
    /// derive complexity and a recommended transfer method.
    pub fn analyze_compatibility(
        &self,
        source_config: &DatabaseConfig,
        destination_config: &DatabaseConfig,
        source: &SchemaAnalysis,
        destination: &SchemaAnalysis,
    ) -> CompatibilityReport {
        let mut report = CompatibilityReport::new();

        if !source.success {
            report.issue("could not analyze source schema");
            return report;
        }

        // Entity-name conflicts invalidate.
        let conflicts: Vec<&String> = source
            .tables
            .keys()
            .filter(|name| destination.tables.contains_key(*name))
            .collect();
        if !conflicts.is_empty() {
            report.issue(format!(
                "table name conflicts detected: {}",
                conflicts
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            report
                .recommendations
                .push("consider table prefixes or renaming conflicting tables".to_string());
        }

        // Engine-specific data types may map lossily.
        for table in source.tables.values() {
            for column in &table.columns {
                let dtype = column.data_type.to_uppercase();
                if dtype.contains("ENUM") {
                    report.warnings.push(format!(
                        "ENUM type in {}.{} may need conversion",
                        table.name, column.name
                    ));
                } else if dtype.contains("JSON") {
                    report.warnings.push(format!(
                        "JSON type in {}.{} may not be supported in the destination",
                        table.name, column.name
                    ));
                } else if dtype.contains("GEOMETRY") || dtype.contains("GEOGRAPHY") {
                    report.warnings.push(format!(
                        "spatial type in {}.{} may need special handling",
                        table.name, column.name
                    ));
                }
            }
        }

        if !source.sequences.is_empty()
            && destination_config.family.base() != EngineFamily::Postgres
        {
            report
                .warnings
                .push("source database uses sequences which may not be supported in destination".to_string());
            report.unsupported_features.push("sequences".to_string());
        }
        if !source.functions.is_empty() {
            report.warnings.push(
                "source database contains functions/procedures that will need manual migration"
                    .to_string(),
            );
            report
                .unsupported_features
                .push("functions/procedures".to_string());
        }
        if !source.views.is_empty() {
            report
                .recommendations
                .push("views will need to be recreated after data migration".to_string());
        }

        report.complexity = complexity_score(source, report.issues.len());
        self.recommend_method(source_config, destination_config, &mut report);
        report
    }

    fn recommend_method(
        &self,
        source: &DatabaseConfig,
        destination: &DatabaseConfig,
        report: &mut CompatibilityReport,
    ) {
        if source.family == destination.family {
            report.recommended_method = Some(TransferMethod::DumpRestore);
            report
                .recommendations
                .push("use dump and restore for same-engine migration".to_string());
        } else if source.family.is_cloud_managed() || destination.family.is_cloud_managed() {
            report.recommended_method = Some(TransferMethod::CloudNative);
            report.recommendations.push(
                "use cloud-native migration tooling when available, falling back to dump and restore"
                    .to_string(),
            );
        } else if source.family.is_relational() && destination.family.is_relational() {
            if report.complexity == Complexity::Simple {
                report.recommended_method = Some(TransferMethod::DirectTransfer);
                report
                    .recommendations
                    .push("use direct transfer for this migration".to_string());
            } else {
                report.recommended_method = Some(TransferMethod::DumpRestore);
                report
                    .recommendations
                    .push("use dump and restore with schema transformation".to_string());
            }
        } else {
            report.recommended_method = Some(TransferMethod::DumpRestore);
            report
                .recommendations
                .push("use dump and restore as the fallback method".to_string());
        }
    }
}

/// Entity count >5/>20/>100 adds 1/2/3; foreign keys >5/>20 add 1/2;
/// views add 1; functions add 2; each invalidating issue adds 1.
/// Scores of 6 and up are complex, 3 and up moderate.
fn complexity_score(source: &SchemaAnalysis, issue_count: usize) -> Complexity {
    let mut score = 0usize;

    let table_count = source.table_count();
    if table_count > 100 {
        score += 3;
    } else if table_count > 20 {
        score += 2;
    } else if table_count > 5 {
        score += 1;
    }

    let fk_count = source.foreign_key_count();
    if fk_count > 20 {
        score += 2;
    } else if fk_count > 5 {
        score += 1;
    }

    if !source.views.is_empty() {
        score += 1;
    }
    if !source.functions.is_empty() {
        score += 2;
    }
    score += issue_count;

    if score >= 6 {
        Complexity::Complex
    } else if score >= 3 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}
