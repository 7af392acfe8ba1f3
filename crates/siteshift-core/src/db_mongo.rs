//! MongoDB (document) migration engine.
//!
//! Collections move through `mongodump`/`mongorestore` for bulk copy
//! and through `mongoexport`/`mongoimport` (JSON lines) for direct and
//! streaming transfer. Catalog queries run through `mongosh --eval`.

use async_trait::async_trait;
use siteshift_types::{DatabaseConfig, EngineFamily, TransferMethod};
use tokio::sync::mpsc;

use crate::dbengine::{
    CompatibilityFindings, DataMigrationSpec, DataMigrationStream, DataOutcome, DatabaseEngine,
    EntityInfo, MigrationEstimate, MigrationProgress, PROGRESS_CHANNEL_CAPACITY, SchemaOutcome,
    SchemaSummary, Side, VerificationOutcome, version_older,
};
use crate::error::{Error, Result};
use crate::process::{CommandSpec, run_async};

pub struct MongoEngine {
    source: DatabaseConfig,
    destination: DatabaseConfig,
}

impl MongoEngine {
    pub fn new(source: DatabaseConfig, destination: DatabaseConfig) -> Self {
        MongoEngine {
            source,
            destination,
        }
    }

    fn config(&self, side: Side) -> &DatabaseConfig {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    fn shell_command(&self, side: Side, script: &str) -> CommandSpec {
        let db = self.config(side);
        let mut spec = CommandSpec::new("mongosh")
            .arg("--quiet")
            .arg("--host")
            .arg(format!("{}:{}", db.host, db.effective_port()))
            .arg(db.database.clone().unwrap_or_default())
            .arg("--eval")
            .arg(script);
        if let Some(user) = &db.username {
            spec = spec.arg("--username").arg(user);
        }
        if let Some(pass) = &db.password {
            spec = spec.arg("--password").arg(pass);
        }
        if let Some(auth_source) = &db.auth_source {
            spec = spec.arg("--authenticationDatabase").arg(auth_source);
        }
        spec.timeout(std::time::Duration::from_secs(
            db.connection_timeout_secs.max(1) * 10,
        ))
    }

    async fn eval(&self, side: Side, script: &str) -> Result<String> {
        let output = run_async(self.shell_command(side, script)).await?;
        if !output.success() {
            return Err(Error::database(format!(
                "mongosh eval failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn collection_names(&self, side: Side) -> Result<Vec<String>> {
        let raw = self
            .eval(side, "db.getCollectionNames().sort().join('\\n')")
            .await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn count_documents(&self, side: Side, collection: &str) -> Result<u64> {
        let script = format!("db.getCollection('{collection}').countDocuments()");
        let raw = self.eval(side, &script).await?;
        raw.parse()
            .map_err(|_| Error::database(format!("unexpected count output for {collection}: {raw}")))
    }

    fn export_command(&self, collection: &str, output: &std::path::Path) -> CommandSpec {
        let db = &self.source;
        let mut spec = CommandSpec::new("mongoexport")
            .arg("--host")
            .arg(format!("{}:{}", db.host, db.effective_port()))
            .arg("--db")
            .arg(db.database.clone().unwrap_or_default())
            .arg("--collection")
            .arg(collection)
            .arg("--out")
            .arg(output.to_string_lossy().to_string());
        if let Some(user) = &db.username {
            spec = spec.arg("--username").arg(user);
        }
        if let Some(pass) = &db.password {
            spec = spec.arg("--password").arg(pass);
        }
        spec.timeout(crate::process::DEFAULT_TIMEOUT)
    }

    fn import_command(&self, collection: &str, input: &std::path::Path) -> CommandSpec {
        let db = &self.destination;
        let mut spec = CommandSpec::new("mongoimport")
            .arg("--host")
            .arg(format!("{}:{}", db.host, db.effective_port()))
            .arg("--db")
            .arg(db.database.clone().unwrap_or_default())
            .arg("--collection")
            .arg(collection)
            .arg("--file")
            .arg(input.to_string_lossy().to_string());
        if let Some(user) = &db.username {
            spec = spec.arg("--username").arg(user);
        }
        if let Some(pass) = &db.password {
            spec = spec.arg("--password").arg(pass);
        }
        spec.timeout(crate::process::DEFAULT_TIMEOUT)
    }

    async fn transfer_collection(&self, collection: &str) -> Result<u64> {
        let scratch = tempfile::Builder::new()
            .prefix("siteshift_mongo_")
            .suffix(".jsonl")
            .tempfile()
            .map_err(|e| Error::database(format!("cannot create export scratch file: {e}")))?;

        let export = run_async(self.export_command(collection, scratch.path())).await?;
        if !export.success() {
            return Err(Error::database(format!(
                "mongoexport failed for {collection}: {}",
                export.stderr.trim()
            )));
        }

        let mut import = run_async(self.import_command(collection, scratch.path())).await?;
        if !import.success() {
            let failure = Error::database(format!(
                "mongoimport failed for {collection}: {}",
                import.stderr.trim()
            ));
            if failure.is_transient() {
                import = run_async(self.import_command(collection, scratch.path())).await?;
            }
            if !import.success() {
                return Err(failure);
            }
        }

        self.count_documents(Side::Destination, collection).await
    }

    async fn transfer_all_by_archive(&self) -> Result<u64> {
        let scratch = tempfile::Builder::new()
            .prefix("siteshift_mongo_")
            .suffix(".archive")
            .tempfile()
            .map_err(|e| Error::database(format!("cannot create archive scratch file: {e}")))?;

        let src = &self.source;
        let mut dump = CommandSpec::new("mongodump")
            .arg("--host")
            .arg(format!("{}:{}", src.host, src.effective_port()))
            .arg("--db")
            .arg(src.database.clone().unwrap_or_default())
            .arg("--archive")
            .arg(scratch.path().to_string_lossy().to_string());
        if let Some(user) = &src.username {
            dump = dump.arg("--username").arg(user);
        }
        if let Some(pass) = &src.password {
            dump = dump.arg("--password").arg(pass);
        }
        let dump_out = run_async(dump.timeout(crate::process::DEFAULT_TIMEOUT)).await?;
        if !dump_out.success() {
            return Err(Error::database(format!(
                "mongodump failed: {}",
                dump_out.stderr.trim()
            )));
        }

        let dst = &self.destination;
        let mut restore = CommandSpec::new("mongorestore")
            .arg("--host")
            .arg(format!("{}:{}", dst.host, dst.effective_port()))
            .arg("--nsFrom")
            .arg(format!("{}.*", src.database.clone().unwrap_or_default()))
            .arg("--nsTo")
            .arg(format!("{}.*", dst.database.clone().unwrap_or_default()))
            .arg("--archive")
            .arg(scratch.path().to_string_lossy().to_string());
        if let Some(user) = &dst.username {
            restore = restore.arg("--username").arg(user);
        }
        if let Some(pass) = &dst.password {
            restore = restore.arg("--password").arg(pass);
        }
        let restore_out = run_async(restore.timeout(crate::process::DEFAULT_TIMEOUT)).await?;
        if !restore_out.success() {
            return Err(Error::database(format!(
                "mongorestore failed: {}",
                restore_out.stderr.trim()
            )));
        }

        let mut total = 0;
        for collection in self.collection_names(Side::Destination).await? {
            total += self
                .count_documents(Side::Destination, &collection)
                .await
                .unwrap_or(0);
        }
        Ok(total)
    }
}

#[async_trait]
impl DatabaseEngine for MongoEngine {
    fn family(&self) -> EngineFamily {
        self.source.family
    }

    async fn connect_source(&self) -> Result<()> {
        self.eval(Side::Source, "db.runCommand({ ping: 1 }).ok")
            .await
            .map(|_| ())
    }

    async fn connect_destination(&self) -> Result<()> {
        self.eval(Side::Destination, "db.runCommand({ ping: 1 }).ok")
            .await
            .map(|_| ())
    }

    async fn extract_schema(&self, side: Side) -> Result<SchemaSummary> {
        let mut entities = Vec::new();
        for collection in self.collection_names(side).await? {
            let records = self.count_documents(side, &collection).await.ok();
            entities.push(EntityInfo {
                name: collection,
                records,
            });
        }
        let version = self.eval(side, "db.version()").await.ok();
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

        let source_collections = self.collection_names(Side::Source).await?;
        let destination_collections = self
            .collection_names(Side::Destination)
            .await
            .unwrap_or_default();
        let collisions: Vec<&String> = source_collections
            .iter()
            .filter(|c| destination_collections.contains(c))
            .collect();
        if !collisions.is_empty() {
            findings.issues.push(format!(
                "collection name conflicts on destination: {collisions:?}"
            ));
        }

        let source_version = self.eval(Side::Source, "db.version()").await?;
        let destination_version = self.eval(Side::Destination, "db.version()").await?;
        if version_older(&destination_version, &source_version) {
            findings.issues.push(format!(
                "destination server {destination_version} is older than source {source_version}"
            ));
        }

        // Capped collections lose their bound through export/import.
        let capped = self
            .eval(
                Side::Source,
                "db.getCollectionInfos().filter(c => c.options && c.options.capped).map(c => c.name).join('\\n')",
            )
            .await
            .unwrap_or_default();
        for name in capped.lines().filter(|l| !l.trim().is_empty()) {
            findings.warnings.push(format!(
                "capped collection {name} loses its size bound under direct transfer; use bulk copy"
            ));
        }

        Ok(findings)
    }

    async fn estimate_size(&self) -> Result<MigrationEstimate> {
        let stats = self
            .eval(
                Side::Source,
                "const s = db.stats(); print(`${s.collections}\\t${s.objects}\\t${s.dataSize}`)",
            )
            .await?;
        let mut fields = stats.split('\t');
        Ok(MigrationEstimate {
            entities: fields.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            records: fields.next().and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            bytes: fields.next().and_then(|v| v.trim().parse().ok()),
        })
    }

    async fn migrate_schema(&self) -> Result<SchemaOutcome> {
        // Collections are created implicitly on insert; schema
        // migration creates them explicitly plus their indexes.
        let mut outcome = SchemaOutcome::default();
        for collection in self.collection_names(Side::Source).await? {
            let script = format!("db.createCollection('{collection}').ok");
            match self.eval(Side::Destination, &script).await {
                Ok(_) => outcome.entities_created += 1,
                Err(e) if e.to_string().contains("already exists") => {
                    outcome
                        .warnings
                        .push(format!("collection {collection} already exists on destination"));
                    outcome.entities_created += 1;
                }
                Err(e) => outcome.errors.push(format!("{collection}: {e}")),
            }
        }
        Ok(outcome)
    }

    async fn migrate_data(&self, spec: DataMigrationSpec) -> Result<DataMigrationStream> {
        if !self.supported_methods().contains(&spec.method) {
            return Err(Error::database(format!(
                "transfer method {} is not supported by the mongodb engine",
                spec.method
            )));
        }

        let collections = match &spec.entities {
            Some(collections) => collections.clone(),
            None => self.collection_names(Side::Source).await?,
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let engine = MongoEngine::new(self.source.clone(), self.destination.clone());
        let method = spec.method;
        let cancel = spec.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut outcome = DataOutcome::default();

            if method == TransferMethod::BulkCopy {
                let _ = tx
                    .send(MigrationProgress {
                        current_entity: None,
                        entities_completed: 0,
                        total_entities: 1,
                        records_processed: 0,
                        current_operation: "archiving database".to_string(),
                    })
                    .await;
                let records = engine.transfer_all_by_archive().await?;
                outcome.records_migrated = records;
                outcome.entities_migrated = collections.len() as u64;
                return Ok(outcome);
            }

            let total = collections.len() as u64;
            for (index, collection) in collections.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled(format!(
                        "data migration cancelled before collection {collection}"
                    )));
                }

                let _ = tx
                    .send(MigrationProgress {
                        current_entity: Some(collection.clone()),
                        entities_completed: index as u64,
                        total_entities: total,
                        records_processed: outcome.records_migrated,
                        current_operation: format!("migrating collection {collection}"),
                    })
                    .await;

                match engine.transfer_collection(&collection).await {
                    Ok(records) => {
                        outcome.records_migrated += records;
                        outcome.entities_migrated += 1;
                    }
                    Err(e) => outcome.errors.push(format!("{collection}: {e}")),
                }

                let _ = tx
                    .send(MigrationProgress {
                        current_entity: Some(collection.clone()),
                        entities_completed: index as u64 + 1,
                        total_entities: total,
                        records_processed: outcome.records_migrated,
                        current_operation: format!("finished collection {collection}"),
                    })
                    .await;
            }

            Ok(outcome)
        });

        Ok(DataMigrationStream::new(rx, handle))
    }

    async fn verify(&self, entities: Option<Vec<String>>) -> Result<VerificationOutcome> {
        let collections = match entities {
            Some(collections) => collections,
            None => self.collection_names(Side::Source).await?,
        };

        let mut outcome = VerificationOutcome {
            success: true,
            ..Default::default()
        };

        for collection in collections {
            outcome.entities_verified += 1;
            let source_count = self.count_documents(Side::Source, &collection).await;
            let destination_count = self.count_documents(Side::Destination, &collection).await;
            match (source_count, destination_count) {
                (Ok(s), Ok(d)) if s == d => {
                    // Spot-check a handful of document ids.
                    let sample_script = format!(
                        "db.getCollection('{collection}').find({{}}, {{ _id: 1 }})\
                         .sort({{ _id: 1 }}).limit(10).toArray().map(d => d._id).join('\\n')"
                    );
                    let source_ids = self.eval(Side::Source, &sample_script).await?;
                    let destination_ids = self.eval(Side::Destination, &sample_script).await?;
                    if source_ids == destination_ids {
                        outcome.matches += 1;
                    } else {
                        outcome
                            .mismatches
                            .push(format!("{collection}: sampled document ids differ"));
                        outcome.success = false;
                    }
                }
                (Ok(s), Ok(d)) => {
                    outcome.mismatches.push(format!(
                        "{collection}: source has {s} documents, destination has {d}"
                    ));
                    outcome.success = false;
                }
                (Err(e), _) | (_, Err(e)) => {
                    outcome.errors.push(format!("{collection}: {e}"));
                    outcome.success = false;
                }
            }
        }

        Ok(outcome)
    }

    fn supported_methods(&self) -> Vec<TransferMethod> {
        vec![
            TransferMethod::BulkCopy,
            TransferMethod::DirectTransfer,
            TransferMethod::Streaming,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MongoEngine {
        let mut source = DatabaseConfig::new(EngineFamily::Mongodb);
        source.database = Some("app".to_string());
        source.username = Some("svc".to_string());
        source.password = Some("pw".to_string());
        source.auth_source = Some("admin".to_string());
        let mut destination = DatabaseConfig::new(EngineFamily::Mongodb);
        destination.database = Some("app".to_string());
        MongoEngine::new(source, destination)
    }

    #[test]
    fn test_supported_methods() {
        let methods = engine().supported_methods();
        assert_eq!(
            methods,
            vec![
                TransferMethod::BulkCopy,
                TransferMethod::DirectTransfer,
                TransferMethod::Streaming,
            ]
        );
    }

    #[test]
    fn test_shell_command_includes_auth() {
        let spec = engine().shell_command(Side::Source, "db.version()");
        assert_eq!(spec.program, "mongosh");
        assert!(spec.args.contains(&"--quiet".to_string()));
        assert!(spec.args.contains(&"--authenticationDatabase".to_string()));
        assert!(spec.args.contains(&"admin".to_string()));
    }

    #[test]
    fn test_export_import_commands() {
        let engine = engine();
        let export = engine.export_command("users", std::path::Path::new("/tmp/users.jsonl"));
        assert_eq!(export.program, "mongoexport");
        assert!(export.args.contains(&"--collection".to_string()));

        let import = engine.import_command("users", std::path::Path::new("/tmp/users.jsonl"));
        assert_eq!(import.program, "mongoimport");
        assert!(import.args.contains(&"--file".to_string()));
    }

    #[tokio::test]
    async fn test_unsupported_method_rejected() {
        let spec = DataMigrationSpec::new(TransferMethod::DumpRestore, 100);
        let err = engine().migrate_data(spec).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
