//! Redis (key-value) migration engine.
//!
//! Keys are enumerated with `redis-cli --scan` and moved with the
//! server-side MIGRATE command in COPY REPLACE mode, which carries
//! values and TTLs natively and leaves the source untouched. Batch size
//! bounds the KEYS list per MIGRATE call and is the cancellation check
//! granularity.

use async_trait::async_trait;
use siteshift_types::{DatabaseConfig, EngineFamily, TransferMethod};
use tokio::sync::mpsc;

use crate::dbengine::{
    CompatibilityFindings, DataMigrationSpec, DataMigrationStream, DataOutcome, DatabaseEngine,
    EntityInfo, MigrationEstimate, MigrationProgress, PROGRESS_CHANNEL_CAPACITY, SchemaOutcome,
    SchemaSummary, Side, VerificationOutcome,
};
use crate::error::{Error, Result};
use crate::process::{CommandSpec, run_async};

/// Milliseconds MIGRATE waits per batch before giving up.
const MIGRATE_TIMEOUT_MS: u64 = 5000;

pub struct RedisEngine {
    source: DatabaseConfig,
    destination: DatabaseConfig,
}

impl RedisEngine {
    pub fn new(source: DatabaseConfig, destination: DatabaseConfig) -> Self {
        RedisEngine {
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

    fn cli(&self, side: Side) -> CommandSpec {
        let db = self.config(side);
        let mut spec = CommandSpec::new("redis-cli")
            .arg("-h")
            .arg(db.host.clone())
            .arg("-p")
            .arg(db.effective_port().to_string());
        if let Some(pass) = &db.password {
            spec = spec.arg("-a").arg(pass);
        }
        if let Some(index) = db.db_index {
            spec = spec.arg("-n").arg(index.to_string());
        }
        spec.timeout(std::time::Duration::from_secs(
            db.connection_timeout_secs.max(1) * 10,
        ))
    }

    async fn command(&self, side: Side, args: &[&str]) -> Result<String> {
        let output = run_async(self.cli(side).args(args.iter().copied())).await?;
        if !output.success() {
            return Err(Error::database(format!(
                "redis-cli {} failed: {}",
                args.first().copied().unwrap_or(""),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn scan_keys(&self, side: Side, pattern: Option<&str>) -> Result<Vec<String>> {
        let mut spec = self.cli(side).arg("--scan");
        if let Some(pattern) = pattern {
            spec = spec.arg("--pattern").arg(pattern);
        }
        let output = run_async(spec).await?;
        if !output.success() {
            return Err(Error::database(format!(
                "redis-cli --scan failed: {}",
                output.stderr.trim()
            )));
        }
        let mut keys: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn dbsize(&self, side: Side) -> Result<u64> {
        let raw = self.command(side, &["DBSIZE"]).await?;
        raw.parse()
            .map_err(|_| Error::database(format!("unexpected DBSIZE output: {raw}")))
    }

    /// One MIGRATE invocation moving a batch of keys.
    fn migrate_args(&self, keys: &[String]) -> Vec<String> {
        let dst = &self.destination;
        let mut args = vec![
            "MIGRATE".to_string(),
            dst.host.clone(),
            dst.effective_port().to_string(),
            "".to_string(),
            dst.db_index.unwrap_or(0).to_string(),
            MIGRATE_TIMEOUT_MS.to_string(),
            "COPY".to_string(),
            "REPLACE".to_string(),
        ];
        if let Some(pass) = &dst.password {
            args.push("AUTH".to_string());
            args.push(pass.clone());
        }
        args.push("KEYS".to_string());
        args.extend(keys.iter().cloned());
        args
    }

    async fn migrate_batch(&self, keys: &[String]) -> Result<()> {
        let args: Vec<String> = self.migrate_args(keys);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut result = self.command(Side::Source, &arg_refs).await;
        if let Err(e) = &result
            && e.is_transient()
        {
            result = self.command(Side::Source, &arg_refs).await;
        }
        result.map(|_| ())
    }
}

#[async_trait]
impl DatabaseEngine for RedisEngine {
    fn family(&self) -> EngineFamily {
        self.source.family
    }

    async fn connect_source(&self) -> Result<()> {
        let pong = self.command(Side::Source, &["PING"]).await?;
        if pong != "PONG" {
            return Err(Error::database(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    async fn connect_destination(&self) -> Result<()> {
        let pong = self.command(Side::Destination, &["PING"]).await?;
        if pong != "PONG" {
            return Err(Error::database(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    async fn extract_schema(&self, side: Side) -> Result<SchemaSummary> {
        // Key-value stores have no tables; the schema summary reports
        // key-prefix patterns (everything before the first colon).
        let keys = self.scan_keys(side, None).await?;
        let mut patterns: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        for key in &keys {
            let prefix = key.split(':').next().unwrap_or(key).to_string();
            *patterns.entry(format!("{prefix}:*")).or_default() += 1;
        }
        let entities = patterns
            .into_iter()
            .map(|(name, records)| EntityInfo {
                name,
                records: Some(records),
            })
            .collect();
        let info = self.command(side, &["INFO", "server"]).await?;
        let version = info
            .lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .map(|v| v.trim().to_string());
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

        let destination_size = self.dbsize(Side::Destination).await?;
        if destination_size > 0 {
            findings.warnings.push(format!(
                "destination database already holds {destination_size} keys; \
                 MIGRATE REPLACE will overwrite collisions"
            ));
        }

        Ok(findings)
    }

    async fn estimate_size(&self) -> Result<MigrationEstimate> {
        let records = self.dbsize(Side::Source).await?;
        let info = self.command(Side::Source, &["INFO", "memory"]).await?;
        let bytes = info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse().ok());
        Ok(MigrationEstimate {
            entities: 1,
            records,
            bytes,
        })
    }

    async fn migrate_schema(&self) -> Result<SchemaOutcome> {
        // Nothing to create; keys carry their own structure.
        Ok(SchemaOutcome {
            entities_created: 0,
            errors: Vec::new(),
            warnings: vec!["key-value stores have no schema to migrate".to_string()],
        })
    }

    async fn migrate_data(&self, spec: DataMigrationSpec) -> Result<DataMigrationStream> {
        if !self.supported_methods().contains(&spec.method) {
            return Err(Error::database(format!(
                "transfer method {} is not supported by the redis engine",
                spec.method
            )));
        }

        let keys = match &spec.entities {
            // Entities are key patterns for the key-value engine.
            Some(patterns) => {
                let mut keys = Vec::new();
                for pattern in patterns {
                    keys.extend(self.scan_keys(Side::Source, Some(pattern)).await?);
                }
                keys.sort();
                keys.dedup();
                keys
            }
            None => self.scan_keys(Side::Source, None).await?,
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let engine = RedisEngine::new(self.source.clone(), self.destination.clone());
        let batch_size = spec.batch_size;
        let cancel = spec.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut outcome = DataOutcome::default();
            let total_batches = keys.len().div_ceil(batch_size.max(1)) as u64;

            for (index, batch) in keys.chunks(batch_size.max(1)).enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled(
                        "data migration cancelled between key batches".to_string(),
                    ));
                }

                match engine.migrate_batch(batch).await {
                    Ok(()) => outcome.records_migrated += batch.len() as u64,
                    Err(e) => {
                        // Fall back to per-key MIGRATE so one bad key
                        // does not sink the batch.
                        let mut batch_failed = true;
                        for key in batch {
                            match engine.migrate_batch(std::slice::from_ref(key)).await {
                                Ok(()) => {
                                    outcome.records_migrated += 1;
                                    batch_failed = false;
                                }
                                Err(key_err) => outcome
                                    .errors
                                    .push(format!("key {key}: {key_err}")),
                            }
                        }
                        if batch_failed {
                            outcome.errors.push(format!("batch migrate failed: {e}"));
                        }
                    }
                }

                let _ = tx
                    .send(MigrationProgress {
                        current_entity: batch.first().map(|k| {
                            format!("{}:*", k.split(':').next().unwrap_or(k))
                        }),
                        entities_completed: index as u64 + 1,
                        total_entities: total_batches,
                        records_processed: outcome.records_migrated,
                        current_operation: format!(
                            "migrated {} of {} keys",
                            outcome.records_migrated,
                            keys.len()
                        ),
                    })
                    .await;
            }

            outcome.entities_migrated = if outcome.records_migrated > 0 { 1 } else { 0 };
            Ok(outcome)
        });

        Ok(DataMigrationStream::new(rx, handle))
    }

    async fn verify(&self, entities: Option<Vec<String>>) -> Result<VerificationOutcome> {
        let mut outcome = VerificationOutcome {
            success: true,
            ..Default::default()
        };

        let source_size = self.dbsize(Side::Source).await?;
        let destination_size = self.dbsize(Side::Destination).await?;
        outcome.entities_verified = 1;
        if destination_size < source_size {
            outcome.mismatches.push(format!(
                "destination holds {destination_size} keys, source holds {source_size}"
            ));
            outcome.success = false;
        } else {
            outcome.matches = 1;
        }

        // Spot-check a sample of keys for existence and TTL drift.
        let sample: Vec<String> = match entities {
            Some(patterns) => {
                let mut keys = Vec::new();
                for pattern in &patterns {
                    keys.extend(self.scan_keys(Side::Source, Some(pattern)).await?);
                }
                keys.truncate(10);
                keys
            }
            None => {
                let mut keys = self.scan_keys(Side::Source, None).await?;
                keys.truncate(10);
                keys
            }
        };

        for key in sample {
            let exists = self.command(Side::Destination, &["EXISTS", &key]).await?;
            if exists != "1" {
                outcome
                    .mismatches
                    .push(format!("key {key} missing on destination"));
                outcome.success = false;
                continue;
            }
            let source_ttl: i64 = self
                .command(Side::Source, &["TTL", &key])
                .await?
                .parse()
                .unwrap_or(-1);
            let destination_ttl: i64 = self
                .command(Side::Destination, &["TTL", &key])
                .await?
                .parse()
                .unwrap_or(-1);
            if (source_ttl - destination_ttl).abs() > 5 {
                outcome.mismatches.push(format!(
                    "key {key} TTL drift: source {source_ttl}s, destination {destination_ttl}s"
                ));
                outcome.success = false;
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

    fn engine() -> RedisEngine {
        let mut source = DatabaseConfig::new(EngineFamily::Redis);
        source.db_index = Some(2);
        let mut destination = DatabaseConfig::new(EngineFamily::Redis);
        destination.host = "target.example.com".to_string();
        destination.db_index = Some(0);
        destination.password = Some("pw".to_string());
        RedisEngine::new(source, destination)
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
    fn test_migrate_args_shape() {
        let args = engine().migrate_args(&["a:1".to_string(), "a:2".to_string()]);
        assert_eq!(args[0], "MIGRATE");
        assert_eq!(args[1], "target.example.com");
        // Empty key slot because the KEYS form is used.
        assert_eq!(args[3], "");
        assert!(args.contains(&"COPY".to_string()));
        assert!(args.contains(&"REPLACE".to_string()));
        assert!(args.contains(&"AUTH".to_string()));
        let keys_pos = args.iter().position(|a| a == "KEYS").unwrap();
        assert_eq!(&args[keys_pos + 1..], &["a:1", "a:2"]);
    }

    #[test]
    fn test_cli_selects_database_index() {
        let spec = engine().cli(Side::Source);
        let n_pos = spec.args.iter().position(|a| a == "-n").unwrap();
        assert_eq!(spec.args[n_pos + 1], "2");
    }

    #[tokio::test]
    async fn test_unsupported_method_rejected() {
        let spec = DataMigrationSpec::new(TransferMethod::FileCopy, 100);
        let err = engine().migrate_data(spec).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
