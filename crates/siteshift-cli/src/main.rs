use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use siteshift_core::error::Error;
use siteshift_core::orchestrator::{Orchestrator, Reporter, build_steps};
use siteshift_core::retention::RetentionPolicy;
use siteshift_core::scheduler::{DEFAULT_MAX_CONCURRENT, Scheduler};
use siteshift_core::store::ArtifactStore;
use siteshift_types::{ArtifactKind, MigrationConfig, ScheduleOptions};

mod progress;

use progress::CliReporter;

#[derive(Parser, Debug)]
#[command(name = "siteshift", version)]
#[command(about = "Resumable, rollback-capable migrations for web properties")]
struct Cli {
    /// Path to the migration configuration (TOML or JSON).
    #[arg(long, default_value = "siteshift.toml")]
    config: PathBuf,

    /// Directory for backup artifacts and scheduler state.
    #[arg(long, default_value = ".siteshift")]
    state_dir: PathBuf,

    /// Keep only the newest N backups per retention pass.
    #[arg(long)]
    max_backups: Option<usize>,

    /// Delete backups older than this many days per retention pass.
    #[arg(long)]
    max_backup_age_days: Option<u32>,

    /// Emit the final session as JSON on stdout for machine consumers.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the dependency-ordered step graph for the configuration.
    Plan,
    /// Run pre-flight validation without migrating anything.
    Validate,
    /// Execute the migration (validates, isolates, backs up, migrates,
    /// verifies; rolls back on failure when configured).
    Migrate,
    /// Produce the configured backup artifact set without migrating.
    Backup,
    /// Manage scheduled migrations.
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCommands,
    },
    /// Show artifact store statistics and integrity.
    Store {
        /// Recompute digests for every artifact file.
        #[arg(long)]
        deep: bool,
    },
    /// Print environment and external tool diagnostics.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Queue the migration for immediate execution and run it.
    Now,
    /// Run the migration at a fixed time (RFC 3339).
    At { when: String },
    /// Run the migration on a cron cadence until interrupted.
    Cron {
        expression: String,
        /// Stop recurring after this time (RFC 3339).
        #[arg(long)]
        until: Option<String>,
    },
    /// Run the migration every fixed interval (e.g. 6h, 30m).
    Every {
        interval: String,
        #[arg(long)]
        until: Option<String>,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("[error] {error}");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::config(format!("cannot start runtime: {e}")))?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<(), Error> {
    let reporter = CliReporter::new();

    match &cli.cmd {
        Commands::Plan => {
            let config = load_config(&cli.config)?;
            print_plan(&config);
            Ok(())
        }
        Commands::Validate => {
            // Pre-flight only: surface the summary, never migrate.
            use siteshift_core::orchestrator::{PreflightValidator, ValidationEngine};
            let config = load_config(&cli.config)?;
            let summary = PreflightValidator.validate(&config).await?;
            for warning in &summary.warnings {
                reporter.warn(warning);
            }
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary)
                        .map_err(|e| Error::config(e.to_string()))?
                );
            }
            if !summary.can_proceed {
                let message = summary
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "pre-flight validation failed".to_string());
                return Err(Error::validation(message));
            }
            reporter.info(&format!(
                "pre-flight passed: {}/{} checks",
                summary.checks_passed, summary.checks_performed
            ));
            Ok(())
        }
        Commands::Migrate => {
            let config = load_config(&cli.config)?;
            let orchestrator = build_orchestrator(&cli)?;
            let session = orchestrator.create_session(config)?;
            reporter.info(&format!("created migration session {}", session.id));

            let result = orchestrator.execute(&session.id, &reporter).await;
            let final_session = orchestrator.get_status(&session.id).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&final_session)
                        .map_err(|e| Error::config(e.to_string()))?
                );
            } else {
                progress::print_session_summary(&final_session);
            }
            result.map(|_| ())
        }
        Commands::Backup => {
            let config = load_config(&cli.config)?;
            let orchestrator = build_orchestrator(&cli)?;
            let artifacts = orchestrator
                .backup_manager()
                .full_system_backup(&config, &config.source, config.source_database.as_ref())
                .await?;
            for artifact in &artifacts {
                reporter.info(&format!(
                    "{}: {} ({} bytes)",
                    artifact.kind,
                    artifact.location.display(),
                    artifact.size
                ));
            }
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&artifacts)
                        .map_err(|e| Error::config(e.to_string()))?
                );
            }
            Ok(())
        }
        Commands::Schedule { cmd } => run_schedule(&cli, cmd, &reporter).await,
        Commands::Store { deep } => {
            let store = build_store(&cli)?;
            let stats = store.stats()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).map_err(|e| Error::config(e.to_string()))?
            );
            if *deep {
                reporter.warn("deep verification needs tracked artifact records; run after a backup");
            }
            Ok(())
        }
        Commands::Doctor => {
            let config = load_config(&cli.config)?;
            run_doctor(&config, &reporter);
            Ok(())
        }
    }
}

async fn run_schedule(
    cli: &Cli,
    cmd: &ScheduleCommands,
    reporter: &CliReporter,
) -> Result<(), Error> {
    let orchestrator = Arc::new(build_orchestrator(cli)?);
    let persistence = cli.state_dir.join("schedules.json");
    std::fs::create_dir_all(&cli.state_dir)
        .map_err(|e| Error::config(format!("cannot create state dir: {e}")))?;
    let scheduler = Scheduler::new(orchestrator, DEFAULT_MAX_CONCURRENT, Some(persistence))?;
    let config = load_config(&cli.config)?;
    let options = ScheduleOptions::default();

    let id = match cmd {
        ScheduleCommands::Now => scheduler.schedule_immediate(config, options)?,
        ScheduleCommands::At { when } => {
            let run_at: DateTime<Utc> = when
                .parse()
                .map_err(|e| Error::scheduler(format!("invalid timestamp '{when}': {e}")))?;
            scheduler.schedule_delayed(config, run_at, options)?
        }
        ScheduleCommands::Cron { expression, until } => {
            let end = parse_until(until.as_deref())?;
            scheduler.schedule_cron(config, expression, end, options)?
        }
        ScheduleCommands::Every { interval, until } => {
            let duration = humantime::parse_duration(interval)
                .map_err(|e| Error::scheduler(format!("invalid interval '{interval}': {e}")))?;
            let end = parse_until(until.as_deref())?;
            scheduler.schedule_recurring(config, duration.as_secs(), end, options)?
        }
    };
    reporter.info(&format!("scheduled migration {id}"));

    // Drive the control loop until every schedule reaches a terminal
    // status (one-shot kinds) or until interrupted (recurring kinds).
    scheduler.start();
    let recurring = matches!(
        cmd,
        ScheduleCommands::Cron { .. } | ScheduleCommands::Every { .. }
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                reporter.warn("interrupted; stopping scheduler");
                scheduler.stop();
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                if !recurring
                    && scheduler
                        .list(None, None)
                        .iter()
                        .all(|s| s.status.is_terminal())
                {
                    scheduler.stop();
                    break;
                }
            }
        }
    }

    let status = scheduler.status();
    println!(
        "{}",
        serde_json::to_string_pretty(&status).map_err(|e| Error::config(e.to_string()))?
    );
    if status.failed > 0 {
        return Err(Error::scheduler(format!(
            "{} scheduled migration(s) failed",
            status.failed
        )));
    }
    Ok(())
}

fn parse_until(until: Option<&str>) -> Result<Option<DateTime<Utc>>, Error> {
    until
        .map(|value| {
            value
                .parse()
                .map_err(|e| Error::scheduler(format!("invalid timestamp '{value}': {e}")))
        })
        .transpose()
}

fn build_store(cli: &Cli) -> Result<ArtifactStore, Error> {
    let retention = RetentionPolicy {
        max_count: cli.max_backups,
        max_age_days: cli.max_backup_age_days,
        ..Default::default()
    };
    ArtifactStore::new(cli.state_dir.join("backups"), retention)
}

fn build_orchestrator(cli: &Cli) -> Result<Orchestrator, Error> {
    Ok(Orchestrator::new(Arc::new(build_store(cli)?)))
}

fn load_config(path: &PathBuf) -> Result<MigrationConfig, Error> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))
        .map_err(|e| Error::config(e.to_string()))?;

    let config: MigrationConfig = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON config {}", path.display()))
            .map_err(|e| Error::config(format!("{e:#}")))?
    } else {
        toml::from_str(&raw)
            .with_context(|| format!("invalid TOML config {}", path.display()))
            .map_err(|e| Error::config(format!("{e:#}")))?
    };
    config.validate().map_err(Error::Config)?;
    Ok(config)
}

fn print_plan(config: &MigrationConfig) {
    println!("migration: {}", config.name);
    println!(
        "source: {} ({})",
        config.source.host, config.source.kind
    );
    println!(
        "destination: {} ({})",
        config.destination.host, config.destination.kind
    );
    println!();

    for (idx, step) in build_steps(config).iter().enumerate() {
        let deps = if step.dependencies.is_empty() {
            String::new()
        } else {
            format!("  (after: {})", step.dependencies.join(", "))
        };
        println!("{:>3}. {}{deps}", idx + 1, step.id);
    }
}

fn run_doctor(config: &MigrationConfig, reporter: &CliReporter) {
    println!("siteshift doctor");
    println!("git sha: {}", env!("SITESHIFT_GIT_SHA"));
    println!("build profile: {}", env!("SITESHIFT_BUILD_PROFILE"));
    println!("rustc: {}", env!("SITESHIFT_RUSTC_VERSION"));
    println!();

    let mut tools: Vec<&str> = vec!["tar", "sh"];
    for db in [&config.source_database, &config.destination_database]
        .into_iter()
        .flatten()
    {
        if let Some(dump) = db.family.dump_tool() {
            tools.push(dump);
        }
        tools.push(db.family.client_tool());
        tools.push(db.family.restore_tool());
    }
    tools.sort_unstable();
    tools.dedup();

    for tool in tools {
        match siteshift_core::process::find_tool(tool) {
            Some(path) => println!("{tool}: {}", path.display()),
            None => reporter.warn(&format!("{tool}: not found on PATH")),
        }
    }

    println!();
    for kind in [
        ArtifactKind::FileArchive,
        ArtifactKind::DatabaseDump,
        ArtifactKind::Configuration,
    ] {
        println!(
            "{} backups land under <state-dir>/backups/{}/",
            kind.family(),
            kind.tag()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_migrate() {
        let cli = Cli::try_parse_from(["siteshift", "--config", "m.toml", "migrate"]).unwrap();
        assert!(matches!(cli.cmd, Commands::Migrate));
        assert_eq!(cli.config, PathBuf::from("m.toml"));
    }

    #[test]
    fn test_cli_parses_schedule_cron() {
        let cli = Cli::try_parse_from([
            "siteshift",
            "schedule",
            "cron",
            "0 2 * * *",
            "--until",
            "2027-01-01T00:00:00Z",
        ])
        .unwrap();
        match cli.cmd {
            Commands::Schedule {
                cmd: ScheduleCommands::Cron { expression, until },
            } => {
                assert_eq!(expression, "0 2 * * *");
                assert!(until.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_load_config_round_trips_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.toml");
        let config = MigrationConfig::minimal("toml-roundtrip");
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_config_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.json");
        std::fs::write(
            &path,
            r#"{"name": "x", "frobnicate": true,
                "source": {"kind": "generic", "host": "a"},
                "destination": {"kind": "generic", "host": "b"}}"#,
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_until() {
        assert!(parse_until(None).unwrap().is_none());
        assert!(parse_until(Some("2027-01-01T00:00:00Z")).unwrap().is_some());
        assert!(parse_until(Some("next tuesday")).is_err());
    }
}
