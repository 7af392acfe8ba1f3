//! # siteshift-core
//!
//! A reliability layer around web-property migrations: move a site's
//! file tree, database, and configuration from one host to another with
//! pre-flight validation, typed checksummed backups, maintenance-mode
//! isolation, dependency-ordered step execution, post-migration
//! verification, and automatic rollback on failure.
//!
//! ## Features
//!
//! - **Deterministic step graphs** — Every session runs a topologically
//!   ordered step graph; dependency-disjoint steps may run concurrently
//!   behind a configurable cap.
//! - **Typed backups** — File archives, relational and key-value dumps,
//!   configuration snapshots, and cloud-resource manifests, all
//!   SHA-256 checksummed in a retention-managed artifact store.
//! - **Pre-restore validation** — Every artifact passes a recovery
//!   check suite (existence, digest, structural probe, tool and disk
//!   readiness) before a rollback touches it.
//! - **Engine-driven data migration** — MySQL, PostgreSQL, SQLite,
//!   MongoDB, and Redis engines drive their families' external client
//!   and dump utilities with keyset pagination and pull-based progress
//!   streams.
//! - **Rollback plans** — Newest-artifact-first restore plans with
//!   force/continue/skip-validation edge controls and manual recovery
//!   guidance when automation cannot finish.
//! - **Scheduling** — Immediate, delayed, cron, and recurring
//!   migrations through a bounded concurrent queue with exponential
//!   retry and exact-round-trip persistence.
//!
//! ## Pipeline
//!
//! The core flow is **validate → isolate → back up → migrate → verify →
//! (roll back on failure)**:
//!
//! 1. [`orchestrator::Orchestrator::create_session`] freezes a
//!    [`siteshift_types::MigrationConfig`] and builds the step graph.
//! 2. [`orchestrator::Orchestrator::execute`] drives the phases,
//!    registering every produced artifact on the session.
//! 3. On failure after backups, [`rollback::RollbackEngine`] restores
//!    the artifact set newest-first.
//! 4. [`scheduler::Scheduler`] owns session creation timing and bounded
//!    parallel execution.

pub mod backup;
pub mod db_mongo;
pub mod db_mysql;
pub mod db_postgres;
pub mod db_redis;
pub mod db_sqlite;
pub mod dbengine;
pub mod digest;
pub mod error;
pub mod integrity;
pub mod maintenance;
pub mod orchestrator;
pub mod process;
pub mod recovery;
pub mod retention;
pub mod rollback;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod strategy;

pub use error::{Error, Result};

// The domain vocabulary lives in siteshift-types; re-export it so
// embedders need only this crate.
pub use siteshift_types as types;
