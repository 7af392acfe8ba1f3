//! Error taxonomy.
//!
//! Every failure surfaces as one of these kinds; the CLI translates the
//! kind into an exit code. Propagation rules: configuration and
//! validation errors are fatal before anything destructive runs; backup
//! and transfer errors trigger automatic rollback when enabled;
//! per-entity database errors accumulate and fail the step only when no
//! entity succeeded; verification errors are non-fatal by default;
//! rollback errors fail the session; scheduler errors isolate to the
//! affected schedule entry.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory configuration. Fatal to the session.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pre-flight validation rejected the migration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Pre-flight could not run at all (unreachable systems, missing tools).
    #[error("pre-flight error: {0}")]
    Preflight(String),

    /// Backup creation or verification failed.
    #[error("backup error: {0}")]
    Backup(String),

    /// File or data transfer failed mid-migration.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// A database engine operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Post-migration verification found discrepancies.
    #[error("verification error: {0}")]
    Verification(String),

    /// Rollback could not restore the previous state.
    #[error("rollback error: {0}")]
    Rollback(String),

    /// Artifact store I/O or permission failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Scheduler-level failure, isolated to one scheduled entry.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// A referenced entity (artifact, session, schedule) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was cancelled cooperatively.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Error::Preflight(msg.into())
    }

    pub fn backup(msg: impl Into<String>) -> Self {
        Error::Backup(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Error::Transfer(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Error::Verification(msg.into())
    }

    pub fn rollback(msg: impl Into<String>) -> Self {
        Error::Rollback(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn scheduler(msg: impl Into<String>) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Short tag naming the error kind, used in session error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::Preflight(_) => "preflight",
            Error::Backup(_) => "backup",
            Error::Transfer(_) => "transfer",
            Error::Database(_) => "database",
            Error::Verification(_) => "verification",
            Error::Rollback(_) => "rollback",
            Error::Storage(_) => "storage",
            Error::Scheduler(_) => "scheduler",
            Error::NotFound(_) => "not_found",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io",
        }
    }

    /// Exit code for CLI wrappers: 0 success, 1 configuration/usage,
    /// 2 validation failure, 3 pre-flight failure, 4 backup failure,
    /// 5 migration failure, 6 verification failure, 7 rollback failure,
    /// 8 scheduler failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::NotFound(_) => 1,
            Error::Validation(_) => 2,
            Error::Preflight(_) => 3,
            Error::Backup(_) | Error::Storage(_) | Error::Io(_) => 4,
            Error::Transfer(_) | Error::Database(_) | Error::Cancelled(_) => 5,
            Error::Verification(_) => 6,
            Error::Rollback(_) => 7,
            Error::Scheduler(_) => 8,
        }
    }

    /// Whether a single retry is worth attempting (transient subprocess
    /// and network failures only).
    pub fn is_transient(&self) -> bool {
        let msg = match self {
            Error::Transfer(m) | Error::Database(m) | Error::Preflight(m) => m.as_str(),
            _ => return false,
        };
        let lower = msg.to_ascii_lowercase();
        lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("temporarily unavailable")
            || lower.contains("could not connect")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_taxonomy() {
        assert_eq!(Error::config("x").exit_code(), 1);
        assert_eq!(Error::validation("x").exit_code(), 2);
        assert_eq!(Error::preflight("x").exit_code(), 3);
        assert_eq!(Error::backup("x").exit_code(), 4);
        assert_eq!(Error::transfer("x").exit_code(), 5);
        assert_eq!(Error::database("x").exit_code(), 5);
        assert_eq!(Error::verification("x").exit_code(), 6);
        assert_eq!(Error::rollback("x").exit_code(), 7);
        assert_eq!(Error::scheduler("x").exit_code(), 8);
    }

    #[test]
    fn test_transient_detection() {
        assert!(Error::database("mysql: connection refused").is_transient());
        assert!(Error::transfer("read timed out").is_transient());
        assert!(!Error::database("syntax error at line 3").is_transient());
        assert!(!Error::config("connection refused").is_transient());
    }
}
