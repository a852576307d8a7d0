//! Error types for `tollgate-core`.
//!
//! One enum per subsystem. Every variant carries enough context to
//! diagnose the problem without a debugger; none ever includes credential
//! material.

use tollgate_store::{BusError, KvError};

use crate::auth::Capability;

fn join_caps(caps: &[Capability]) -> String {
    caps.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from authentication and authorization.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Too many failed login attempts from this principal + client IP.
    /// Absorbing until the lockout window expires.
    #[error("too many failed login attempts, retry in {minutes} minutes")]
    RateLimited { minutes: u64 },

    /// Unknown user or wrong password. Deliberately indistinguishable.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The bearer token has expired.
    #[error("token expired")]
    TokenExpired,

    /// The bearer token is malformed or its signature does not verify.
    #[error("invalid token: {reason}")]
    TokenInvalid { reason: String },

    /// The principal lacks one or more required capabilities.
    #[error("forbidden: missing capabilities: {}", join_caps(.missing))]
    Forbidden { missing: Vec<Capability> },

    /// Password hashing or verification failed.
    #[error("password hashing failed: {reason}")]
    Hash { reason: String },

    /// The user directory backend failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The KV store backing lockout counters failed.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Errors from the user directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory backend failed.
    #[error("user directory error: {reason}")]
    Backend { reason: String },

    /// The username already exists.
    #[error("user '{username}' already exists")]
    Duplicate { username: String },
}

/// Errors from the budget reservation engine.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// The reservation is unknown or has expired. The caller must treat
    /// this as a lost allocation and re-request.
    #[error("reservation '{reservation_id}' not found or expired")]
    ReservationNotFound { reservation_id: String },

    /// Committing would push usage over the limit. The reservation stays
    /// held for operator triage.
    #[error("budget_overflow: committing {attempted_usage} exceeds limit {total_limit}")]
    Overflow {
        total_limit: i64,
        attempted_usage: i64,
    },

    /// A cached decision or reservation entry could not be decoded.
    #[error("corrupt budget state for '{key}': {reason}")]
    Codec { key: String, reason: String },

    /// The KV cache failed.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The durable ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Errors from the budget ledger backend.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The ledger backend failed.
    #[error("ledger error: {reason}")]
    Backend { reason: String },
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend {
            reason: err.to_string(),
        }
    }
}

/// Errors from the dead-letter reliability layer.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    /// No DLQ record with this id.
    #[error("dlq message '{id}' not found")]
    NotFound { id: String },

    /// The record was already resolved by another operator.
    #[error("dlq.already_resolved: message '{id}' is already resolved")]
    AlreadyResolved { id: String },

    /// The DLQ record store failed.
    #[error("dlq store error: {reason}")]
    Backend { reason: String },

    /// The message bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The audit backend failed to persist an event.
    #[error("audit sink error: {reason}")]
    Backend { reason: String },
}

/// Errors from the schema migration runner.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A file already recorded in `schema_migrations` presented a
    /// different checksum. Migration halts immediately.
    #[error("checksum mismatch for migration '{version}': recorded {recorded}, file has {actual}")]
    ChecksumMismatch {
        version: String,
        recorded: String,
        actual: String,
    },

    /// A migration file could not be read.
    #[error("failed to read migration '{path}': {reason}")]
    Io { path: String, reason: String },

    /// A migration statement failed or bookkeeping could not be written.
    #[error("migration '{version}' failed: {reason}")]
    Failed { version: String, reason: String },

    /// The database is unreachable or bookkeeping queries failed.
    #[error("migration database error: {reason}")]
    Db { reason: String },
}
