//! Audit logging.
//!
//! Every privileged operation by a known principal produces an
//! [`AuditEvent`]: append-only, never mutated. Events fan out to all
//! registered sinks best-effort — audit rows are not linearised with the
//! operations they describe, so a sink failure is logged and never blocks
//! the operation itself.
//!
//! Free-form strings inside `details` are scrubbed before fan-out (see
//! [`crate::sanitize`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::auth::Role;
use crate::error::AuditError;
use crate::sanitize;

/// An immutable record of a privileged operation.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Acting principal id (attempted username for failed logins).
    pub principal_id: String,
    /// Principal's role, when verified.
    pub role: Option<Role>,
    /// Dotted action name, e.g. `budget.commit`.
    pub action: String,
    /// Kind of resource acted on.
    pub resource_type: String,
    /// Identifier of the resource acted on.
    pub resource_id: String,
    /// Structured detail; free-form strings are scrubbed before writing.
    pub details: serde_json::Value,
    /// When the event occurred.
    pub ts: DateTime<Utc>,
}

impl AuditEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(
        principal_id: &str,
        role: Option<Role>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            principal_id: principal_id.to_owned(),
            role,
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            details,
            ts: Utc::now(),
        }
    }
}

/// An audit log backend.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for failure reporting).
    fn name(&self) -> &str;

    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the event could not be persisted.
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Fans audit events out to every registered sink.
#[derive(Default)]
pub struct AuditManager {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditManager {
    /// Create a manager with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Write an event to every sink, best-effort.
    ///
    /// Sink failures are logged at warn and do not propagate: the
    /// operation being audited has already happened.
    pub async fn log(&self, mut event: AuditEvent) {
        sanitize::scrub_json(&mut event.details);

        let sinks = self.sinks.read().await;
        for sink in sinks.iter() {
            if let Err(e) = sink.write(&event).await {
                warn!(
                    sink = sink.name(),
                    action = %event.action,
                    error = %e,
                    "audit sink failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager").finish_non_exhaustive()
    }
}

// ── PostgreSQL sink ──────────────────────────────────────────────────

/// Audit sink writing to the append-only `audit_log` table.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    /// Create a sink over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for PgAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAuditSink").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl AuditSink for PgAuditSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r"INSERT INTO audit_log (user_id, role, action, resource_type, resource_id, details, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&event.principal_id)
        .bind(event.role.map(Role::as_str))
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.details)
        .bind(event.ts)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Backend {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

// ── In-memory sink ───────────────────────────────────────────────────

/// In-memory audit sink for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub async fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Count events with the given action.
    pub async fn count_action(&self, action: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_fan_out_to_all_sinks() {
        let manager = AuditManager::new();
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        manager.add_sink(Arc::clone(&a) as _).await;
        manager.add_sink(Arc::clone(&b) as _).await;

        manager
            .log(AuditEvent::new(
                "admin",
                Some(Role::Admin),
                "dlq.resolve",
                "dlq_message",
                "42",
                json!({"note": "triaged"}),
            ))
            .await;

        assert_eq!(a.count_action("dlq.resolve").await, 1);
        assert_eq!(b.count_action("dlq.resolve").await, 1);
    }

    #[tokio::test]
    async fn details_are_scrubbed_before_writing() {
        let manager = AuditManager::new();
        let sink = Arc::new(MemoryAuditSink::new());
        manager.add_sink(Arc::clone(&sink) as _).await;

        manager
            .log(AuditEvent::new(
                "op",
                Some(Role::Operator),
                "dlq.resolve",
                "dlq_message",
                "1",
                json!({"note": "ok; DROP TABLE audit_log"}),
            ))
            .await;

        let events = sink.snapshot().await;
        let note = events[0].details["note"].as_str().unwrap();
        assert!(!note.contains("DROP"));
        assert!(!note.contains(';'));
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_logging() {
        struct FailingSink;

        #[async_trait::async_trait]
        impl AuditSink for FailingSink {
            fn name(&self) -> &str {
                "failing"
            }
            async fn write(&self, _event: &AuditEvent) -> Result<(), AuditError> {
                Err(AuditError::Backend {
                    reason: "disk full".to_owned(),
                })
            }
        }

        let manager = AuditManager::new();
        let good = Arc::new(MemoryAuditSink::new());
        manager.add_sink(Arc::new(FailingSink) as _).await;
        manager.add_sink(Arc::clone(&good) as _).await;

        manager
            .log(AuditEvent::new(
                "x",
                None,
                "auth.login.fail",
                "auth",
                "x",
                json!({}),
            ))
            .await;

        assert_eq!(good.count_action("auth.login.fail").await, 1);
    }
}
