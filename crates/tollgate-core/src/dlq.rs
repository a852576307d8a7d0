//! Dead-Letter Reliability Layer.
//!
//! [`SafePublisher`] wraps the durable publish path: on failure it routes
//! the message to `dlq.{subject}` over the non-durable transport (so a
//! broken stream cannot recurse into more stream publishes) and re-raises
//! the original error to the caller.
//!
//! [`DlqWorker`] drains the dead-letter subjects in batches, persists a
//! durable [`DlqRecord`] per message, and raises a critical alert for
//! anything that originated on an escalation subject. Records are
//! resolved by operators; the core records a requeue request but never
//! auto-requeues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use tollgate_store::{
    BusError, BusMessage, ConsumerSpec, Delivery, MessageBus, RetentionPolicy, StorageKind,
    StreamSpec,
};

use crate::error::DlqError;

/// Subject prefix for dead-lettered messages.
pub const DLQ_PREFIX: &str = "dlq.";

/// Subject for critical alerts raised by the worker.
pub const ALERT_SUBJECT: &str = "alerts.critical";

/// Characters of payload included in an escalation alert.
const ALERT_PREVIEW_CHARS: usize = 200;

/// How many messages the worker pulls per cycle.
const PULL_BATCH: usize = 10;

/// How long a pull waits before reporting an empty batch.
const PULL_WAIT: Duration = Duration::from_secs(5);

/// Idle pause after an empty batch.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after an unexpected error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// The stream topology this layer expects the broker to provide.
///
/// High-volume task subjects age out after 24h, escalations are kept 7d,
/// both deduplicate publishes within a 2 minute window. Primary
/// consumers get five deliveries (30s ack-wait each) before the broker
/// routes a message to the DLQ stream — a 7d file-backed work queue.
#[must_use]
pub fn stream_topology() -> Vec<StreamSpec> {
    let primary_consumer = |name: &str| ConsumerSpec {
        name: name.to_owned(),
        ack_wait: Duration::from_secs(30),
        max_deliver: 5,
    };

    vec![
        StreamSpec {
            name: "TASKS".to_owned(),
            subjects: vec!["tasks.>".to_owned(), "agents.>".to_owned()],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(24 * 3600),
            dedup_window: Some(Duration::from_secs(120)),
            storage: StorageKind::File,
            consumers: vec![primary_consumer("task-workers")],
        },
        StreamSpec {
            name: "ESCALATIONS".to_owned(),
            subjects: vec!["escalation.>".to_owned()],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(7 * 24 * 3600),
            dedup_window: Some(Duration::from_secs(120)),
            storage: StorageKind::File,
            consumers: vec![primary_consumer("escalation-workers")],
        },
        StreamSpec {
            name: "DLQ".to_owned(),
            subjects: vec!["dlq.>".to_owned()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(7 * 24 * 3600),
            dedup_window: None,
            storage: StorageKind::File,
            consumers: vec![ConsumerSpec {
                name: "dlq-worker".to_owned(),
                ack_wait: Duration::from_secs(30),
                max_deliver: 5,
            }],
        },
    ]
}

// ── SafePublisher ────────────────────────────────────────────────────

/// Publishes to durable streams, dead-lettering on failure.
pub struct SafePublisher {
    bus: Arc<dyn MessageBus>,
}

impl SafePublisher {
    /// Create a publisher over a bus.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Attempt a durable publish.
    ///
    /// On failure the message is republished to `dlq.{subject}` over the
    /// non-durable transport with `original_subject`, `error`, and
    /// `dlq_timestamp` headers added, and the original error is returned
    /// to the caller.
    ///
    /// # Errors
    ///
    /// Returns the original publish error; dead-letter routing never masks
    /// it.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let msg = BusMessage {
            subject: subject.to_owned(),
            payload,
            headers,
        };

        match self.bus.publish_durable(msg.clone(), timeout).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(subject, error = %err, "durable publish failed, routing to DLQ");

                let mut dead = msg;
                dead.headers
                    .insert("original_subject".to_owned(), subject.to_owned());
                dead.headers.insert("error".to_owned(), err.to_string());
                dead.headers
                    .insert("dlq_timestamp".to_owned(), Utc::now().to_rfc3339());
                dead.subject = format!("{DLQ_PREFIX}{subject}");

                if let Err(dlq_err) = self.bus.publish(dead).await {
                    // Both transports down. Nothing left but the log.
                    error!(subject, error = %dlq_err, "dead-letter publish also failed");
                }

                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for SafePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafePublisher").finish_non_exhaustive()
    }
}

// ── DLQ records ──────────────────────────────────────────────────────

/// A message captured from the dead-letter queue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DlqRecord {
    pub id: Uuid,
    pub original_subject: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub headers: serde_json::Value,
    /// Delivery attempts before the message dead-lettered.
    pub error_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    /// Operator asked for a requeue. Recorded only — republishing is a
    /// manual step.
    pub requeue_requested: bool,
}

/// Fields for a record about to be persisted.
#[derive(Debug, Clone)]
pub struct NewDlqRecord {
    pub original_subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub error_count: i32,
}

/// Durable storage for DLQ records.
#[async_trait::async_trait]
pub trait DlqStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, record: NewDlqRecord) -> Result<DlqRecord, DlqError>;

    /// List records, optionally filtered by resolved state.
    async fn list(
        &self,
        resolved: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DlqRecord>, DlqError>;

    /// Fetch one record.
    async fn get(&self, id: Uuid) -> Result<DlqRecord, DlqError>;

    /// Mark a record resolved with an operator note.
    ///
    /// # Errors
    ///
    /// - [`DlqError::NotFound`] for an unknown id.
    /// - [`DlqError::AlreadyResolved`] if it was resolved earlier.
    async fn resolve(&self, id: Uuid, note: &str, requeue: bool) -> Result<DlqRecord, DlqError>;
}

// ── PostgreSQL store ─────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DlqRow {
    id: Uuid,
    original_subject: String,
    data: Vec<u8>,
    headers: serde_json::Value,
    error_count: i32,
    created_at: DateTime<Utc>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    resolution_notes: Option<String>,
    requeue_requested: bool,
}

impl From<DlqRow> for DlqRecord {
    fn from(row: DlqRow) -> Self {
        Self {
            id: row.id,
            original_subject: row.original_subject,
            payload: row.data,
            headers: row.headers,
            error_count: row.error_count,
            created_at: row.created_at,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
            resolution_notes: row.resolution_notes,
            requeue_requested: row.requeue_requested,
        }
    }
}

fn db_err(err: &sqlx::Error) -> DlqError {
    DlqError::Backend {
        reason: err.to_string(),
    }
}

/// DLQ store backed by the `dlq_messages` table.
#[derive(Clone)]
pub struct PgDlqStore {
    pool: PgPool,
}

impl PgDlqStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for PgDlqStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDlqStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DlqStore for PgDlqStore {
    async fn insert(&self, record: NewDlqRecord) -> Result<DlqRecord, DlqError> {
        let headers = json!(record.headers);
        let row = sqlx::query_as::<_, DlqRow>(
            r"INSERT INTO dlq_messages (original_subject, data, headers, error_count)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(&record.original_subject)
        .bind(&record.payload)
        .bind(headers)
        .bind(record.error_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err(&e))?;
        Ok(row.into())
    }

    async fn list(
        &self,
        resolved: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DlqRecord>, DlqError> {
        let rows = sqlx::query_as::<_, DlqRow>(
            r"SELECT * FROM dlq_messages
              WHERE ($1::boolean IS NULL OR resolved = $1)
              ORDER BY created_at DESC
              LIMIT $2 OFFSET $3",
        )
        .bind(resolved)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err(&e))?;
        Ok(rows.into_iter().map(DlqRecord::from).collect())
    }

    async fn get(&self, id: Uuid) -> Result<DlqRecord, DlqError> {
        sqlx::query_as::<_, DlqRow>("SELECT * FROM dlq_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(&e))?
            .map(DlqRecord::from)
            .ok_or_else(|| DlqError::NotFound { id: id.to_string() })
    }

    async fn resolve(&self, id: Uuid, note: &str, requeue: bool) -> Result<DlqRecord, DlqError> {
        let row = sqlx::query_as::<_, DlqRow>(
            r"UPDATE dlq_messages
              SET resolved = TRUE, resolved_at = now(), resolution_notes = $2, requeue_requested = $3
              WHERE id = $1 AND resolved = FALSE
              RETURNING *",
        )
        .bind(id)
        .bind(note)
        .bind(requeue)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err(&e))?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                // Distinguish missing from already-resolved.
                let exists: Option<bool> =
                    sqlx::query_scalar("SELECT resolved FROM dlq_messages WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| db_err(&e))?;
                match exists {
                    Some(_) => Err(DlqError::AlreadyResolved { id: id.to_string() }),
                    None => Err(DlqError::NotFound { id: id.to_string() }),
                }
            }
        }
    }
}

// ── In-memory store ──────────────────────────────────────────────────

/// In-memory DLQ store for tests and development.
#[derive(Debug, Default)]
pub struct MemoryDlqStore {
    records: Mutex<Vec<DlqRecord>>,
}

impl MemoryDlqStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DlqStore for MemoryDlqStore {
    async fn insert(&self, record: NewDlqRecord) -> Result<DlqRecord, DlqError> {
        let saved = DlqRecord {
            id: Uuid::new_v4(),
            original_subject: record.original_subject,
            payload: record.payload,
            headers: json!(record.headers),
            error_count: record.error_count,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution_notes: None,
            requeue_requested: false,
        };
        self.records.lock().await.push(saved.clone());
        Ok(saved)
    }

    async fn list(
        &self,
        resolved: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DlqRecord>, DlqError> {
        let records = self.records.lock().await;
        let mut matching: Vec<DlqRecord> = records
            .iter()
            .filter(|r| resolved.is_none_or(|want| r.resolved == want))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<DlqRecord, DlqError> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DlqError::NotFound { id: id.to_string() })
    }

    async fn resolve(&self, id: Uuid, note: &str, requeue: bool) -> Result<DlqRecord, DlqError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DlqError::NotFound { id: id.to_string() })?;

        if record.resolved {
            return Err(DlqError::AlreadyResolved { id: id.to_string() });
        }
        record.resolved = true;
        record.resolved_at = Some(Utc::now());
        record.resolution_notes = Some(note.to_owned());
        record.requeue_requested = requeue;
        Ok(record.clone())
    }
}

// ── Worker ───────────────────────────────────────────────────────────

/// Long-running task that drains the dead-letter subjects.
pub struct DlqWorker {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn DlqStore>,
    shutdown: watch::Receiver<bool>,
}

impl DlqWorker {
    /// Create a worker. It does not run until [`DlqWorker::run`] is awaited.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn DlqStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            store,
            shutdown,
        }
    }

    /// Drain loop. Returns when the shutdown signal fires.
    pub async fn run(mut self) {
        info!("DLQ worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = self.shutdown.changed() => break,
                batch = self.bus.pull(DLQ_PREFIX, PULL_BATCH, PULL_WAIT) => batch,
            };

            match batch {
                Ok(deliveries) if deliveries.is_empty() => {
                    if self.pause(IDLE_BACKOFF).await {
                        break;
                    }
                }
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.handle(delivery).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "DLQ fetch failed, backing off");
                    if self.pause(ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        info!("DLQ worker shutting down");
    }

    /// Sleep, returning `true` if shutdown fired first.
    async fn pause(&mut self, dur: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(dur) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let message = &delivery.message;
        let original_subject = message
            .headers
            .get("original_subject")
            .cloned()
            .unwrap_or_else(|| {
                message
                    .subject
                    .strip_prefix(DLQ_PREFIX)
                    .unwrap_or(&message.subject)
                    .to_owned()
            });

        let record = NewDlqRecord {
            original_subject: original_subject.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            error_count: i32::try_from(delivery.deliveries).unwrap_or(i32::MAX),
        };

        let saved = match self.store.insert(record).await {
            Ok(saved) => saved,
            Err(e) => {
                // Leave the message for redelivery rather than lose it.
                error!(subject = %message.subject, error = %e, "failed to persist DLQ record");
                if let Err(nack_err) = self.bus.nack(&delivery).await {
                    error!(error = %nack_err, "failed to nack DLQ delivery");
                }
                return;
            }
        };

        if let Err(e) = self.bus.ack(&delivery).await {
            warn!(subject = %message.subject, error = %e, "failed to ack DLQ delivery");
        }

        info!(
            id = %saved.id,
            original_subject = %original_subject,
            attempts = saved.error_count,
            "dead-lettered message recorded"
        );

        if original_subject.contains("escalation") {
            self.alert(&saved).await;
        }
    }

    /// Publish a critical alert with a short payload preview.
    async fn alert(&self, record: &DlqRecord) {
        let preview: String = String::from_utf8_lossy(&record.payload)
            .chars()
            .take(ALERT_PREVIEW_CHARS)
            .collect();
        let body = json!({
            "kind": "dlq_escalation",
            "dlq_record_id": record.id,
            "original_subject": record.original_subject,
            "preview": preview,
        });

        let msg = BusMessage::new(ALERT_SUBJECT, body.to_string().into_bytes());
        if let Err(e) = self.bus.publish(msg).await {
            error!(error = %e, "failed to publish critical alert");
        }
    }
}

impl std::fmt::Debug for DlqWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqWorker").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tollgate_store::MemoryBus;

    #[test]
    fn topology_expresses_retention_and_delivery_budgets() {
        let streams = stream_topology();

        let tasks = streams.iter().find(|s| s.name == "TASKS").unwrap();
        assert_eq!(tasks.retention, RetentionPolicy::Limits);
        assert_eq!(tasks.max_age, Duration::from_secs(24 * 3600));
        assert_eq!(tasks.dedup_window, Some(Duration::from_secs(120)));
        assert_eq!(tasks.consumers[0].ack_wait, Duration::from_secs(30));
        assert_eq!(tasks.consumers[0].max_deliver, 5);

        let dlq = streams.iter().find(|s| s.name == "DLQ").unwrap();
        assert_eq!(dlq.retention, RetentionPolicy::WorkQueue);
        assert_eq!(dlq.max_age, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(dlq.storage, StorageKind::File);
    }

    #[tokio::test]
    async fn safe_publish_reraises_and_routes_to_dlq() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_durable("tasks.created").await;

        let publisher = SafePublisher::new(Arc::clone(&bus) as _);
        let err = publisher
            .publish(
                "tasks.created",
                b"payload".to_vec(),
                BTreeMap::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PublishFailed { .. }));

        let dead = bus
            .pull("dlq.tasks.created", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        let headers = &dead[0].message.headers;
        assert_eq!(headers.get("original_subject").map(String::as_str), Some("tasks.created"));
        assert!(headers.contains_key("error"));
        assert!(headers.contains_key("dlq_timestamp"));
    }

    #[tokio::test]
    async fn safe_publish_succeeds_silently_when_stream_is_up() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = SafePublisher::new(Arc::clone(&bus) as _);

        publisher
            .publish("tasks.created", b"ok".to_vec(), BTreeMap::new(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(bus.queued_len("tasks.created").await, 1);
        assert_eq!(bus.queued_len("dlq.tasks.created").await, 0);
    }

    async fn run_worker_briefly(bus: &Arc<MemoryBus>, store: &Arc<MemoryDlqStore>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = DlqWorker::new(
            Arc::clone(bus) as Arc<dyn MessageBus>,
            Arc::clone(store) as Arc<dyn DlqStore>,
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_persists_records_and_acks() {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryDlqStore::new());

        let mut msg = BusMessage::new("dlq.tasks.created", b"lost task".to_vec());
        msg.headers
            .insert("original_subject".to_owned(), "tasks.created".to_owned());
        bus.publish(msg).await.unwrap();

        run_worker_briefly(&bus, &store).await;

        let records = store.list(None, 10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_subject, "tasks.created");
        assert!(records[0].error_count >= 1);
        assert!(!records[0].resolved);

        // Acked: nothing left on the DLQ subject.
        assert_eq!(bus.queued_len("dlq.tasks.created").await, 0);
    }

    #[tokio::test]
    async fn worker_alerts_on_escalation_subjects() {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryDlqStore::new());

        let payload = "x".repeat(500);
        let mut msg = BusMessage::new("dlq.escalation.p0", payload.into_bytes());
        msg.headers
            .insert("original_subject".to_owned(), "escalation.p0".to_owned());
        bus.publish(msg).await.unwrap();

        run_worker_briefly(&bus, &store).await;

        let alerts = bus.pull(ALERT_SUBJECT, 5, Duration::from_millis(50)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&alerts[0].message.payload).unwrap();
        assert_eq!(body["original_subject"], "escalation.p0");
        assert_eq!(body["preview"].as_str().unwrap().chars().count(), ALERT_PREVIEW_CHARS);
    }

    #[tokio::test]
    async fn resolve_flow_and_double_resolve() {
        let store = MemoryDlqStore::new();
        let saved = store
            .insert(NewDlqRecord {
                original_subject: "tasks.created".to_owned(),
                payload: b"x".to_vec(),
                headers: BTreeMap::new(),
                error_count: 3,
            })
            .await
            .unwrap();

        let resolved = store.resolve(saved.id, "triaged", true).await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution_notes.as_deref(), Some("triaged"));
        assert!(resolved.requeue_requested);
        assert!(resolved.resolved_at.is_some());

        assert!(matches!(
            store.resolve(saved.id, "again", false).await,
            Err(DlqError::AlreadyResolved { .. })
        ));

        assert!(matches!(
            store.resolve(Uuid::new_v4(), "nope", false).await,
            Err(DlqError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_resolved() {
        let store = MemoryDlqStore::new();
        for i in 0..3 {
            store
                .insert(NewDlqRecord {
                    original_subject: format!("tasks.{i}"),
                    payload: Vec::new(),
                    headers: BTreeMap::new(),
                    error_count: 1,
                })
                .await
                .unwrap();
        }
        let first = store.list(None, 10, 0).await.unwrap()[2].id;
        store.resolve(first, "done", false).await.unwrap();

        assert_eq!(store.list(Some(false), 10, 0).await.unwrap().len(), 2);
        assert_eq!(store.list(Some(true), 10, 0).await.unwrap().len(), 1);
        assert_eq!(store.list(None, 2, 0).await.unwrap().len(), 2);
    }
}
