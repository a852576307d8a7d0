//! Message bus abstraction.
//!
//! The control plane needs two publish paths with different guarantees:
//!
//! - **Durable** — the message must be accepted by a stream with
//!   retention; used for primary subjects. Failures surface to the caller.
//! - **Non-durable** — fire-and-forget over the core transport; used for
//!   dead-letter routing precisely because it cannot recurse into the
//!   failure that triggered it.
//!
//! Consumers pull in batches with an explicit deadline and acknowledge
//! each delivery. A delivery that is negatively acknowledged past its
//! consumer's max-deliver budget is routed to `dlq.{subject}` by the bus.
//!
//! [`StreamSpec`] / [`ConsumerSpec`] carry the semantic requirements a
//! deployment must provision on its broker; they are interpreted natively
//! by [`crate::MemoryBus`].

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::BusError;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Dotted subject, e.g. `tasks.created` or `dlq.tasks.created`.
    pub subject: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// String headers. Sorted map so serialised forms are stable.
    pub headers: BTreeMap<String, String>,
}

impl BusMessage {
    /// Build a message with empty headers.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }
}

/// A pulled message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The message itself.
    pub message: BusMessage,
    /// How many times this message has been delivered (1 on first pull).
    pub deliveries: u32,
    /// Opaque acknowledgement handle.
    pub ack_id: u64,
}

/// Stream retention behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Age/size limits only; consumers do not remove messages.
    Limits,
    /// Each message is owned by exactly one consumer and removed on ack.
    WorkQueue,
}

/// Where stream data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Durable file storage.
    File,
    /// Memory storage (lost on broker restart).
    Memory,
}

/// Semantic requirements for one stream.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Subjects captured by this stream (`>` matches a full tail).
    pub subjects: Vec<String>,
    /// Retention behaviour.
    pub retention: RetentionPolicy,
    /// Maximum message age before the broker discards it.
    pub max_age: Duration,
    /// Publisher deduplication window, if any.
    pub dedup_window: Option<Duration>,
    /// Storage medium.
    pub storage: StorageKind,
    /// Durable pull consumers on this stream.
    pub consumers: Vec<ConsumerSpec>,
}

/// Semantic requirements for one pull consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    /// Durable consumer name.
    pub name: String,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Deliveries after which the message is routed to the DLQ.
    pub max_deliver: u32,
}

/// A streaming message bus.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Ensure the given streams exist with the given semantics.
    async fn provision(&self, streams: &[StreamSpec]) -> Result<(), BusError>;

    /// Publish to a durable stream, waiting at most `timeout` for the
    /// stream to accept the message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the stream did not accept
    /// the message within the deadline.
    async fn publish_durable(&self, msg: BusMessage, timeout: Duration) -> Result<(), BusError>;

    /// Publish over the non-durable core transport (fire-and-forget).
    async fn publish(&self, msg: BusMessage) -> Result<(), BusError>;

    /// Pull up to `batch` messages for subjects under `subject_prefix`,
    /// waiting at most `wait`. An empty batch means the deadline passed
    /// with nothing available — it is not an error.
    async fn pull(
        &self,
        subject_prefix: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Acknowledge a delivery, removing it from the work queue.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Negatively acknowledge a delivery. The bus redelivers it, or routes
    /// it to `dlq.{subject}` once its max-deliver budget is exhausted.
    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError>;
}
