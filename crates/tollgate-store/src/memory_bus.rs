//! In-memory message bus for testing and single-process deployments.
//!
//! Implements work-queue semantics: each message belongs to one subject
//! queue, a pull moves it into an in-flight table, ack drops it, nack
//! requeues it. A message nacked past the max-deliver budget is routed to
//! `dlq.{subject}` with the delivery error recorded in headers, mirroring
//! what the broker-side routing does in production.
//!
//! Durable publishes can be failed on demand per subject, which is how
//! tests exercise the safe-publish failure path.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::bus::{BusMessage, Delivery, MessageBus, StreamSpec};
use crate::error::BusError;

/// Default delivery budget before DLQ routing.
const DEFAULT_MAX_DELIVER: u32 = 5;

#[derive(Debug, Clone)]
struct Queued {
    message: BusMessage,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Inner {
    queues: BTreeMap<String, VecDeque<Queued>>,
    in_flight: HashMap<u64, Queued>,
    next_ack_id: u64,
    streams: Vec<StreamSpec>,
    failing_durable: HashSet<String>,
}

/// An in-memory [`MessageBus`].
///
/// Cloning shares the underlying queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    /// Create a new empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make durable publishes to `subject` fail until [`Self::heal`] is
    /// called. Non-durable publishes are unaffected.
    pub async fn fail_durable(&self, subject: &str) {
        self.inner.lock().await.failing_durable.insert(subject.to_owned());
    }

    /// Clear an injected failure.
    pub async fn heal(&self, subject: &str) {
        self.inner.lock().await.failing_durable.remove(subject);
    }

    /// Number of messages queued under a subject (test observability).
    pub async fn queued_len(&self, subject: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(subject)
            .map_or(0, VecDeque::len)
    }

    async fn enqueue(&self, msg: BusMessage) {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(msg.subject.clone())
            .or_default()
            .push_back(Queued {
                message: msg,
                deliveries: 0,
            });
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Pop up to `batch` messages whose subject starts with `prefix`.
    async fn take_batch(&self, prefix: &str, batch: usize) -> Vec<Delivery> {
        let mut inner = self.inner.lock().await;
        let subjects: Vec<String> = inner
            .queues
            .range(prefix.to_owned()..)
            .take_while(|(s, _)| s.starts_with(prefix))
            .filter(|(_, q)| !q.is_empty())
            .map(|(s, _)| s.clone())
            .collect();

        let mut out = Vec::new();
        'outer: for subject in subjects {
            while out.len() < batch {
                let Some(mut queued) = inner.queues.get_mut(&subject).and_then(VecDeque::pop_front)
                else {
                    continue 'outer;
                };
                queued.deliveries = queued.deliveries.saturating_add(1);
                let ack_id = inner.next_ack_id;
                inner.next_ack_id = inner.next_ack_id.wrapping_add(1);
                out.push(Delivery {
                    message: queued.message.clone(),
                    deliveries: queued.deliveries,
                    ack_id,
                });
                inner.in_flight.insert(ack_id, queued);
            }
            if out.len() >= batch {
                break;
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn provision(&self, streams: &[StreamSpec]) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        inner.streams = streams.to_vec();
        Ok(())
    }

    async fn publish_durable(&self, msg: BusMessage, _timeout: Duration) -> Result<(), BusError> {
        {
            let inner = self.inner.lock().await;
            if inner.failing_durable.contains(&msg.subject) {
                return Err(BusError::PublishFailed {
                    subject: msg.subject,
                    reason: "stream unavailable".to_owned(),
                });
            }
        }
        self.enqueue(msg).await;
        Ok(())
    }

    async fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        self.enqueue(msg).await;
        Ok(())
    }

    async fn pull(
        &self,
        subject_prefix: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + wait;
        loop {
            let got = self.take_batch(subject_prefix, batch).await;
            if !got.is_empty() {
                return Ok(got);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .remove(&delivery.ack_id)
            .map(|_| ())
            .ok_or(BusError::UnknownDelivery)
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let queued = {
            let mut inner = self.inner.lock().await;
            inner
                .in_flight
                .remove(&delivery.ack_id)
                .ok_or(BusError::UnknownDelivery)?
        };

        if queued.deliveries >= DEFAULT_MAX_DELIVER {
            // Delivery budget exhausted — route to the dead-letter subject.
            let mut dead = queued.message.clone();
            dead.headers
                .insert("original_subject".to_owned(), dead.subject.clone());
            dead.headers
                .insert("error".to_owned(), "max deliveries exceeded".to_owned());
            dead.subject = format!("dlq.{}", dead.subject);
            self.enqueue(dead).await;
        } else {
            let mut inner = self.inner.lock().await;
            inner
                .queues
                .entry(queued.message.subject.clone())
                .or_default()
                .push_back(queued);
            drop(inner);
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
