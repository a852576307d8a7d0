//! Infrastructure backends for Tollgate.
//!
//! Two abstractions live here, both consumed by `tollgate-core` as trait
//! objects so that engines can be tested against in-memory fakes:
//!
//! - [`KvStore`] — a namespaced key-value store with TTLs, atomic
//!   counters, and per-scope sets. Production uses [`RedisKv`]; tests and
//!   development use [`MemoryKv`].
//! - [`MessageBus`] — a streaming bus with a durable publish path, a
//!   non-durable core publish path, and batch pull consumers. Production
//!   deployments adapt their broker behind this trait; [`MemoryBus`]
//!   implements work-queue semantics in-process.
//!
//! Keys are strictly namespaced `{domain}:{tenant}:{project}:…`. There is
//! deliberately no scan/keys operation — enumeration happens through
//! per-scope sets only, which keeps tenants isolated.

pub mod bus;
mod error;
pub mod memory;
pub mod memory_bus;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

use std::time::Duration;

pub use bus::{BusMessage, ConsumerSpec, Delivery, MessageBus, RetentionPolicy, StorageKind, StreamSpec};
pub use error::{BusError, KvError};
pub use memory::MemoryKv;
pub use memory_bus::MemoryBus;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisKv;

/// A namespaced key-value store with TTL support.
///
/// The verb set is intentionally narrow: exactly what the control-plane
/// engines need (idempotency envelopes, lockout counters, reservation
/// entries, and per-scope membership sets) and nothing that would permit
/// a global scan.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Read a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a string value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Write a value only if the key is absent (`SET NX EX`).
    ///
    /// Returns `true` if this call created the key. At most one concurrent
    /// caller observes `true` for a given key within the TTL window.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomically increment an integer counter, creating it at 1.
    ///
    /// Returns the post-increment value. A fresh counter has no TTL; the
    /// caller decides whether to attach one via [`KvStore::expire`].
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Set or replace the TTL on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    /// Remaining TTL, or `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    /// Add a member to a set, optionally refreshing the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Remove a member from a set. Absent set or member is a no-op.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// All members of a set. An absent set reads as empty.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;
}
