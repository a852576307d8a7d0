//! In-memory key-value store for testing and development.
//!
//! Stores all data in a `HashMap` behind a mutex with lazy expiry: TTLs
//! are checked on access and expired entries are dropped at that point.
//! Not persistent — all data is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::KvError;
use crate::KvStore;

/// What a key holds.
#[derive(Debug, Clone)]
enum Slot {
    Value(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-memory [`KvStore`] backend.
///
/// Thread-safe and async-compatible. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryKv {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Remove the entry if it has expired, then return a mutable reference.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| e.expired(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => match &entry.slot {
                Slot::Value(v) => Ok(Some(v.clone())),
                Slot::Set(_) => Err(KvError::WrongType { key: key.to_owned() }),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry {
                slot: Slot::Value(value.to_owned()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                slot: Slot::Value(value.to_owned()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => match &mut entry.slot {
                Slot::Value(v) => {
                    let current: i64 = v.parse().map_err(|_| KvError::InvalidValue {
                        key: key.to_owned(),
                        reason: "counter is not an integer".to_owned(),
                    })?;
                    let next = current.saturating_add(1);
                    *v = next.to_string();
                    Ok(next)
                }
                Slot::Set(_) => Err(KvError::WrongType { key: key.to_owned() }),
            },
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        slot: Slot::Value("1".to_owned()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => match &mut entry.slot {
                Slot::Set(members) => {
                    members.insert(member.to_owned());
                    if let Some(t) = ttl {
                        entry.expires_at = Some(Instant::now() + t);
                    }
                    Ok(())
                }
                Slot::Value(_) => Err(KvError::WrongType { key: key.to_owned() }),
            },
            None => {
                let mut members = HashSet::new();
                members.insert(member.to_owned());
                entries.insert(
                    key.to_owned(),
                    Entry {
                        slot: Slot::Set(members),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live(&mut entries, key) {
            if let Slot::Set(members) = &mut entry.slot {
                members.remove(member);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => match &entry.slot {
                Slot::Set(members) => {
                    let mut out: Vec<String> = members.iter().cloned().collect();
                    out.sort();
                    Ok(out)
                }
                Slot::Value(_) => Err(KvError::WrongType { key: key.to_owned() }),
            },
            None => Ok(Vec::new()),
        }
    }
}
