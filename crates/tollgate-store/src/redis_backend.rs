//! Redis key-value backend.
//!
//! Production backend over a multiplexed connection manager, which
//! reconnects transparently. All operations map 1:1 onto Redis commands;
//! the SETNX-with-TTL path uses `SET key value NX EX seconds` so creation
//! and expiry are a single atomic command.
//!
//! Feature-gated behind `redis-backend` (default on).

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::KvStore;
use crate::error::KvError;

/// A [`KvStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("conn", &"[ConnectionManager]")
            .finish_non_exhaustive()
    }
}

fn backend_err(key: &str, err: &redis::RedisError) -> KvError {
    if err.kind() == redis::ErrorKind::TypeError {
        KvError::WrongType { key: key.to_owned() }
    } else {
        KvError::Backend {
            key: key.to_owned(),
            reason: err.to_string(),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_secs(ttl: Duration) -> u64 {
    // Redis TTLs are whole seconds; round up so short windows never become 0.
    ttl.as_secs().max(1)
}

impl RedisKv {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Connection`] if the URL is invalid or the server
    /// is unreachable.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connection {
            reason: e.to_string(),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Connection {
                reason: e.to_string(),
            })?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| backend_err(key, &e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(t) => {
                let () = conn
                    .set_ex(key, value, ttl_secs(t))
                    .await
                    .map_err(|e| backend_err(key, &e))?;
            }
            None => {
                let () = conn.set(key, value).await.map_err(|e| backend_err(key, &e))?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err(key, &e))?;
        Ok(created.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let () = conn.del(key).await.map_err(|e| backend_err(key, &e))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await.map_err(|e| backend_err(key, &e))?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        #[allow(clippy::cast_possible_wrap)]
        let secs = ttl_secs(ttl) as i64;
        let () = conn.expire(key, secs).await.map_err(|e| backend_err(key, &e))?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn.ttl(key).await.map_err(|e| backend_err(key, &e))?;
        // -2 = key absent, -1 = no expiry.
        if secs < 0 {
            Ok(None)
        } else {
            #[allow(clippy::cast_sign_loss)]
            Ok(Some(Duration::from_secs(secs as u64)))
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let () = conn.sadd(key, member).await.map_err(|e| backend_err(key, &e))?;
        if let Some(t) = ttl {
            #[allow(clippy::cast_possible_wrap)]
            let secs = ttl_secs(t) as i64;
            let () = conn.expire(key, secs).await.map_err(|e| backend_err(key, &e))?;
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let () = conn.srem(key, member).await.map_err(|e| backend_err(key, &e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> =
            conn.smembers(key).await.map_err(|e| backend_err(key, &e))?;
        members.sort();
        Ok(members)
    }
}
