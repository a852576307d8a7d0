//! User directory.
//!
//! Users carry a bcrypt password hash and a role; passwords are never
//! stored in plaintext. The directory is a trait so the authenticator can
//! be exercised against an in-memory fake.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::Role;
use crate::error::DirectoryError;

/// A stored user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    /// Lowercased username, unique.
    pub username: String,
    /// bcrypt hash of the password.
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Lookup and creation of users.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user by (lowercased) username.
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError>;

    /// Create a user. The password must already be hashed.
    async fn create(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, DirectoryError>;

    /// Number of users in the directory.
    async fn count(&self) -> Result<i64, DirectoryError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    password_hash: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role: Role::from_str_lossy(&row.role),
            created_at: row.created_at,
        }
    }
}

/// User directory backed by the `users` table.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    /// Create a directory over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for PgUserDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUserDirectory").finish_non_exhaustive()
    }
}

fn db_err(err: &sqlx::Error) -> DirectoryError {
    DirectoryError::Backend {
        reason: err.to_string(),
    }
}

#[async_trait::async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err(&e))?;
        Ok(row.map(UserRecord::from))
    }

    async fn create(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, DirectoryError> {
        let row = sqlx::query_as::<_, UserRow>(
            r"INSERT INTO users (username, password_hash, role)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(username)
        .bind(password_hash)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            // PostgreSQL unique violation on username.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                DirectoryError::Duplicate {
                    username: username.to_owned(),
                }
            }
            other => db_err(other),
        })?;
        Ok(row.into())
    }

    async fn count(&self) -> Result<i64, DirectoryError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err(&e))
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// In-memory user directory for tests and development.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: Arc<Mutex<HashMap<String, UserRecord>>>,
}

impl MemoryUserDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user directly (test convenience, overwrites silently).
    pub async fn add(&self, username: &str, password_hash: &str, role: Role) {
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_lowercase(),
            password_hash: password_hash.to_owned(),
            role,
            created_at: Utc::now(),
        };
        self.users.lock().await.insert(record.username.clone(), record);
    }
}

#[async_trait::async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError> {
        Ok(self.users.lock().await.get(username).cloned())
    }

    async fn create(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<UserRecord, DirectoryError> {
        let mut users = self.users.lock().await;
        let key = username.to_lowercase();
        if users.contains_key(&key) {
            return Err(DirectoryError::Duplicate {
                username: key,
            });
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: key.clone(),
            password_hash: password_hash.to_owned(),
            role,
            created_at: Utc::now(),
        };
        users.insert(key, record.clone());
        Ok(record)
    }

    async fn count(&self) -> Result<i64, DirectoryError> {
        #[allow(clippy::cast_possible_wrap)]
        Ok(self.users.lock().await.len() as i64)
    }
}
