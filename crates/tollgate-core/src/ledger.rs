//! Durable budget ledger.
//!
//! One row per (tenant, project) with the invariant
//! `current_usage + reserved <= total_limit` at all times. Serialisation
//! across concurrent callers is the ledger's job, not the application's:
//! the reserve path is a conditional UPDATE whose row count decides the
//! outcome, and commit/release run inside a transaction together with
//! their `budget_transactions` row.
//!
//! Two implementations: [`PgLedger`] for production and [`MemoryLedger`]
//! for tests and single-process development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LedgerError;

/// Point-in-time view of one budget row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BudgetSnapshot {
    pub total_limit: i64,
    pub current_usage: i64,
    pub reserved: i64,
}

impl BudgetSnapshot {
    /// Tokens still allocatable.
    #[must_use]
    pub fn available(&self) -> i64 {
        self.total_limit - self.current_usage - self.reserved
    }
}

/// Transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Reserve,
    Commit,
    Release,
}

impl TxKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Commit => "commit",
            Self::Release => "release",
        }
    }

    fn from_str_lossy(s: &str) -> Self {
        match s {
            "commit" => Self::Commit,
            "release" => Self::Release,
            _ => Self::Reserve,
        }
    }
}

/// One ledger transaction row.
#[derive(Debug, Clone)]
pub struct LedgerTx {
    pub id: Uuid,
    pub tenant_id: String,
    pub project_id: String,
    pub task_id: String,
    /// Idempotency request id; set on `reserve` rows.
    pub request_id: Option<String>,
    pub reservation_id: Uuid,
    /// Tokens: estimated for reserve, actual for commit, reserved amount
    /// for release.
    pub amount: i64,
    pub kind: TxKind,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a reserve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The conditional update applied; tokens are held.
    Reserved,
    /// The conditional update matched no row — a concurrent caller
    /// depleted the budget between check and update.
    Depleted,
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Applying `actual` would exceed the limit; nothing was changed and
    /// the reservation stays held.
    Overflow {
        total_limit: i64,
        attempted_usage: i64,
    },
    /// No budget row exists for this (tenant, project).
    RowMissing,
}

/// The durable ledger behind the budget engine.
#[async_trait::async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Load the budget row, creating it with `default_limit` if absent.
    async fn ensure(
        &self,
        tenant_id: &str,
        project_id: &str,
        default_limit: i64,
    ) -> Result<BudgetSnapshot, LedgerError>;

    /// Atomically hold `tx.amount` tokens if availability allows, and
    /// record the `reserve` transaction row in the same database
    /// transaction. Creates the budget row with `default_limit` if absent.
    async fn reserve(&self, tx: &LedgerTx, default_limit: i64)
    -> Result<ReserveOutcome, LedgerError>;

    /// Move a held reservation into usage: `current_usage += tx.amount`
    /// (actual tokens), `reserved -= reserved_amount`, guarded so usage
    /// can never exceed the limit. Records the `commit` row.
    async fn commit(&self, tx: &LedgerTx, reserved_amount: i64)
    -> Result<CommitOutcome, LedgerError>;

    /// Return `tx.amount` held tokens to availability (clamped at zero)
    /// and record the `release` row. Releasing against a missing budget
    /// row is a no-op.
    async fn release(&self, tx: &LedgerTx) -> Result<(), LedgerError>;

    /// Current snapshot, if the row exists.
    async fn snapshot(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Option<BudgetSnapshot>, LedgerError>;

    /// `reserve` rows older than `older_than` with no matching `commit`
    /// or `release` row — reservations whose KV entry expired before the
    /// caller finished.
    async fn stale_reserves(&self, older_than: Duration) -> Result<Vec<LedgerTx>, LedgerError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct TxRow {
    id: Uuid,
    tenant_id: String,
    project_id: String,
    task_id: String,
    request_id: Option<String>,
    reservation_id: Uuid,
    amount: i64,
    tx_type: String,
    purpose: String,
    created_at: DateTime<Utc>,
}

impl From<TxRow> for LedgerTx {
    fn from(row: TxRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            project_id: row.project_id,
            task_id: row.task_id,
            request_id: row.request_id,
            reservation_id: row.reservation_id,
            amount: row.amount,
            kind: TxKind::from_str_lossy(&row.tx_type),
            purpose: row.purpose,
            created_at: row.created_at,
        }
    }
}

/// Ledger backed by the `budget_limits` / `budget_transactions` tables.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_tx<'e, E>(executor: E, tx: &LedgerTx) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r"INSERT INTO budget_transactions
                (id, tenant_id, project_id, task_id, request_id, reservation_id, amount, tx_type, purpose, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(tx.id)
        .bind(&tx.tenant_id)
        .bind(&tx.project_id)
        .bind(&tx.task_id)
        .bind(&tx.request_id)
        .bind(tx.reservation_id)
        .bind(tx.amount)
        .bind(tx.kind.as_str())
        .bind(&tx.purpose)
        .bind(tx.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for PgLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLedger").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BudgetLedger for PgLedger {
    async fn ensure(
        &self,
        tenant_id: &str,
        project_id: &str,
        default_limit: i64,
    ) -> Result<BudgetSnapshot, LedgerError> {
        sqlx::query(
            r"INSERT INTO budget_limits (tenant_id, project_id, total_limit)
              VALUES ($1, $2, $3)
              ON CONFLICT (tenant_id, project_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(project_id)
        .bind(default_limit)
        .execute(&self.pool)
        .await?;

        let (total_limit, current_usage, reserved): (i64, i64, i64) = sqlx::query_as(
            r"SELECT total_limit, current_usage, reserved
              FROM budget_limits
              WHERE tenant_id = $1 AND project_id = $2",
        )
        .bind(tenant_id)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BudgetSnapshot {
            total_limit,
            current_usage,
            reserved,
        })
    }

    async fn reserve(
        &self,
        tx: &LedgerTx,
        default_limit: i64,
    ) -> Result<ReserveOutcome, LedgerError> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r"INSERT INTO budget_limits (tenant_id, project_id, total_limit)
              VALUES ($1, $2, $3)
              ON CONFLICT (tenant_id, project_id) DO NOTHING",
        )
        .bind(&tx.tenant_id)
        .bind(&tx.project_id)
        .bind(default_limit)
        .execute(&mut *db_tx)
        .await?;

        // The serialisation primitive: hold tokens only if availability
        // still allows it at update time.
        let updated = sqlx::query(
            r"UPDATE budget_limits
              SET reserved = reserved + $3, updated_at = now()
              WHERE tenant_id = $1 AND project_id = $2
                AND total_limit - current_usage - reserved >= $3",
        )
        .bind(&tx.tenant_id)
        .bind(&tx.project_id)
        .bind(tx.amount)
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() == 0 {
            db_tx.rollback().await?;
            return Ok(ReserveOutcome::Depleted);
        }

        Self::insert_tx(&mut *db_tx, tx).await?;
        db_tx.commit().await?;
        Ok(ReserveOutcome::Reserved)
    }

    async fn commit(
        &self,
        tx: &LedgerTx,
        reserved_amount: i64,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut db_tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"UPDATE budget_limits
              SET current_usage = current_usage + $3,
                  reserved = GREATEST(reserved - $4, 0),
                  updated_at = now()
              WHERE tenant_id = $1 AND project_id = $2
                AND current_usage + $3 + GREATEST(reserved - $4, 0) <= total_limit",
        )
        .bind(&tx.tenant_id)
        .bind(&tx.project_id)
        .bind(tx.amount)
        .bind(reserved_amount)
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() == 0 {
            let row: Option<(i64, i64)> = sqlx::query_as(
                r"SELECT total_limit, current_usage FROM budget_limits
                  WHERE tenant_id = $1 AND project_id = $2",
            )
            .bind(&tx.tenant_id)
            .bind(&tx.project_id)
            .fetch_optional(&mut *db_tx)
            .await?;

            db_tx.rollback().await?;
            return Ok(match row {
                Some((total_limit, current_usage)) => CommitOutcome::Overflow {
                    total_limit,
                    attempted_usage: current_usage + tx.amount,
                },
                None => CommitOutcome::RowMissing,
            });
        }

        Self::insert_tx(&mut *db_tx, tx).await?;
        db_tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn release(&self, tx: &LedgerTx) -> Result<(), LedgerError> {
        let mut db_tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"UPDATE budget_limits
              SET reserved = GREATEST(reserved - $3, 0), updated_at = now()
              WHERE tenant_id = $1 AND project_id = $2",
        )
        .bind(&tx.tenant_id)
        .bind(&tx.project_id)
        .bind(tx.amount)
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() > 0 {
            Self::insert_tx(&mut *db_tx, tx).await?;
        }
        db_tx.commit().await?;
        Ok(())
    }

    async fn snapshot(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Option<BudgetSnapshot>, LedgerError> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r"SELECT total_limit, current_usage, reserved
              FROM budget_limits
              WHERE tenant_id = $1 AND project_id = $2",
        )
        .bind(tenant_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(total_limit, current_usage, reserved)| BudgetSnapshot {
            total_limit,
            current_usage,
            reserved,
        }))
    }

    async fn stale_reserves(&self, older_than: Duration) -> Result<Vec<LedgerTx>, LedgerError> {
        let rows = sqlx::query_as::<_, TxRow>(
            r"SELECT r.* FROM budget_transactions r
              WHERE r.tx_type = 'reserve'
                AND r.created_at < now() - make_interval(secs => $1)
                AND NOT EXISTS (
                    SELECT 1 FROM budget_transactions x
                    WHERE x.reservation_id = r.reservation_id
                      AND x.tx_type IN ('commit', 'release')
                )
              ORDER BY r.created_at",
        )
        .bind(older_than.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerTx::from).collect())
    }
}

// ── In-memory ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LimitRow {
    total_limit: i64,
    current_usage: i64,
    reserved: i64,
}

#[derive(Debug, Default)]
struct MemInner {
    limits: HashMap<(String, String), LimitRow>,
    transactions: Vec<LedgerTx>,
}

/// In-memory ledger for tests and development.
///
/// A single mutex stands in for the database's row locking, which gives
/// the same total order over reserve/commit/release per (tenant, project).
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<MemInner>>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a budget row (test convenience).
    pub async fn set_limit(&self, tenant_id: &str, project_id: &str, total_limit: i64) {
        self.inner.lock().await.limits.insert(
            (tenant_id.to_owned(), project_id.to_owned()),
            LimitRow {
                total_limit,
                current_usage: 0,
                reserved: 0,
            },
        );
    }

    /// All transaction rows written so far (test observability).
    pub async fn transactions(&self) -> Vec<LedgerTx> {
        self.inner.lock().await.transactions.clone()
    }
}

#[async_trait::async_trait]
impl BudgetLedger for MemoryLedger {
    async fn ensure(
        &self,
        tenant_id: &str,
        project_id: &str,
        default_limit: i64,
    ) -> Result<BudgetSnapshot, LedgerError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .limits
            .entry((tenant_id.to_owned(), project_id.to_owned()))
            .or_insert(LimitRow {
                total_limit: default_limit,
                current_usage: 0,
                reserved: 0,
            });
        Ok(BudgetSnapshot {
            total_limit: row.total_limit,
            current_usage: row.current_usage,
            reserved: row.reserved,
        })
    }

    async fn reserve(
        &self,
        tx: &LedgerTx,
        default_limit: i64,
    ) -> Result<ReserveOutcome, LedgerError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .limits
            .entry((tx.tenant_id.clone(), tx.project_id.clone()))
            .or_insert(LimitRow {
                total_limit: default_limit,
                current_usage: 0,
                reserved: 0,
            });

        if row.total_limit - row.current_usage - row.reserved < tx.amount {
            return Ok(ReserveOutcome::Depleted);
        }
        row.reserved += tx.amount;
        inner.transactions.push(tx.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn commit(
        &self,
        tx: &LedgerTx,
        reserved_amount: i64,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut inner = self.inner.lock().await;
        let key = (tx.tenant_id.clone(), tx.project_id.clone());
        let Some(row) = inner.limits.get_mut(&key) else {
            return Ok(CommitOutcome::RowMissing);
        };

        let remaining_hold = (row.reserved - reserved_amount).max(0);
        if row.current_usage + tx.amount + remaining_hold > row.total_limit {
            return Ok(CommitOutcome::Overflow {
                total_limit: row.total_limit,
                attempted_usage: row.current_usage + tx.amount,
            });
        }
        row.current_usage += tx.amount;
        row.reserved = (row.reserved - reserved_amount).max(0);
        inner.transactions.push(tx.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn release(&self, tx: &LedgerTx) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let key = (tx.tenant_id.clone(), tx.project_id.clone());
        if let Some(row) = inner.limits.get_mut(&key) {
            row.reserved = (row.reserved - tx.amount).max(0);
            inner.transactions.push(tx.clone());
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Option<BudgetSnapshot>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .limits
            .get(&(tenant_id.to_owned(), project_id.to_owned()))
            .map(|row| BudgetSnapshot {
                total_limit: row.total_limit,
                current_usage: row.current_usage,
                reserved: row.reserved,
            }))
    }

    async fn stale_reserves(&self, older_than: Duration) -> Result<Vec<LedgerTx>, LedgerError> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let stale: Vec<LedgerTx> = inner
            .transactions
            .iter()
            .filter(|t| t.kind == TxKind::Reserve && t.created_at < cutoff)
            .filter(|r| {
                !inner.transactions.iter().any(|x| {
                    x.reservation_id == r.reservation_id
                        && matches!(x.kind, TxKind::Commit | TxKind::Release)
                })
            })
            .cloned()
            .collect();
        Ok(stale)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tx(kind: TxKind, amount: i64, reservation_id: Uuid) -> LedgerTx {
        LedgerTx {
            id: Uuid::new_v4(),
            tenant_id: "t".to_owned(),
            project_id: "p".to_owned(),
            task_id: "k".to_owned(),
            request_id: Some("req".to_owned()),
            reservation_id,
            amount,
            kind,
            purpose: "test".to_owned(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reserve_holds_tokens_until_depleted() {
        let ledger = MemoryLedger::new();
        ledger.set_limit("t", "p", 100).await;

        let r1 = Uuid::new_v4();
        assert_eq!(
            ledger.reserve(&tx(TxKind::Reserve, 60, r1), 100).await.unwrap(),
            ReserveOutcome::Reserved
        );
        // Only 40 left — a second 60 loses the race.
        assert_eq!(
            ledger.reserve(&tx(TxKind::Reserve, 60, Uuid::new_v4()), 100).await.unwrap(),
            ReserveOutcome::Depleted
        );

        let snap = ledger.snapshot("t", "p").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 60);
        assert_eq!(snap.available(), 40);
    }

    #[tokio::test]
    async fn commit_conserves_reserved_and_usage() {
        let ledger = MemoryLedger::new();
        ledger.set_limit("t", "p", 100_000).await;

        let rid = Uuid::new_v4();
        ledger.reserve(&tx(TxKind::Reserve, 10_000, rid), 0).await.unwrap();
        // Actual under the reservation: the difference returns to availability.
        let outcome = ledger.commit(&tx(TxKind::Commit, 8_000, rid), 10_000).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let snap = ledger.snapshot("t", "p").await.unwrap().unwrap();
        assert_eq!(snap.current_usage, 8_000);
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.available(), 92_000);
    }

    #[tokio::test]
    async fn commit_past_limit_overflows_and_keeps_hold() {
        let ledger = MemoryLedger::new();
        ledger.set_limit("t", "p", 100).await;

        let rid = Uuid::new_v4();
        ledger.reserve(&tx(TxKind::Reserve, 50, rid), 0).await.unwrap();

        let outcome = ledger.commit(&tx(TxKind::Commit, 150, rid), 50).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Overflow {
                total_limit: 100,
                attempted_usage: 150
            }
        );

        // Nothing changed; the reservation is still held.
        let snap = ledger.snapshot("t", "p").await.unwrap().unwrap();
        assert_eq!(snap.current_usage, 0);
        assert_eq!(snap.reserved, 50);
    }

    #[tokio::test]
    async fn release_is_clamped_and_noop_on_missing_row() {
        let ledger = MemoryLedger::new();
        ledger.set_limit("t", "p", 100).await;

        // Releasing more than held clamps at zero, never negative.
        ledger.release(&tx(TxKind::Release, 30, Uuid::new_v4())).await.unwrap();
        let snap = ledger.snapshot("t", "p").await.unwrap().unwrap();
        assert_eq!(snap.reserved, 0);

        // Unknown (tenant, project) is a quiet no-op.
        let mut foreign = tx(TxKind::Release, 5, Uuid::new_v4());
        foreign.tenant_id = "other".to_owned();
        ledger.release(&foreign).await.unwrap();
    }

    #[tokio::test]
    async fn stale_reserves_skips_settled_reservations() {
        let ledger = MemoryLedger::new();
        ledger.set_limit("t", "p", 1000).await;

        let settled = Uuid::new_v4();
        let orphaned = Uuid::new_v4();

        let mut old_settled = tx(TxKind::Reserve, 10, settled);
        old_settled.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut old_orphaned = tx(TxKind::Reserve, 20, orphaned);
        old_orphaned.created_at = Utc::now() - chrono::Duration::hours(2);

        ledger.reserve(&old_settled, 0).await.unwrap();
        ledger.reserve(&old_orphaned, 0).await.unwrap();
        ledger.commit(&tx(TxKind::Commit, 10, settled), 10).await.unwrap();

        let stale = ledger.stale_reserves(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].reservation_id, orphaned);
    }
}
