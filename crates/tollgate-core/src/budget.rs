//! Budget Reservation Engine.
//!
//! Idempotent two-phase token allocation: `request` holds tokens
//! (Requested → Held), `commit` moves them into usage, `release` returns
//! them. A KV idempotency envelope serialises retries of a logical
//! request and caches its outcome; the durable ledger's conditional
//! UPDATE serialises concurrent allocations against the same
//! (tenant, project).
//!
//! KV key layout (all TTL-bound):
//!
//! - `budget:req:{tenant}:{task}:{request_id}` — envelope, 300s
//! - `budget:req:{tenant}:{task}:{request_id}:result` — cached decision, 300s
//! - `reservation:{tenant}:{project}:{id}` — `amount:task_id`, 3600s
//! - `reservations:{tenant}:{project}` — reservation id set, 3600s
//! - `budget:state:{tenant}:{project}` — ledger row cache, 10s
//!
//! A reservation whose KV entry expires before commit leaves `reserved`
//! inflated in the ledger; the sweeper reconciles by issuing synthetic
//! releases for reserve rows past the TTL with no settlement row.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_store::KvStore;

use crate::audit::{AuditEvent, AuditManager};
use crate::auth::Principal;
use crate::error::BudgetError;
use crate::ledger::{BudgetLedger, BudgetSnapshot, CommitOutcome, LedgerTx, ReserveOutcome, TxKind};

/// Envelope sentinel while the first caller is still allocating.
const PROCESSING: &str = "processing";

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Limit given to a (tenant, project) seen for the first time.
    pub default_limit: i64,
    /// Reservation lifetime (Held → Expired).
    pub reservation_ttl: Duration,
    /// Idempotency envelope lifetime.
    pub envelope_ttl: Duration,
    /// Ledger-row cache lifetime.
    pub state_cache_ttl: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limit: 100_000,
            reservation_ttl: Duration::from_secs(3600),
            envelope_ttl: Duration::from_secs(300),
            state_cache_ttl: Duration::from_secs(10),
        }
    }
}

/// Parameters of a budget request.
#[derive(Debug, Clone)]
pub struct BudgetRequest {
    pub tenant_id: String,
    pub project_id: String,
    pub task_id: String,
    pub purpose: String,
    pub model: String,
    pub estimated_tokens: i64,
    /// Client-supplied idempotency key; a fresh UUID is assigned if absent.
    pub request_id: Option<String>,
}

/// Why a request was not approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    InsufficientBudget,
    ReservationFailed,
    DuplicateRequestInProgress,
}

/// The outcome of a budget request. Cached verbatim under the idempotency
/// envelope, so retries observe byte-equal payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    /// Tokens held when approved, zero otherwise.
    pub allocated: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionReason>,
    /// Availability at decision time, for insufficient-budget responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i64>,
    pub requested: i64,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitReceipt {
    /// Actual tokens moved into usage.
    pub tokens: i64,
    /// Whether actual exceeded the reserved amount.
    pub overshoot: bool,
}

/// Per-(tenant, project) budget state as reported to clients.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetState {
    pub total: i64,
    pub used: i64,
    pub reserved: i64,
    pub available: i64,
}

/// The Budget Reservation Engine.
pub struct BudgetEngine {
    kv: Arc<dyn KvStore>,
    ledger: Arc<dyn BudgetLedger>,
    audit: Arc<AuditManager>,
    config: BudgetConfig,
}

impl BudgetEngine {
    /// Create a new engine.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        ledger: Arc<dyn BudgetLedger>,
        audit: Arc<AuditManager>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            kv,
            ledger,
            audit,
            config,
        }
    }

    fn envelope_key(tenant: &str, task: &str, request_id: &str) -> String {
        format!("budget:req:{tenant}:{task}:{request_id}")
    }

    fn reservation_key(tenant: &str, project: &str, id: Uuid) -> String {
        format!("reservation:{tenant}:{project}:{id}")
    }

    fn reservation_set_key(tenant: &str, project: &str) -> String {
        format!("reservations:{tenant}:{project}")
    }

    fn state_cache_key(tenant: &str, project: &str) -> String {
        format!("budget:state:{tenant}:{project}")
    }

    /// Request a token allocation.
    ///
    /// Idempotent on (tenant, task, `request_id`): the first caller runs
    /// the allocation, every retry within the envelope TTL reads the
    /// cached decision verbatim, and a concurrent retry that arrives
    /// while the first is still running gets a non-approved
    /// `duplicate_request_in_progress` decision with no side effects.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError`] on KV or ledger failure; the envelope is
    /// deleted in that case so the caller may retry.
    pub async fn request(&self, req: BudgetRequest) -> Result<Decision, BudgetError> {
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let envelope = Self::envelope_key(&req.tenant_id, &req.task_id, &request_id);
        let result_key = format!("{envelope}:result");

        let won = self
            .kv
            .set_nx(&envelope, PROCESSING, self.config.envelope_ttl)
            .await?;

        if !won {
            if let Some(cached) = self.kv.get(&result_key).await? {
                let decision: Decision =
                    serde_json::from_str(&cached).map_err(|e| BudgetError::Codec {
                        key: result_key.clone(),
                        reason: e.to_string(),
                    })?;
                return Ok(decision);
            }
            // First caller still in flight — report, with no side effects.
            return Ok(Decision {
                approved: false,
                request_id,
                reservation_id: None,
                allocated: 0,
                reason: Some(DecisionReason::DuplicateRequestInProgress),
                available: None,
                requested: req.estimated_tokens,
            });
        }

        match self.allocate(&req, &request_id).await {
            Ok(decision) => {
                let payload =
                    serde_json::to_string(&decision).map_err(|e| BudgetError::Codec {
                        key: result_key.clone(),
                        reason: e.to_string(),
                    })?;
                self.kv
                    .set(&result_key, &payload, Some(self.config.envelope_ttl))
                    .await?;
                Ok(decision)
            }
            Err(err) => {
                // Free the envelope so the caller may retry safely.
                if let Err(cleanup) = self.kv.delete(&envelope).await {
                    warn!(key = %envelope, error = %cleanup, "failed to clear idempotency envelope");
                }
                Err(err)
            }
        }
    }

    /// The allocation algorithm, run only by the envelope winner.
    async fn allocate(&self, req: &BudgetRequest, request_id: &str) -> Result<Decision, BudgetError> {
        let snapshot = self.load_state(&req.tenant_id, &req.project_id).await?;

        if snapshot.available() < req.estimated_tokens {
            return Ok(Decision {
                approved: false,
                request_id: request_id.to_owned(),
                reservation_id: None,
                allocated: 0,
                reason: Some(DecisionReason::InsufficientBudget),
                available: Some(snapshot.available()),
                requested: req.estimated_tokens,
            });
        }

        let reservation_id = Uuid::new_v4();
        let tx = LedgerTx {
            id: Uuid::new_v4(),
            tenant_id: req.tenant_id.clone(),
            project_id: req.project_id.clone(),
            task_id: req.task_id.clone(),
            request_id: Some(request_id.to_owned()),
            reservation_id,
            amount: req.estimated_tokens,
            kind: TxKind::Reserve,
            purpose: req.purpose.clone(),
            created_at: Utc::now(),
        };

        match self.ledger.reserve(&tx, self.config.default_limit).await? {
            ReserveOutcome::Depleted => Ok(Decision {
                approved: false,
                request_id: request_id.to_owned(),
                reservation_id: None,
                allocated: 0,
                reason: Some(DecisionReason::ReservationFailed),
                available: None,
                requested: req.estimated_tokens,
            }),
            ReserveOutcome::Reserved => {
                self.kv
                    .delete(&Self::state_cache_key(&req.tenant_id, &req.project_id))
                    .await?;

                let res_key =
                    Self::reservation_key(&req.tenant_id, &req.project_id, reservation_id);
                let value = format!("{}:{}", req.estimated_tokens, req.task_id);
                self.kv
                    .set(&res_key, &value, Some(self.config.reservation_ttl))
                    .await?;
                self.kv
                    .set_add(
                        &Self::reservation_set_key(&req.tenant_id, &req.project_id),
                        &reservation_id.to_string(),
                        Some(self.config.reservation_ttl),
                    )
                    .await?;

                info!(
                    tenant = %req.tenant_id,
                    project = %req.project_id,
                    reservation = %reservation_id,
                    tokens = req.estimated_tokens,
                    model = %req.model,
                    "budget reserved"
                );

                Ok(Decision {
                    approved: true,
                    request_id: request_id.to_owned(),
                    reservation_id: Some(reservation_id),
                    allocated: req.estimated_tokens,
                    reason: None,
                    available: None,
                    requested: req.estimated_tokens,
                })
            }
        }
    }

    /// Commit a held reservation with the tokens actually consumed.
    ///
    /// Usage grows by `actual_tokens`; `reserved` shrinks by the amount
    /// originally held. If actual exceeded the hold, the commit still
    /// applies (limit permitting) and the audit detail carries an
    /// `overshoot` flag.
    ///
    /// # Errors
    ///
    /// - [`BudgetError::ReservationNotFound`] if the KV entry is gone
    ///   (expired or never existed) — the caller must re-request.
    /// - [`BudgetError::Overflow`] if usage would exceed the limit; the
    ///   reservation stays held for operator triage.
    pub async fn commit(
        &self,
        principal: &Principal,
        tenant_id: &str,
        project_id: &str,
        reservation_id: Uuid,
        actual_tokens: i64,
    ) -> Result<CommitReceipt, BudgetError> {
        let res_key = Self::reservation_key(tenant_id, project_id, reservation_id);
        let Some(raw) = self.kv.get(&res_key).await? else {
            return Err(BudgetError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            });
        };
        let (reserved_amount, task_id) = parse_reservation(&res_key, &raw)?;

        let tx = LedgerTx {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            project_id: project_id.to_owned(),
            task_id,
            request_id: None,
            reservation_id,
            amount: actual_tokens,
            kind: TxKind::Commit,
            purpose: "commit".to_owned(),
            created_at: Utc::now(),
        };

        match self.ledger.commit(&tx, reserved_amount).await? {
            CommitOutcome::RowMissing => Err(BudgetError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }),
            CommitOutcome::Overflow {
                total_limit,
                attempted_usage,
            } => Err(BudgetError::Overflow {
                total_limit,
                attempted_usage,
            }),
            CommitOutcome::Committed => {
                self.cleanup_reservation(tenant_id, project_id, reservation_id).await;

                let overshoot = actual_tokens > reserved_amount;
                self.audit
                    .log(AuditEvent::new(
                        &principal.id,
                        Some(principal.role),
                        "budget.commit",
                        "reservation",
                        &reservation_id.to_string(),
                        json!({
                            "tenant_id": tenant_id,
                            "project_id": project_id,
                            "actual_tokens": actual_tokens,
                            "reserved_tokens": reserved_amount,
                            "overshoot": overshoot,
                        }),
                    ))
                    .await;

                Ok(CommitReceipt {
                    tokens: actual_tokens,
                    overshoot,
                })
            }
        }
    }

    /// Release a held reservation back to availability.
    ///
    /// Idempotent: releasing an unknown or already-settled reservation is
    /// a no-op that still succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError`] on KV or ledger failure.
    pub async fn release(
        &self,
        principal: &Principal,
        tenant_id: &str,
        project_id: &str,
        reservation_id: Uuid,
    ) -> Result<(), BudgetError> {
        let res_key = Self::reservation_key(tenant_id, project_id, reservation_id);
        let released = match self.kv.get(&res_key).await? {
            Some(raw) => {
                let (reserved_amount, task_id) = parse_reservation(&res_key, &raw)?;
                let tx = LedgerTx {
                    id: Uuid::new_v4(),
                    tenant_id: tenant_id.to_owned(),
                    project_id: project_id.to_owned(),
                    task_id,
                    request_id: None,
                    reservation_id,
                    amount: reserved_amount,
                    kind: TxKind::Release,
                    purpose: "release".to_owned(),
                    created_at: Utc::now(),
                };
                self.ledger.release(&tx).await?;
                self.cleanup_reservation(tenant_id, project_id, reservation_id).await;
                reserved_amount
            }
            None => 0,
        };

        self.audit
            .log(AuditEvent::new(
                &principal.id,
                Some(principal.role),
                "budget.release",
                "reservation",
                &reservation_id.to_string(),
                json!({
                    "tenant_id": tenant_id,
                    "project_id": project_id,
                    "released_tokens": released,
                }),
            ))
            .await;
        Ok(())
    }

    /// Current budget state.
    ///
    /// `total` and `used` come from the (cached) ledger row; `reserved`
    /// is computed by enumerating the per-scope reservation set, which
    /// keeps tenants isolated and avoids any global scan. Stale set
    /// members whose entry expired are pruned on the way through.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError`] on KV or ledger failure.
    pub async fn state(&self, tenant_id: &str, project_id: &str) -> Result<BudgetState, BudgetError> {
        let snapshot = self.load_state(tenant_id, project_id).await?;

        let set_key = Self::reservation_set_key(tenant_id, project_id);
        let mut reserved = 0i64;
        for id in self.kv.set_members(&set_key).await? {
            let Ok(reservation_id) = id.parse::<Uuid>() else {
                self.kv.set_remove(&set_key, &id).await?;
                continue;
            };
            let res_key = Self::reservation_key(tenant_id, project_id, reservation_id);
            match self.kv.get(&res_key).await? {
                Some(raw) => {
                    let (amount, _) = parse_reservation(&res_key, &raw)?;
                    reserved += amount;
                }
                None => {
                    // Entry expired; drop the dangling set member.
                    self.kv.set_remove(&set_key, &id).await?;
                }
            }
        }

        Ok(BudgetState {
            total: snapshot.total_limit,
            used: snapshot.current_usage,
            reserved,
            available: snapshot.total_limit - snapshot.current_usage - reserved,
        })
    }

    /// Reconcile reservations whose KV entry expired before settlement.
    ///
    /// Scans ledger `reserve` rows older than the reservation TTL with no
    /// matching commit/release and issues synthetic releases. Returns the
    /// number of reservations swept.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError`] on KV or ledger failure.
    pub async fn sweep_expired(&self) -> Result<usize, BudgetError> {
        let stale = self
            .ledger
            .stale_reserves(self.config.reservation_ttl)
            .await?;
        let count = stale.len();

        for orphan in stale {
            let tx = LedgerTx {
                id: Uuid::new_v4(),
                tenant_id: orphan.tenant_id.clone(),
                project_id: orphan.project_id.clone(),
                task_id: orphan.task_id.clone(),
                request_id: None,
                reservation_id: orphan.reservation_id,
                amount: orphan.amount,
                kind: TxKind::Release,
                purpose: "expired_sweep".to_owned(),
                created_at: Utc::now(),
            };
            self.ledger.release(&tx).await?;
            self.cleanup_reservation(&orphan.tenant_id, &orphan.project_id, orphan.reservation_id)
                .await;

            info!(
                tenant = %orphan.tenant_id,
                project = %orphan.project_id,
                reservation = %orphan.reservation_id,
                tokens = orphan.amount,
                "swept expired reservation"
            );
        }
        Ok(count)
    }

    /// Load the ledger row through the short-lived KV cache.
    async fn load_state(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<BudgetSnapshot, BudgetError> {
        let cache_key = Self::state_cache_key(tenant_id, project_id);
        if let Some(cached) = self.kv.get(&cache_key).await? {
            if let Ok(snapshot) = serde_json::from_str::<BudgetSnapshot>(&cached) {
                return Ok(snapshot);
            }
            // Unreadable cache entry — fall through to the ledger.
            self.kv.delete(&cache_key).await?;
        }

        let snapshot = self
            .ledger
            .ensure(tenant_id, project_id, self.config.default_limit)
            .await?;
        if let Ok(payload) = serde_json::to_string(&snapshot) {
            self.kv
                .set(&cache_key, &payload, Some(self.config.state_cache_ttl))
                .await?;
        }
        Ok(snapshot)
    }

    /// Drop the KV reservation entry, its set membership, and the state
    /// cache. Best-effort: the ledger is already settled.
    async fn cleanup_reservation(&self, tenant_id: &str, project_id: &str, reservation_id: Uuid) {
        let res_key = Self::reservation_key(tenant_id, project_id, reservation_id);
        let set_key = Self::reservation_set_key(tenant_id, project_id);
        let cache_key = Self::state_cache_key(tenant_id, project_id);

        if let Err(e) = self.kv.delete(&res_key).await {
            warn!(key = %res_key, error = %e, "reservation cleanup failed");
        }
        if let Err(e) = self
            .kv
            .set_remove(&set_key, &reservation_id.to_string())
            .await
        {
            warn!(key = %set_key, error = %e, "reservation cleanup failed");
        }
        if let Err(e) = self.kv.delete(&cache_key).await {
            warn!(key = %cache_key, error = %e, "reservation cleanup failed");
        }
    }
}

impl fmt::Debug for BudgetEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Parse a `amount:task_id` reservation entry.
fn parse_reservation(key: &str, raw: &str) -> Result<(i64, String), BudgetError> {
    let (amount, task_id) = raw.split_once(':').ok_or_else(|| BudgetError::Codec {
        key: key.to_owned(),
        reason: "expected amount:task_id".to_owned(),
    })?;
    let amount: i64 = amount.parse().map_err(|_| BudgetError::Codec {
        key: key.to_owned(),
        reason: "non-numeric amount".to_owned(),
    })?;
    Ok((amount, task_id.to_owned()))
}
