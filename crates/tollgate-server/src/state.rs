//! Shared application state.
//!
//! Every collaborator is an explicitly constructed value behind an `Arc`
//! (trait objects where a fake exists), threaded through request context.
//! Tests build the same state from in-memory backends — no globals, no
//! monkey-patching.

use std::sync::Arc;
use std::time::Instant;

use tollgate_core::audit::AuditManager;
use tollgate_core::auth::Authenticator;
use tollgate_core::breaker::BreakerRegistry;
use tollgate_core::budget::BudgetEngine;
use tollgate_core::dlq::DlqStore;
use tollgate_store::KvStore;

use crate::metrics::Metrics;

/// Per-role request budgets (requests/minute).
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub admin: i64,
    pub operator: i64,
    pub developer: i64,
    pub observer: i64,
    pub anonymous: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            admin: 100,
            operator: 50,
            developer: 30,
            observer: 20,
            anonymous: 5,
        }
    }
}

impl RateLimits {
    /// Budget for a role label (`anonymous` for unauthenticated callers).
    #[must_use]
    pub fn per_minute(&self, role: &str) -> i64 {
        match role {
            "admin" => self.admin,
            "operator" => self.operator,
            "developer" => self.developer,
            "observer" => self.observer,
            _ => self.anonymous,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub auth: Arc<Authenticator>,
    pub budget: Arc<BudgetEngine>,
    pub dlq: Arc<dyn DlqStore>,
    pub breakers: Arc<BreakerRegistry>,
    pub audit: Arc<AuditManager>,
    pub metrics: Arc<Metrics>,
    pub rate_limits: RateLimits,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("rate_limits", &self.rate_limits)
            .finish_non_exhaustive()
    }
}
