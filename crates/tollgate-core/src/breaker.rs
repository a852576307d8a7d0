//! Circuit Breaker Fabric.
//!
//! One breaker per logical dependency, registered by name in a
//! process-wide registry. Three states:
//!
//! - **Closed** — calls pass through; consecutive failures count up and
//!   trip the breaker at the threshold.
//! - **Open** — calls are rejected immediately with a retry-after hint;
//!   after the recovery timeout the next call is admitted as a probe.
//! - **HalfOpen** — up to `half_open_max` concurrent probes; the first
//!   success closes the breaker, any failure reopens it.
//!
//! The per-breaker mutex is held only across state bookkeeping — the
//! wrapped call always runs outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed that trip the breaker.
    pub failure_threshold: u32,
    /// How long Open lasts before a probe is admitted.
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted in HalfOpen.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max: 1,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned by a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E>
where
    E: std::error::Error,
{
    /// The breaker rejected the call without running it.
    #[error("circuit '{name}' is open, retry in {}s", .retry_after.as_secs())]
    Open { name: String, retry_after: Duration },

    /// The wrapped call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of one breaker, for stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u64,
    /// Seconds since the breaker last opened, if it ever did.
    pub open_for_secs: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }
}

/// Whether an admitted call is a normal pass-through or a half-open probe.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Normal,
    Probe,
}

/// A circuit breaker guarding one dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker. Every error counts as a failure.
    ///
    /// # Errors
    ///
    /// - [`BreakerError::Open`] if the call was rejected.
    /// - [`BreakerError::Inner`] if `op` ran and failed.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Run `op` through the breaker, counting only errors for which
    /// `counts_as_failure` returns true. Errors outside the predicate
    /// propagate without touching the failure count.
    ///
    /// # Errors
    ///
    /// - [`BreakerError::Open`] if the call was rejected.
    /// - [`BreakerError::Inner`] if `op` ran and failed.
    pub async fn call_filtered<T, E, F, Fut, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let admission = self.admit()?;

        // The guarded call runs outside the lock.
        let result = op().await;

        match &result {
            Ok(_) => self.on_success(admission),
            Err(e) if counts_as_failure(e) => self.on_failure(admission),
            Err(_) => self.on_unexpected_error(admission),
        }

        result.map_err(BreakerError::Inner)
    }

    /// Decide whether a call may proceed. Bookkeeping only — never held
    /// across the call itself.
    fn admit<E: std::error::Error>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_after: self.config.recovery_timeout - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max {
                    inner.half_open_in_flight += 1;
                    Ok(Admission::Probe)
                } else {
                    // Half-open slots are full; reject until a probe settles.
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.success_count += 1;
        match (inner.state, admission) {
            (BreakerState::HalfOpen, Admission::Probe) => {
                info!(breaker = %self.name, "probe succeeded, circuit closed");
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.half_open_in_flight = 0;
                inner.opened_at = None;
            }
            (BreakerState::Closed, _) => {
                inner.failure_count = 0;
            }
            // A probe finishing after another probe already re-opened the
            // circuit does not flip it back.
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_failure_at = Some(now);

        match (inner.state, admission) {
            (BreakerState::Closed, _) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, circuit open"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            (BreakerState::HalfOpen, Admission::Probe) => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_in_flight = 0;
            }
            _ => {}
        }
    }

    /// An error outside the failure predicate: release any probe slot but
    /// leave counts untouched.
    fn on_unexpected_error(&self, admission: Admission) {
        if matches!(admission, Admission::Probe) {
            let mut inner = self.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Force the breaker closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        info!(breaker = %self.name, "circuit reset to closed");
    }

    /// Current stats.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            open_for_secs: inner.opened_at.map(|at| at.elapsed().as_secs()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock sections never panic, so the mutex cannot be poisoned.
        self.inner.lock().unwrap()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Run `op` through a breaker, substituting `fallback` when the circuit
/// is open. Errors from the call itself always propagate.
///
/// # Errors
///
/// Returns the wrapped call's error. A rejected call never errors — it
/// yields the fallback instead.
pub async fn with_fallback<T, E, F, Fut, FB, FutB>(
    breaker: &CircuitBreaker,
    op: F,
    fallback: FB,
) -> Result<T, E>
where
    E: std::error::Error,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    FB: FnOnce() -> FutB,
    FutB: Future<Output = T>,
{
    match breaker.call(op).await {
        Ok(value) => Ok(value),
        Err(BreakerError::Open { name, .. }) => {
            info!(breaker = %name, "circuit open, serving fallback");
            Ok(fallback().await)
        }
        Err(BreakerError::Inner(e)) => Err(e),
    }
}

/// Process-wide name → breaker map.
///
/// Constructed once at startup and threaded through application state;
/// reads are concurrent, writes happen at registration or admin reset.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker, returning the existing one if the name is taken.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.write();
        Arc::clone(
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Look up a breaker by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    /// Stats for every registered breaker, sorted by name.
    #[must_use]
    pub fn stats_all(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> =
            self.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset every breaker to Closed. Returns the names reset, sorted.
    pub fn reset_all(&self) -> Vec<String> {
        let breakers = self.read();
        let mut names: Vec<String> = breakers.keys().cloned().collect();
        names.sort();
        for breaker in breakers.values() {
            breaker.reset();
        }
        names
    }

    #[allow(clippy::unwrap_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.write().unwrap()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("downstream failed: {0}")]
    struct DownstreamError(&'static str);

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            half_open_max: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<DownstreamError>> {
        breaker
            .call(|| async { Err::<(), _>(DownstreamError("boom")) })
            .await
            .map(|()| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<DownstreamError>> {
        breaker.call(|| async { Ok::<_, DownstreamError>(()) }).await
    }

    #[tokio::test]
    async fn trips_open_at_threshold() {
        let breaker = CircuitBreaker::new("db", fast_config());

        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected without running the call.
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
    }

    #[tokio::test]
    async fn success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new("db", fast_config());

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        // Never reached three consecutive failures.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_successful_probe() {
        let breaker = CircuitBreaker::new("db", fast_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new("db", fast_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Still rejecting until the window passes again.
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn half_open_rejects_beyond_probe_budget() {
        let breaker = Arc::new(CircuitBreaker::new("db", fast_config()));
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // First probe holds the only slot open while it runs.
        let slow = Arc::clone(&breaker);
        let probe = tokio::spawn(async move {
            slow.call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, DownstreamError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Slot is taken — concurrent calls are rejected.
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));

        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn filtered_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("db", fast_config());

        for _ in 0..10 {
            let result = breaker
                .call_filtered(
                    || async { Err::<(), _>(DownstreamError("not found")) },
                    |e| e.0 != "not found",
                )
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn fallback_serves_only_when_open() {
        let breaker = CircuitBreaker::new("db", fast_config());

        // Closed + failing call: the error propagates, no fallback.
        let direct = with_fallback(
            &breaker,
            || async { Err::<i32, _>(DownstreamError("boom")) },
            || async { 42 },
        )
        .await;
        assert!(direct.is_err());

        for _ in 0..2 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let served = with_fallback(
            &breaker,
            || async { Err::<i32, _>(DownstreamError("boom")) },
            || async { 42 },
        )
        .await
        .unwrap();
        assert_eq!(served, 42);
    }

    #[tokio::test]
    async fn registry_registers_and_resets_all() {
        let registry = BreakerRegistry::new();
        let db = registry.register("db", fast_config());
        let again = registry.register("db", BreakerConfig::default());
        // Same instance for the same name.
        assert!(Arc::ptr_eq(&db, &again));
        registry.register("llm", fast_config());

        for _ in 0..3 {
            fail(&db).await.unwrap_err();
        }
        assert_eq!(db.state(), BreakerState::Open);

        let names = registry.reset_all();
        assert_eq!(names, vec!["db", "llm"]);
        assert_eq!(db.state(), BreakerState::Closed);

        let stats = registry.stats_all();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "db");
        assert!(registry.get("llm").is_some());
        assert!(registry.get("missing").is_none());
    }
}
