//! Prometheus metrics.
//!
//! One [`Metrics`] value owns the registry and every instrument; it lives
//! in `AppState` and is threaded explicitly — no global statics, so tests
//! get their own registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// All instruments the server emits.
pub struct Metrics {
    registry: Registry,
    /// `http_requests_total{route,method,status}`
    pub http_requests: IntCounterVec,
    /// `http_request_duration_seconds{route,method}`
    pub http_duration: HistogramVec,
    /// `auth_logins_total{result}` — `success` | `fail`
    pub auth_logins: IntCounterVec,
    /// `budget_requests_total{status}` — `approved` | `insufficient` | `failed` | `duplicate`
    pub budget_requests: IntCounterVec,
    /// `budget_commits_total`
    pub budget_commits: IntCounter,
    /// `budget_releases_total`
    pub budget_releases: IntCounter,
    /// `dlq_resolved_total`
    pub dlq_resolved: IntCounter,
    /// `breaker_resets_total`
    pub breaker_resets: IntCounter,
}

impl Metrics {
    /// Create and register every instrument.
    ///
    /// # Errors
    ///
    /// Returns [`prometheus::Error`] if registration fails (duplicate
    /// names — impossible with a fresh registry).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["route", "method", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["route", "method"],
        )?;
        let auth_logins = IntCounterVec::new(
            Opts::new("auth_logins_total", "Total authentication attempts"),
            &["result"],
        )?;
        let budget_requests = IntCounterVec::new(
            Opts::new("budget_requests_total", "Total budget requests"),
            &["status"],
        )?;
        let budget_commits =
            IntCounter::with_opts(Opts::new("budget_commits_total", "Total budget commits"))?;
        let budget_releases =
            IntCounter::with_opts(Opts::new("budget_releases_total", "Total budget releases"))?;
        let dlq_resolved =
            IntCounter::with_opts(Opts::new("dlq_resolved_total", "Total DLQ messages resolved"))?;
        let breaker_resets = IntCounter::with_opts(Opts::new(
            "breaker_resets_total",
            "Total circuit breaker resets",
        ))?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(auth_logins.clone()))?;
        registry.register(Box::new(budget_requests.clone()))?;
        registry.register(Box::new(budget_commits.clone()))?;
        registry.register(Box::new(budget_releases.clone()))?;
        registry.register(Box::new(dlq_resolved.clone()))?;
        registry.register(Box::new(breaker_resets.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            auth_logins,
            budget_requests,
            budget_commits,
            budget_releases,
            dlq_resolved,
            breaker_resets,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
