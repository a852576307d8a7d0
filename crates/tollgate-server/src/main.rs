//! Tollgate server entry point.
//!
//! Bootstraps PostgreSQL, Redis, and the message bus, runs migrations,
//! seeds the admin user on first boot, then starts the Axum HTTP server
//! with graceful shutdown. Two background workers run alongside the
//! server — the DLQ drain worker and the budget expiry sweeper — and are
//! cancelled through a shared shutdown channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Method, header};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use tollgate_core::audit::{AuditManager, PgAuditSink};
use tollgate_core::auth::{AuthConfig, Authenticator, Role, hash_password};
use tollgate_core::breaker::{BreakerConfig, BreakerRegistry};
use tollgate_core::budget::{BudgetConfig, BudgetEngine};
use tollgate_core::dlq::{DlqWorker, PgDlqStore, stream_topology};
use tollgate_core::ledger::PgLedger;
use tollgate_core::migrate::Migrator;
use tollgate_core::token::TokenSigner;
use tollgate_core::users::{PgUserDirectory, UserDirectory};
use tollgate_store::{KvStore, MemoryBus, MessageBus, RedisKv};

use tollgate_server::config::ServerConfig;
use tollgate_server::metrics::Metrics;
use tollgate_server::routes;
use tollgate_server::state::{AppState, RateLimits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("configuration error")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(addr = %config.bind_addr, "tollgate starting");

    let (state, workers) = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // DLQ drain worker.
    let dlq_worker_handle = {
        let worker = DlqWorker::new(
            Arc::clone(&workers.bus),
            Arc::clone(&workers.dlq_store),
            shutdown_rx.clone(),
        );
        tokio::spawn(worker.run())
    };

    // Budget expiry sweeper.
    let sweeper_handle = {
        let budget = Arc::clone(&workers.budget);
        let mut rx = shutdown_rx.clone();
        let interval = config.sweep_interval;
        tokio::spawn(async move {
            budget_sweeper(&budget, &mut rx, interval).await;
        })
    };

    let app = routes::app(Arc::clone(&state), build_cors(&config.cors_allow_origins));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "tollgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), dlq_worker_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;

    info!("tollgate stopped");
    Ok(())
}

/// Handles kept out of `AppState` that the background workers need.
struct WorkerDeps {
    bus: Arc<dyn MessageBus>,
    dlq_store: Arc<dyn tollgate_core::dlq::DlqStore>,
    budget: Arc<BudgetEngine>,
}

/// Build shared state: connect backends, migrate, seed, wire engines.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<(Arc<AppState>, WorkerDeps)> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let report = Migrator::new(pool.clone(), &config.migrations_dir)
        .run()
        .await
        .context("schema migration failed")?;
    info!(
        applied = report.applied.len(),
        skipped = report.skipped,
        "schema migrations complete"
    );

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );

    // In-process bus; a brokered deployment swaps in its own adapter.
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    bus.provision(&stream_topology())
        .await
        .context("failed to provision bus streams")?;

    let audit = Arc::new(AuditManager::new());
    audit.add_sink(Arc::new(PgAuditSink::new(pool.clone()))).await;

    let users: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool.clone()));
    bootstrap_admin(users.as_ref(), &config.admin_password).await?;

    let signer = TokenSigner::new(config.jwt_secret.as_bytes(), config.token_ttl);
    let auth = Arc::new(Authenticator::new(
        Arc::clone(&kv),
        Arc::clone(&users),
        signer,
        Arc::clone(&audit),
        AuthConfig {
            max_attempts: config.login_max_attempts,
            lockout_ttl: config.login_lockout_ttl,
            ..AuthConfig::default()
        },
    ));

    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let budget = Arc::new(BudgetEngine::new(
        Arc::clone(&kv),
        ledger,
        Arc::clone(&audit),
        BudgetConfig {
            default_limit: config.default_budget_limit,
            ..BudgetConfig::default()
        },
    ));

    let dlq_store: Arc<dyn tollgate_core::dlq::DlqStore> = Arc::new(PgDlqStore::new(pool));

    // Breakers for the dependencies this process calls out to.
    let breakers = Arc::new(BreakerRegistry::new());
    breakers.register("postgres", BreakerConfig::default());
    breakers.register("redis", BreakerConfig::default());
    breakers.register("message-bus", BreakerConfig::default());

    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);

    let state = Arc::new(AppState {
        kv,
        auth,
        budget: Arc::clone(&budget),
        dlq: Arc::clone(&dlq_store),
        breakers,
        audit,
        metrics,
        rate_limits: RateLimits::default(),
        started_at: Instant::now(),
    });

    Ok((
        state,
        WorkerDeps {
            bus,
            dlq_store,
            budget,
        },
    ))
}

/// Create the `admin` user when the directory is empty.
async fn bootstrap_admin(users: &dyn UserDirectory, password: &str) -> anyhow::Result<()> {
    let count = users.count().await.context("user directory unavailable")?;
    if count > 0 {
        return Ok(());
    }

    let hash = hash_password(password.to_owned(), 12)
        .await
        .context("failed to hash admin password")?;
    users
        .create("admin", &hash, Role::Admin)
        .await
        .context("failed to create admin user")?;
    warn!("bootstrapped default 'admin' user — rotate its password");
    Ok(())
}

/// Build the CORS layer from configured origins.
fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ]);

    if origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Periodically reconcile reservations whose KV entry expired.
async fn budget_sweeper(
    budget: &BudgetEngine,
    shutdown: &mut watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "budget sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match budget.sweep_expired().await {
                    Ok(0) => {}
                    Ok(swept) => info!(swept, "budget sweep complete"),
                    Err(e) => warn!(error = %e, "budget sweep failed, will retry next tick"),
                }
            }
            _ = shutdown.changed() => {
                info!("budget sweeper shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
