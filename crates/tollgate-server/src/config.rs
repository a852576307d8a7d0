//! Server configuration.
//!
//! Loaded from environment variables. `DATABASE_URL`, `REDIS_URL`, and
//! `JWT_SECRET` are required — the server refuses to boot when any is
//! missing, or when the JWT secret still carries the placeholder value.

use std::net::SocketAddr;
use std::time::Duration;

/// The JWT secret nobody is allowed to run with.
const PLACEHOLDER_SECRET: &str = "change-me";

/// Configuration errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("required environment variable {name} is not set")]
    Missing { name: &'static str },

    /// `JWT_SECRET` is empty or still the placeholder.
    #[error("JWT_SECRET must be set to a real secret (not '{PLACEHOLDER_SECRET}')")]
    PlaceholderSecret,

    /// A variable was set to something unparseable.
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to (`HOST` / `PORT`).
    pub bind_addr: SocketAddr,
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Shared secret for bearer token signing.
    pub jwt_secret: String,
    /// Allowed CORS origins; `*` means any.
    pub cors_allow_origins: Vec<String>,
    /// Failed login attempts before lockout.
    pub login_max_attempts: i64,
    /// Lockout window.
    pub login_lockout_ttl: Duration,
    /// Bearer token lifetime.
    pub token_ttl: Duration,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// Budget limit for a (tenant, project) seen for the first time.
    pub default_budget_limit: i64,
    /// Interval between budget sweeper passes.
    pub sweep_interval: Duration,
    /// Password for the bootstrap `admin` user.
    pub admin_password: String,
    /// Directory of SQL migration files.
    pub migrations_dir: String,
}

fn var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing { name })
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` — PostgreSQL connection string (required)
    /// - `REDIS_URL` — Redis connection string (required)
    /// - `JWT_SECRET` — token signing secret (required, non-placeholder)
    /// - `HOST` / `PORT` — bind address (default `127.0.0.1:8080`)
    /// - `CORS_ALLOW_ORIGINS` — comma-separated origins (default `*`)
    /// - `LOGIN_MAX_ATTEMPTS` — lockout threshold (default `5`)
    /// - `LOGIN_LOCKOUT_TTL_SECONDS` — lockout window (default `900`)
    /// - `TOKEN_TTL_HOURS` — bearer token lifetime (default `24`)
    /// - `TOLLGATE_LOG_LEVEL` — log filter (default `info`)
    /// - `BUDGET_DEFAULT_LIMIT` — first-seen tenant limit (default `100000`)
    /// - `BUDGET_SWEEP_INTERVAL_SECONDS` — sweeper cadence (default `300`)
    /// - `ADMIN_PASSWORD` — bootstrap admin password (default `admin123`)
    /// - `TOLLGATE_MIGRATIONS_DIR` — migration directory (default `./migrations`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing, the
    /// JWT secret is the placeholder, or a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL")?;
        let redis_url = var("REDIS_URL")?;
        let jwt_secret = var("JWT_SECRET")?;
        if jwt_secret.is_empty() || jwt_secret == PLACEHOLDER_SECRET {
            return Err(ConfigError::PlaceholderSecret);
        }

        let host = var_or("HOST", "127.0.0.1");
        let port: u16 = parse_var("PORT", 8080)?;
        let bind_addr: SocketAddr =
            format!("{host}:{port}")
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                    name: "HOST",
                    reason: e.to_string(),
                })?;

        let cors_allow_origins = var_or("CORS_ALLOW_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            jwt_secret,
            cors_allow_origins,
            login_max_attempts: parse_var("LOGIN_MAX_ATTEMPTS", 5)?,
            login_lockout_ttl: Duration::from_secs(parse_var("LOGIN_LOCKOUT_TTL_SECONDS", 900)?),
            token_ttl: Duration::from_secs(parse_var::<u64>("TOKEN_TTL_HOURS", 24)? * 3600),
            log_level: var_or("TOLLGATE_LOG_LEVEL", "info"),
            default_budget_limit: parse_var("BUDGET_DEFAULT_LIMIT", 100_000)?,
            sweep_interval: Duration::from_secs(parse_var("BUDGET_SWEEP_INTERVAL_SECONDS", 300)?),
            admin_password: var_or("ADMIN_PASSWORD", "admin123"),
            migrations_dir: var_or("TOLLGATE_MIGRATIONS_DIR", "./migrations"),
        })
    }
}
