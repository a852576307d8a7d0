//! Standalone schema migration runner.
//!
//! Applies every pending `.sql` file and exits. A checksum mismatch (a
//! recorded migration whose file changed) aborts with a non-zero exit
//! code before anything further is applied.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use tollgate_core::migrate::Migrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let dir = std::env::var("TOLLGATE_MIGRATIONS_DIR")
        .unwrap_or_else(|_| "./migrations".to_owned());

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let report = Migrator::new(pool, dir).run().await?;

    for version in &report.applied {
        info!(version = %version, "applied");
    }
    info!(
        applied = report.applied.len(),
        skipped = report.skipped,
        "migrations complete"
    );
    Ok(())
}
