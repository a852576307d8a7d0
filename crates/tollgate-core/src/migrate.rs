//! Checksummed schema migration runner.
//!
//! Applies `.sql` files from a directory in lexicographic order. Each
//! applied file is recorded in `schema_migrations` with the SHA-256 of
//! its contents; a recorded file that later presents a different checksum
//! halts the run before anything else is applied. Already-recorded files
//! are skipped, so the runner is idempotent.

use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::info;

use crate::error::MigrateError;

/// Summary of one migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
    /// Versions already recorded and skipped.
    pub skipped: usize,
}

/// SHA-256 of a migration file, hex-encoded.
#[must_use]
pub fn checksum(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}

/// A pending migration file.
#[derive(Debug, Clone)]
struct MigrationFile {
    version: String,
    path: PathBuf,
}

/// Collect `.sql` files under `dir`, sorted by filename.
fn plan(dir: &Path) -> Result<Vec<MigrationFile>, MigrateError> {
    let entries = std::fs::read_dir(dir).map_err(|e| MigrateError::Io {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MigrateError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            let version = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_owned();
            files.push(MigrationFile { version, path });
        }
    }
    files.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(files)
}

/// Runs migrations against PostgreSQL.
pub struct Migrator {
    pool: PgPool,
    dir: PathBuf,
}

impl Migrator {
    /// Create a migrator for the given directory.
    #[must_use]
    pub fn new(pool: PgPool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
        }
    }

    /// Apply all pending migrations.
    ///
    /// # Errors
    ///
    /// - [`MigrateError::ChecksumMismatch`] if a recorded migration's file
    ///   changed on disk; nothing further is applied.
    /// - [`MigrateError::Failed`] if a statement fails; that migration's
    ///   transaction rolls back and the run stops.
    pub async fn run(&self) -> Result<MigrationReport, MigrateError> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS schema_migrations (
                version     TEXT PRIMARY KEY,
                checksum    TEXT NOT NULL,
                applied_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                duration_ms BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MigrateError::Db {
            reason: e.to_string(),
        })?;

        let mut report = MigrationReport::default();

        for file in plan(&self.dir)? {
            let contents = std::fs::read_to_string(&file.path).map_err(|e| MigrateError::Io {
                path: file.path.display().to_string(),
                reason: e.to_string(),
            })?;
            let actual = checksum(&contents);

            let recorded: Option<String> =
                sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE version = $1")
                    .bind(&file.version)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| MigrateError::Db {
                        reason: e.to_string(),
                    })?;

            match recorded {
                Some(recorded) if recorded == actual => {
                    report.skipped += 1;
                    continue;
                }
                Some(recorded) => {
                    return Err(MigrateError::ChecksumMismatch {
                        version: file.version,
                        recorded,
                        actual,
                    });
                }
                None => {}
            }

            let started = Instant::now();
            self.apply(&file.version, &contents, &actual).await?;
            info!(
                version = %file.version,
                duration_ms = started.elapsed().as_millis() as u64,
                "migration applied"
            );
            report.applied.push(file.version);
        }

        Ok(report)
    }

    /// Apply one migration and its bookkeeping row in a single transaction.
    async fn apply(&self, version: &str, contents: &str, checksum: &str) -> Result<(), MigrateError> {
        let failed = |e: sqlx::Error| MigrateError::Failed {
            version: version.to_owned(),
            reason: e.to_string(),
        };

        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(failed)?;

        sqlx::raw_sql(contents)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as i64;
        sqlx::query(
            r"INSERT INTO schema_migrations (version, checksum, duration_ms)
              VALUES ($1, $2, $3)",
        )
        .bind(version)
        .bind(checksum)
        .bind(duration_ms)
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

        tx.commit().await.map_err(failed)?;
        Ok(())
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
