use ferry_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::job_repository::FetchJobRepository;

/// Connection to the PostgreSQL job store.
///
/// Connecting validates the pool settings first; [`apply_schema`](Self::apply_schema)
/// brings the `fetch_jobs` table and its claim indexes up to date.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        config.validate()?;
        let target = redacted_target(&config.url);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                AppError::PersistenceError(format!("Cannot reach job store at {target}: {e}"))
            })?;

        tracing::debug!(
            target = %target,
            max_connections = config.max_connections,
            "Job store pool ready"
        );
        Ok(Self { pool })
    }

    pub async fn apply_schema(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                AppError::PersistenceError(format!("Failed to apply fetch_jobs schema: {e}"))
            })?;
        Ok(())
    }

    /// Queue backed by this pool. Repositories share the pool.
    pub fn queue(&self) -> FetchJobRepository {
        FetchJobRepository::new(self.pool.clone())
    }
}

/// Host and database part of a connection URL, without credentials.
fn redacted_target(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.rsplit_once('@').map_or(rest, |(_, host)| host)
}
