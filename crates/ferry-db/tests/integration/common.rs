use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 001_fetch_jobs.sql
    r#"CREATE TABLE IF NOT EXISTS fetch_jobs (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        url TEXT NOT NULL,
        domain VARCHAR(255) NOT NULL,
        priority SMALLINT NOT NULL DEFAULT 3,
        state VARCHAR(20) NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        captcha_attempts INTEGER NOT NULL DEFAULT 0,
        not_before TIMESTAMPTZ,
        last_error_kind VARCHAR(32),
        last_error_message TEXT,
        last_proxy TEXT,
        captcha_token TEXT,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        result_status INTEGER,
        result_body TEXT,
        result_hash VARCHAR(64),
        fetched_at TIMESTAMPTZ,
        worker_id VARCHAR(255),
        submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT chk_fetch_jobs_state CHECK (
            state IN ('pending', 'in_flight', 'retry_scheduled', 'succeeded', 'failed')
        ),
        CONSTRAINT chk_fetch_jobs_priority CHECK (priority BETWEEN 1 AND 5),
        CONSTRAINT chk_fetch_jobs_max_attempts CHECK (max_attempts >= 1)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_fetch_jobs_admissible
        ON fetch_jobs (priority, submitted_at, seq)
        WHERE state IN ('pending', 'retry_scheduled')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_fetch_jobs_in_flight
        ON fetch_jobs (worker_id, updated_at)
        WHERE state = 'in_flight'"#,
    r#"CREATE INDEX IF NOT EXISTS idx_fetch_jobs_state ON fetch_jobs (state, seq DESC)"#,
];

/// Spins up a PostgreSQL container and returns a migrated pool.
///
/// Keep the returned container in scope; dropping it stops PostgreSQL.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "ferry_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/ferry_test");

    // The server restarts once after init; retry until it accepts connections.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
