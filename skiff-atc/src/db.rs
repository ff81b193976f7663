use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Endpoints are nullable: landed and stalled workers have none
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            name VARCHAR(255) PRIMARY KEY,
            state VARCHAR(20) NOT NULL DEFAULT 'running',
            addr TEXT,
            baggageclaim_url TEXT,
            http_proxy_url TEXT,
            https_proxy_url TEXT,
            no_proxy TEXT,
            active_containers INTEGER NOT NULL DEFAULT 0,
            resource_types JSONB NOT NULL DEFAULT '[]',
            platform VARCHAR(255) NOT NULL DEFAULT '',
            tags TEXT[] NOT NULL DEFAULT '{}',
            team_id BIGINT REFERENCES teams(id) ON DELETE CASCADE,
            start_time BIGINT NOT NULL DEFAULT 0,
            expires TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            interruptible BOOLEAN NOT NULL DEFAULT false
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT REFERENCES jobs(id) ON DELETE CASCADE,
            status VARCHAR(20) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No foreign keys on worker_name or build_id: rows of a deleted worker
    // or build stay until the collector has destroyed their containers.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            id BIGSERIAL PRIMARY KEY,
            handle VARCHAR(255) NOT NULL UNIQUE,
            worker_name VARCHAR(255) NOT NULL,
            state VARCHAR(20) NOT NULL,
            hijacked BOOLEAN NOT NULL DEFAULT false,
            build_id BIGINT,
            plan_id TEXT,
            resource_config_id BIGINT,
            best_if_used_by TIMESTAMPTZ,
            team_id BIGINT REFERENCES teams(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("ALTER TABLE containers DROP CONSTRAINT IF EXISTS containers_worker_name_fkey")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_state ON workers(state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_containers_state ON containers(state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_containers_worker ON containers(worker_name)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_containers_build ON containers(build_id, plan_id)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
