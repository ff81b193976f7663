//! Repository Module
//!
//! Data access layer for the worker registry and container bookkeeping.
//! Each repository is a set of free functions over a Postgres pool.

pub mod container;
pub mod worker;

// Re-export for convenience
pub use container as container_repository;
pub use worker as worker_repository;

/// Resolves a team name to its id, creating the team on first use
pub(crate) async fn ensure_team<'e, E>(executor: E, name: &str) -> Result<i64, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO teams (name)
        VALUES ($1)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(name)
    .fetch_one(executor)
    .await
}
