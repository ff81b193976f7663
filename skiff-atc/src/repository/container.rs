//! Container Repository
//!
//! Bookkeeping of the containers placed on workers. A row is created in
//! `creating` before the remote container exists, flips to `created` once it
//! does, and to `destroying` once nothing needs it anymore. Only the
//! collector deletes rows, after the remote container is gone.

use std::time::Duration;

use chrono::Utc;
use skiff_core::domain::container::{ContainerOwner, ContainerRecord, ContainerState};
use sqlx::PgPool;

use crate::error::RegistryError;
use crate::repository::ensure_team;

/// How long a resource check container is worth keeping around
pub const CHECK_CONTAINER_LIFETIME: Duration = Duration::from_secs(5 * 60);

const CONTAINERS_QUERY: &str = r#"
    SELECT c.id, c.handle, c.worker_name, c.state, c.hijacked, c.build_id,
           c.plan_id, c.resource_config_id, t.name AS team_name
    FROM containers c
    LEFT JOIN teams t ON t.id = c.team_id
"#;

/// Containers whose owner no longer needs them: the build finished (or is
/// gone), or the check container outlived its usefulness.
const OWNER_FINISHED: &str = r#"
    (
        (c.build_id IS NOT NULL
            AND c.build_id NOT IN (SELECT id FROM builds WHERE status IN ('pending', 'started')))
        OR (c.resource_config_id IS NOT NULL AND c.best_if_used_by < NOW())
    )
"#;

/// Find a container by handle
pub async fn find_by_handle(
    pool: &PgPool,
    handle: &str,
) -> Result<Option<ContainerRecord>, RegistryError> {
    let row = sqlx::query_as::<_, ContainerRow>(&format!("{} WHERE c.handle = $1", CONTAINERS_QUERY))
        .bind(handle)
        .fetch_optional(pool)
        .await?;

    row.map(ContainerRecord::try_from).transpose()
}

/// Find the live container of an owner, optionally restricted to one worker
pub async fn find_for_owner(
    pool: &PgPool,
    owner: &ContainerOwner,
    worker_name: Option<&str>,
) -> Result<Option<ContainerRecord>, RegistryError> {
    let row = match owner {
        ContainerOwner::Build { build_id, plan_id } => {
            sqlx::query_as::<_, ContainerRow>(&format!(
                "{} WHERE c.build_id = $1 AND c.plan_id = $2 AND {} ORDER BY c.id LIMIT 1",
                CONTAINERS_QUERY,
                live_on_worker(3)
            ))
            .bind(build_id)
            .bind(plan_id)
            .bind(worker_name)
            .fetch_optional(pool)
            .await?
        }
        ContainerOwner::ResourceCheck { resource_config_id } => {
            sqlx::query_as::<_, ContainerRow>(&format!(
                "{} WHERE c.resource_config_id = $1 AND {} ORDER BY c.id LIMIT 1",
                CONTAINERS_QUERY,
                live_on_worker(2)
            ))
            .bind(resource_config_id)
            .bind(worker_name)
            .fetch_optional(pool)
            .await?
        }
    };

    row.map(ContainerRecord::try_from).transpose()
}

/// Filter on live containers, on the worker bound at `$param` unless it is null
fn live_on_worker(param: usize) -> String {
    format!(
        "c.state IN ('creating', 'created') AND (${0}::text IS NULL OR c.worker_name = ${0})",
        param
    )
}

/// Record a container that is about to be created on a worker
pub async fn create(
    pool: &PgPool,
    worker_name: &str,
    handle: &str,
    owner: &ContainerOwner,
    team: Option<&str>,
) -> Result<ContainerRecord, RegistryError> {
    let mut tx = pool.begin().await?;

    let team_id = match team {
        Some(team) => Some(ensure_team(&mut *tx, team).await?),
        None => None,
    };

    let (build_id, plan_id, resource_config_id, best_if_used_by) = match owner {
        ContainerOwner::Build { build_id, plan_id } => {
            (Some(*build_id), Some(plan_id.clone()), None, None)
        }
        ContainerOwner::ResourceCheck { resource_config_id } => {
            let lifetime = chrono::Duration::from_std(CHECK_CONTAINER_LIFETIME)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
            (None, None, Some(*resource_config_id), Some(Utc::now() + lifetime))
        }
    };

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO containers (handle, worker_name, state, build_id, plan_id,
                                resource_config_id, best_if_used_by, team_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(handle)
    .bind(worker_name)
    .bind(ContainerState::Creating.as_str())
    .bind(build_id)
    .bind(plan_id)
    .bind(resource_config_id)
    .bind(best_if_used_by)
    .bind(team_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ContainerRecord {
        id,
        handle: handle.to_string(),
        worker_name: worker_name.to_string(),
        state: ContainerState::Creating,
        hijacked: false,
        owner: owner.clone(),
        team: team.map(str::to_string),
    })
}

/// Mark a container as created once it exists on its worker
pub async fn mark_created(pool: &PgPool, handle: &str) -> Result<ContainerRecord, RegistryError> {
    let result = sqlx::query(
        "UPDATE containers SET state = 'created' WHERE handle = $1 AND state IN ('creating', 'created')",
    )
    .bind(handle)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RegistryError::ContainerNotPresent(handle.to_string()));
    }

    find_by_handle(pool, handle)
        .await?
        .ok_or_else(|| RegistryError::ContainerNotPresent(handle.to_string()))
}

/// Flag a container as hijacked by an interactive session
pub async fn mark_hijacked(pool: &PgPool, handle: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE containers SET hijacked = true WHERE handle = $1")
        .bind(handle)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark a single container for deletion
pub async fn mark_destroying(pool: &PgPool, handle: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE containers SET state = 'destroying' WHERE handle = $1")
        .bind(handle)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark every unhijacked container whose owner finished for deletion.
/// Returns the number of containers marked.
pub async fn mark_for_deletion(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE containers c
        SET state = 'destroying'
        WHERE c.state = 'created' AND c.hijacked = false AND {}
        "#,
        OWNER_FINISHED
    ))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Containers waiting to be destroyed on their workers
pub async fn find_marked_for_deletion(
    pool: &PgPool,
) -> Result<Vec<ContainerRecord>, RegistryError> {
    let rows = sqlx::query_as::<_, ContainerRow>(&format!(
        "{} WHERE c.state = 'destroying' ORDER BY c.id",
        CONTAINERS_QUERY
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ContainerRecord::try_from).collect()
}

/// Hijacked containers whose owner finished
pub async fn find_hijacked_for_deletion(
    pool: &PgPool,
) -> Result<Vec<ContainerRecord>, RegistryError> {
    let rows = sqlx::query_as::<_, ContainerRow>(&format!(
        "{} WHERE c.state = 'created' AND c.hijacked = true AND {} ORDER BY c.id",
        CONTAINERS_QUERY, OWNER_FINISHED
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ContainerRecord::try_from).collect()
}

/// Delete a container row
pub async fn delete(pool: &PgPool, handle: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM containers WHERE handle = $1")
        .bind(handle)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ContainerRow {
    id: i64,
    handle: String,
    worker_name: String,
    state: String,
    hijacked: bool,
    build_id: Option<i64>,
    plan_id: Option<String>,
    resource_config_id: Option<i64>,
    team_name: Option<String>,
}

impl TryFrom<ContainerRow> for ContainerRecord {
    type Error = RegistryError;

    fn try_from(row: ContainerRow) -> Result<Self, Self::Error> {
        let state = ContainerState::parse(&row.state).ok_or_else(|| {
            RegistryError::InvalidRow(format!("container {} has state '{}'", row.handle, row.state))
        })?;

        let owner = match (row.build_id, row.plan_id, row.resource_config_id) {
            (Some(build_id), Some(plan_id), _) => ContainerOwner::Build { build_id, plan_id },
            (None, _, Some(resource_config_id)) => ContainerOwner::ResourceCheck { resource_config_id },
            _ => {
                return Err(RegistryError::InvalidRow(format!(
                    "container {} has no owner",
                    row.handle
                )));
            }
        };

        Ok(ContainerRecord {
            id: row.id,
            handle: row.handle,
            worker_name: row.worker_name,
            state,
            hijacked: row.hijacked,
            owner,
            team: row.team_name,
        })
    }
}
