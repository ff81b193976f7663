//! Worker Repository
//!
//! Handles all database operations related to workers: registration,
//! heartbeats and the lifecycle transitions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skiff_core::domain::build::BuildStatus;
use skiff_core::domain::worker::{Worker, WorkerLoad, WorkerResourceType, WorkerState};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::error::RegistryError;
use crate::repository::ensure_team;

const WORKERS_QUERY: &str = r#"
    SELECT w.name, w.state, w.addr, w.baggageclaim_url, w.http_proxy_url,
           w.https_proxy_url, w.no_proxy, w.active_containers, w.resource_types,
           w.platform, w.tags, t.name AS team_name, w.start_time, w.expires
    FROM workers w
    LEFT JOIN teams t ON t.id = w.team_id
"#;

/// Find a worker by name
pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Worker>, RegistryError> {
    fetch_worker(pool, name).await
}

/// List all workers
pub async fn list_all(pool: &PgPool) -> Result<Vec<Worker>, RegistryError> {
    let rows = sqlx::query_as::<_, WorkerRow>(&format!("{} ORDER BY w.name", WORKERS_QUERY))
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(Worker::try_from).collect()
}

/// List the workers a team may use: its own plus all general workers
pub async fn list_for_team(pool: &PgPool, team: &str) -> Result<Vec<Worker>, RegistryError> {
    let rows = sqlx::query_as::<_, WorkerRow>(&format!(
        "{} WHERE t.name = $1 OR w.team_id IS NULL ORDER BY w.name",
        WORKERS_QUERY
    ))
    .bind(team)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Worker::try_from).collect()
}

/// Register a worker, or refresh an existing registration.
///
/// An existing worker may not change hands between teams.
pub async fn save(pool: &PgPool, worker: &Worker, ttl: Duration) -> Result<Worker, RegistryError> {
    let mut tx = pool.begin().await?;

    let team_id = match &worker.team {
        Some(team) => Some(ensure_team(&mut *tx, team).await?),
        None => None,
    };

    let existing: Option<Option<i64>> =
        sqlx::query_scalar("SELECT team_id FROM workers WHERE name = $1 FOR UPDATE")
            .bind(&worker.name)
            .fetch_optional(&mut *tx)
            .await?;

    match existing {
        Some(existing_team) if existing_team != team_id => {
            return Err(RegistryError::OtherTeamsWorker(worker.name.clone()));
        }
        Some(_) => {
            sqlx::query(
                r#"
                UPDATE workers
                SET addr = $2, baggageclaim_url = $3, http_proxy_url = $4,
                    https_proxy_url = $5, no_proxy = $6, active_containers = $7,
                    resource_types = $8, platform = $9, tags = $10, start_time = $11,
                    state = $12, expires = $13
                WHERE name = $1
                "#,
            )
            .bind(&worker.name)
            .bind(&worker.garden_addr)
            .bind(&worker.baggageclaim_url)
            .bind(&worker.http_proxy_url)
            .bind(&worker.https_proxy_url)
            .bind(&worker.no_proxy)
            .bind(worker.active_containers)
            .bind(Json(&worker.resource_types))
            .bind(&worker.platform)
            .bind(&worker.tags)
            .bind(worker.start_time)
            .bind(worker.state.as_str())
            .bind(expires_at(ttl))
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO workers (name, addr, baggageclaim_url, http_proxy_url,
                                     https_proxy_url, no_proxy, active_containers,
                                     resource_types, platform, tags, start_time,
                                     state, expires, team_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(&worker.name)
            .bind(&worker.garden_addr)
            .bind(&worker.baggageclaim_url)
            .bind(&worker.http_proxy_url)
            .bind(&worker.https_proxy_url)
            .bind(&worker.no_proxy)
            .bind(worker.active_containers)
            .bind(Json(&worker.resource_types))
            .bind(&worker.platform)
            .bind(&worker.tags)
            .bind(worker.start_time)
            .bind(worker.state.as_str())
            .bind(expires_at(ttl))
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    let saved = fetch_worker(&mut *tx, &worker.name)
        .await?
        .ok_or_else(|| RegistryError::WorkerNotPresent(worker.name.clone()))?;

    tx.commit().await?;

    Ok(saved)
}

/// Refresh a worker's expiry, endpoints and container count.
///
/// The row is locked, the heartbeat folded into it and the result written
/// back inside one transaction.
pub async fn heartbeat(
    pool: &PgPool,
    worker: &Worker,
    ttl: Duration,
) -> Result<Worker, RegistryError> {
    let mut tx = pool.begin().await?;

    let mut registered = fetch_worker_for_update(&mut *tx, &worker.name)
        .await?
        .ok_or_else(|| RegistryError::WorkerNotPresent(worker.name.clone()))?;

    registered.apply_heartbeat(worker, expires_at(ttl));
    write_lifecycle(&mut *tx, &registered).await?;

    tx.commit().await?;

    Ok(registered)
}

/// Ask a worker to land; a worker that already landed stays landed
pub async fn land(pool: &PgPool, name: &str) -> Result<(), RegistryError> {
    let mut tx = pool.begin().await?;

    let state = lock_state(&mut *tx, name)
        .await?
        .ok_or_else(|| RegistryError::WorkerNotPresent(name.to_string()))?;

    sqlx::query("UPDATE workers SET state = $2 WHERE name = $1")
        .bind(name)
        .bind(state.after_land_request().as_str())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Ask a worker to retire
pub async fn retire(pool: &PgPool, name: &str) -> Result<(), RegistryError> {
    let result = sqlx::query("UPDATE workers SET state = 'retiring' WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RegistryError::WorkerNotPresent(name.to_string()));
    }

    Ok(())
}

/// Remove a worker that is not running.
///
/// Its container rows stay behind for the collector.
pub async fn prune(pool: &PgPool, name: &str) -> Result<(), RegistryError> {
    let mut tx = pool.begin().await?;

    let state = lock_state(&mut *tx, name).await?;
    ensure_prunable(name, state)?;

    sqlx::query("DELETE FROM workers WHERE name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Decides an explicit prune from the worker's current state, `None` when
/// the worker is not registered
pub(crate) fn ensure_prunable(name: &str, state: Option<WorkerState>) -> Result<(), RegistryError> {
    match state {
        None => Err(RegistryError::WorkerNotPresent(name.to_string())),
        Some(state) if !state.is_prunable() => {
            Err(RegistryError::CannotPruneRunningWorker(name.to_string()))
        }
        Some(_) => Ok(()),
    }
}

/// Mark running workers whose heartbeat expired as stalled.
/// Returns the names of the stalled workers.
pub async fn stall_unresponsive(pool: &PgPool) -> Result<Vec<String>, RegistryError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let mut stalled = Vec::new();
    for mut worker in workers_in_state_for_update(&mut *tx, WorkerState::Running).await? {
        if worker.is_unresponsive(now) {
            worker.stall();
            write_lifecycle(&mut *tx, &worker).await?;
            stalled.push(worker.name);
        }
    }

    tx.commit().await?;

    Ok(stalled)
}

/// Land landing workers no longer pinned by a build.
/// Returns the names of the landed workers.
pub async fn land_finished_landing(pool: &PgPool) -> Result<Vec<String>, RegistryError> {
    let mut tx = pool.begin().await?;

    let landing = workers_in_state_for_update(&mut *tx, WorkerState::Landing).await?;
    let loads = worker_loads(&mut *tx, &names_of(&landing)).await?;

    let mut landed = Vec::new();
    for mut worker in landing {
        if load_of(&loads, &worker.name).may_land() {
            worker.finish_landing();
            write_lifecycle(&mut *tx, &worker).await?;
            landed.push(worker.name);
        }
    }

    tx.commit().await?;

    Ok(landed)
}

/// Delete retiring workers that no build pins and that have no containers
/// left. Returns the names of the deleted workers.
pub async fn delete_finished_retiring(pool: &PgPool) -> Result<Vec<String>, RegistryError> {
    let mut tx = pool.begin().await?;

    let retiring = workers_in_state_for_update(&mut *tx, WorkerState::Retiring).await?;
    let loads = worker_loads(&mut *tx, &names_of(&retiring)).await?;

    let retired: Vec<String> = retiring
        .into_iter()
        .filter(|worker| load_of(&loads, &worker.name).may_retire())
        .map(|worker| worker.name)
        .collect();

    if !retired.is_empty() {
        sqlx::query("DELETE FROM workers WHERE name = ANY($1)")
            .bind(&retired)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(retired)
}

/// Container load of each of `names` that has any containers
async fn worker_loads<'e, E>(
    executor: E,
    names: &[String],
) -> Result<HashMap<String, WorkerLoad>, RegistryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, ContainerPinRow>(
        r#"
        SELECT c.worker_name, b.status AS build_status, b.job_id, j.interruptible
        FROM containers c
        LEFT JOIN builds b ON b.id = c.build_id
        LEFT JOIN jobs j ON j.id = b.job_id
        WHERE c.worker_name = ANY($1)
        "#,
    )
    .bind(names)
    .fetch_all(executor)
    .await?;

    loads_from_rows(rows)
}

fn loads_from_rows(rows: Vec<ContainerPinRow>) -> Result<HashMap<String, WorkerLoad>, RegistryError> {
    let mut loads: HashMap<String, WorkerLoad> = HashMap::new();

    for row in rows {
        let build = match &row.build_status {
            Some(status) => {
                let status = BuildStatus::parse(status).ok_or_else(|| {
                    RegistryError::InvalidRow(format!("build has status '{}'", status))
                })?;
                // Builds without a job are one-offs
                let interruptible = row.job_id.map(|_| row.interruptible.unwrap_or(false));
                Some((status, interruptible))
            }
            None => None,
        };

        loads.entry(row.worker_name).or_default().count_container(build);
    }

    Ok(loads)
}

fn load_of(loads: &HashMap<String, WorkerLoad>, name: &str) -> WorkerLoad {
    loads.get(name).copied().unwrap_or_default()
}

fn names_of(workers: &[Worker]) -> Vec<String> {
    workers.iter().map(|worker| worker.name.clone()).collect()
}

/// Persists the lifecycle-owned columns of a worker
async fn write_lifecycle<'e, E>(executor: E, worker: &Worker) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE workers
        SET state = $2, addr = $3, baggageclaim_url = $4, active_containers = $5, expires = $6
        WHERE name = $1
        "#,
    )
    .bind(&worker.name)
    .bind(worker.state.as_str())
    .bind(&worker.garden_addr)
    .bind(&worker.baggageclaim_url)
    .bind(worker.active_containers)
    .bind(worker.expires_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn lock_state<'e, E>(executor: E, name: &str) -> Result<Option<WorkerState>, RegistryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM workers WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(executor)
            .await?;

    state
        .map(|state| {
            WorkerState::parse(&state).ok_or_else(|| {
                RegistryError::InvalidRow(format!("worker {} has state '{}'", name, state))
            })
        })
        .transpose()
}

async fn workers_in_state_for_update<'e, E>(
    executor: E,
    state: WorkerState,
) -> Result<Vec<Worker>, RegistryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, WorkerRow>(&format!(
        "{} WHERE w.state = $1 ORDER BY w.name FOR UPDATE OF w",
        WORKERS_QUERY
    ))
    .bind(state.as_str())
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(Worker::try_from).collect()
}

async fn fetch_worker_for_update<'e, E>(
    executor: E,
    name: &str,
) -> Result<Option<Worker>, RegistryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, WorkerRow>(&format!(
        "{} WHERE w.name = $1 FOR UPDATE OF w",
        WORKERS_QUERY
    ))
    .bind(name)
    .fetch_optional(executor)
    .await?;

    row.map(Worker::try_from).transpose()
}

async fn fetch_worker<'e, E>(executor: E, name: &str) -> Result<Option<Worker>, RegistryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, WorkerRow>(&format!("{} WHERE w.name = $1", WORKERS_QUERY))
        .bind(name)
        .fetch_optional(executor)
        .await?;

    row.map(Worker::try_from).transpose()
}

/// Absolute expiry for a registration; a zero ttl never expires
fn expires_at(ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }

    chrono::Duration::from_std(ttl)
        .ok()
        .map(|ttl| Utc::now() + ttl)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkerRow {
    name: String,
    state: String,
    addr: Option<String>,
    baggageclaim_url: Option<String>,
    http_proxy_url: Option<String>,
    https_proxy_url: Option<String>,
    no_proxy: Option<String>,
    active_containers: i32,
    resource_types: Json<Vec<WorkerResourceType>>,
    platform: String,
    tags: Vec<String>,
    team_name: Option<String>,
    start_time: i64,
    expires: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ContainerPinRow {
    worker_name: String,
    build_status: Option<String>,
    job_id: Option<i64>,
    interruptible: Option<bool>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = RegistryError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        let state = WorkerState::parse(&row.state).ok_or_else(|| {
            RegistryError::InvalidRow(format!("worker {} has state '{}'", row.name, row.state))
        })?;

        Ok(Worker {
            name: row.name,
            state,
            garden_addr: row.addr,
            baggageclaim_url: row.baggageclaim_url,
            http_proxy_url: row.http_proxy_url,
            https_proxy_url: row.https_proxy_url,
            no_proxy: row.no_proxy,
            active_containers: row.active_containers,
            resource_types: row.resource_types.0,
            platform: row.platform,
            tags: row.tags,
            team: row.team_name,
            start_time: row.start_time,
            expires_at: row.expires,
        })
    }
}
