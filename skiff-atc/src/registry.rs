//! Registry seams
//!
//! The worker pool, lifecycle manager and collector only ever see the worker
//! registry and container bookkeeping through these traits. [`PgRegistry`]
//! backs both with the Postgres repositories.

use std::time::Duration;

use async_trait::async_trait;
use skiff_core::domain::container::{ContainerOwner, ContainerRecord};
use skiff_core::domain::worker::Worker;
use sqlx::PgPool;

use crate::error::RegistryError;
use crate::repository::{container_repository, worker_repository};

/// Persistent registry of workers
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn get_worker(&self, name: &str) -> Result<Option<Worker>, RegistryError>;

    async fn workers(&self) -> Result<Vec<Worker>, RegistryError>;

    /// Workers owned by `team` plus all general workers
    async fn workers_for_team(&self, team: &str) -> Result<Vec<Worker>, RegistryError>;

    async fn save_worker(&self, worker: &Worker, ttl: Duration) -> Result<Worker, RegistryError>;

    async fn heartbeat_worker(
        &self,
        worker: &Worker,
        ttl: Duration,
    ) -> Result<Worker, RegistryError>;

    async fn land_worker(&self, name: &str) -> Result<(), RegistryError>;

    async fn retire_worker(&self, name: &str) -> Result<(), RegistryError>;

    /// Removes a worker that is not running; its container rows stay
    async fn prune_worker(&self, name: &str) -> Result<(), RegistryError>;

    async fn stall_unresponsive_workers(&self) -> Result<Vec<String>, RegistryError>;

    async fn land_finished_landing_workers(&self) -> Result<Vec<String>, RegistryError>;

    async fn delete_finished_retiring_workers(&self) -> Result<Vec<String>, RegistryError>;
}

/// Bookkeeping of containers placed on workers
#[async_trait]
pub trait ContainerRepository: Send + Sync {
    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, RegistryError>;

    /// Live container of an owner on any worker
    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError>;

    /// Live container of an owner on one worker
    async fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError>;

    async fn create_container(
        &self,
        worker_name: &str,
        handle: &str,
        owner: &ContainerOwner,
        team: Option<&str>,
    ) -> Result<ContainerRecord, RegistryError>;

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord, RegistryError>;

    async fn mark_container_hijacked(&self, handle: &str) -> Result<bool, RegistryError>;

    async fn mark_container_destroying(&self, handle: &str) -> Result<bool, RegistryError>;

    async fn mark_containers_for_deletion(&self) -> Result<u64, RegistryError>;

    async fn find_containers_marked_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError>;

    async fn find_hijacked_containers_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError>;

    /// Returns whether a row was deleted
    async fn delete_container(&self, handle: &str) -> Result<bool, RegistryError>;
}

/// Postgres implementation of both registries
#[derive(Debug, Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PgRegistry {
    async fn get_worker(&self, name: &str) -> Result<Option<Worker>, RegistryError> {
        worker_repository::find_by_name(&self.pool, name).await
    }

    async fn workers(&self) -> Result<Vec<Worker>, RegistryError> {
        worker_repository::list_all(&self.pool).await
    }

    async fn workers_for_team(&self, team: &str) -> Result<Vec<Worker>, RegistryError> {
        worker_repository::list_for_team(&self.pool, team).await
    }

    async fn save_worker(&self, worker: &Worker, ttl: Duration) -> Result<Worker, RegistryError> {
        worker_repository::save(&self.pool, worker, ttl).await
    }

    async fn heartbeat_worker(
        &self,
        worker: &Worker,
        ttl: Duration,
    ) -> Result<Worker, RegistryError> {
        worker_repository::heartbeat(&self.pool, worker, ttl).await
    }

    async fn land_worker(&self, name: &str) -> Result<(), RegistryError> {
        worker_repository::land(&self.pool, name).await
    }

    async fn retire_worker(&self, name: &str) -> Result<(), RegistryError> {
        worker_repository::retire(&self.pool, name).await
    }

    async fn prune_worker(&self, name: &str) -> Result<(), RegistryError> {
        worker_repository::prune(&self.pool, name).await
    }

    async fn stall_unresponsive_workers(&self) -> Result<Vec<String>, RegistryError> {
        worker_repository::stall_unresponsive(&self.pool).await
    }

    async fn land_finished_landing_workers(&self) -> Result<Vec<String>, RegistryError> {
        worker_repository::land_finished_landing(&self.pool).await
    }

    async fn delete_finished_retiring_workers(&self) -> Result<Vec<String>, RegistryError> {
        worker_repository::delete_finished_retiring(&self.pool).await
    }
}

#[async_trait]
impl ContainerRepository for PgRegistry {
    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        container_repository::find_by_handle(&self.pool, handle).await
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        container_repository::find_for_owner(&self.pool, owner, None).await
    }

    async fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        container_repository::find_for_owner(&self.pool, owner, Some(worker_name)).await
    }

    async fn create_container(
        &self,
        worker_name: &str,
        handle: &str,
        owner: &ContainerOwner,
        team: Option<&str>,
    ) -> Result<ContainerRecord, RegistryError> {
        container_repository::create(&self.pool, worker_name, handle, owner, team).await
    }

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord, RegistryError> {
        container_repository::mark_created(&self.pool, handle).await
    }

    async fn mark_container_hijacked(&self, handle: &str) -> Result<bool, RegistryError> {
        Ok(container_repository::mark_hijacked(&self.pool, handle).await?)
    }

    async fn mark_container_destroying(&self, handle: &str) -> Result<bool, RegistryError> {
        Ok(container_repository::mark_destroying(&self.pool, handle).await?)
    }

    async fn mark_containers_for_deletion(&self) -> Result<u64, RegistryError> {
        Ok(container_repository::mark_for_deletion(&self.pool).await?)
    }

    async fn find_containers_marked_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError> {
        container_repository::find_marked_for_deletion(&self.pool).await
    }

    async fn find_hijacked_containers_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError> {
        container_repository::find_hijacked_for_deletion(&self.pool).await
    }

    async fn delete_container(&self, handle: &str) -> Result<bool, RegistryError> {
        Ok(container_repository::delete(&self.pool, handle).await?)
    }
}
