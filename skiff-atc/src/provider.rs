//! Worker provider
//!
//! Turns registry rows into live [`Worker`]s the pool can place work on.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use skiff_client::{
    ClientError, ContainerService, HttpContainerService, HttpVolumeService, ServiceClient,
    VolumeService,
};
use skiff_core::domain::container::{ContainerOwner, ContainerRecord};
use skiff_core::domain::worker::{Worker as WorkerModel, WorkerState};
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::registry::{ContainerRepository, WorkerRegistry};
use crate::volume::VolumeGraph;
use crate::worker::{RemoteWorker, Worker};

/// Builds clients for a worker's services from its registered endpoints
pub trait ClientFactory: Send + Sync {
    /// Fails with [`ClientError::MissingAddress`] for a worker without one
    fn container_service(
        &self,
        worker: &WorkerModel,
    ) -> Result<Arc<dyn ContainerService>, ClientError>;

    fn volume_service(&self, worker: &WorkerModel) -> Result<Arc<dyn VolumeService>, ClientError>;
}

/// [`ClientFactory`] speaking HTTP to the workers
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    client: Client,
}

impl HttpClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl ClientFactory for HttpClientFactory {
    fn container_service(
        &self,
        worker: &WorkerModel,
    ) -> Result<Arc<dyn ContainerService>, ClientError> {
        let addr = worker
            .garden_addr
            .as_deref()
            .ok_or_else(|| ClientError::MissingAddress(worker.name.clone()))?;

        Ok(Arc::new(HttpContainerService::with_client(
            ServiceClient::with_client(addr, self.client.clone()),
        )))
    }

    fn volume_service(&self, worker: &WorkerModel) -> Result<Arc<dyn VolumeService>, ClientError> {
        let url = worker
            .baggageclaim_url
            .as_deref()
            .ok_or_else(|| ClientError::MissingAddress(worker.name.clone()))?;

        Ok(Arc::new(HttpVolumeService::with_client(
            ServiceClient::with_client(url, self.client.clone()),
        )))
    }
}

/// Source of live workers for the pool
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Workers currently accepting work. With a team, only that team's
    /// workers and the general ones.
    async fn running_workers(&self, team: Option<&str>) -> Result<Vec<Arc<dyn Worker>>, PoolError>;

    async fn get_worker(&self, name: &str) -> Result<Option<Arc<dyn Worker>>, PoolError>;

    /// The worker already hosting `owner`'s container, if that worker can
    /// still be reached
    async fn find_worker_for_container(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<Arc<dyn Worker>>, PoolError>;

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, PoolError>;

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, PoolError>;
}

/// [`WorkerProvider`] backed by the registry
pub struct RegistryWorkerProvider {
    registry: Arc<dyn WorkerRegistry>,
    containers: Arc<dyn ContainerRepository>,
    clients: Arc<dyn ClientFactory>,
    volume_graph: Arc<VolumeGraph>,
}

impl RegistryWorkerProvider {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        containers: Arc<dyn ContainerRepository>,
        clients: Arc<dyn ClientFactory>,
        volume_graph: Arc<VolumeGraph>,
    ) -> Self {
        Self {
            registry,
            containers,
            clients,
            volume_graph,
        }
    }

    fn connect(&self, model: WorkerModel) -> Result<Arc<dyn Worker>, ClientError> {
        let containers = self.clients.container_service(&model)?;
        let volumes = self.clients.volume_service(&model)?;

        Ok(Arc::new(RemoteWorker::new(
            model,
            containers,
            volumes,
            Arc::clone(&self.volume_graph),
            Arc::clone(&self.containers),
        )))
    }
}

#[async_trait]
impl WorkerProvider for RegistryWorkerProvider {
    async fn running_workers(&self, team: Option<&str>) -> Result<Vec<Arc<dyn Worker>>, PoolError> {
        let models = match team {
            Some(team) => self.registry.workers_for_team(team).await?,
            None => self.registry.workers().await?,
        };

        let mut workers = Vec::new();
        for model in models {
            if model.state != WorkerState::Running {
                continue;
            }

            let name = model.name.clone();
            match self.connect(model) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!(worker = %name, error = %e, "Skipping unreachable worker"),
            }
        }

        Ok(workers)
    }

    async fn get_worker(&self, name: &str) -> Result<Option<Arc<dyn Worker>>, PoolError> {
        match self.registry.get_worker(name).await? {
            Some(model) => Ok(Some(self.connect(model)?)),
            None => Ok(None),
        }
    }

    async fn find_worker_for_container(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<Arc<dyn Worker>>, PoolError> {
        let Some(record) = self.containers.find_container_for_owner(owner).await? else {
            return Ok(None);
        };

        let Some(model) = self.registry.get_worker(&record.worker_name).await? else {
            debug!(worker = %record.worker_name, handle = %record.handle, "Worker hosting container is gone");
            return Ok(None);
        };

        // Landed and stalled workers take no work, not even for an owner
        // they already host
        if model.state.clears_endpoints() || !model.is_reachable() {
            debug!(worker = %model.name, state = %model.state, handle = %record.handle, "Worker hosting container is unavailable");
            return Ok(None);
        }

        let name = model.name.clone();
        match self.connect(model) {
            Ok(worker) => Ok(Some(worker)),
            Err(e) => {
                warn!(worker = %name, error = %e, "Cannot reach worker hosting container");
                Ok(None)
            }
        }
    }

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, PoolError> {
        Ok(self.containers.find_container_by_handle(handle).await?)
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, PoolError> {
        Ok(self.containers.find_container_for_owner(owner).await?)
    }
}
