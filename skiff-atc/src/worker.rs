//! Worker capabilities
//!
//! [`Worker`] is what the pool and the resource operations see of a
//! worker: its registered model plus access to its two services.
//! [`RemoteWorker`] is the real thing, backed by the worker's HTTP services
//! and the container bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_client::{Container, ContainerService, CreateContainer, VolumeService};
use skiff_core::domain::container::{ContainerOwner, ContainerSpec, ContainerState, ImageSpec};
use skiff_core::domain::resource::VersionedResourceTypes;
use skiff_core::domain::worker::{Mismatch, Worker as WorkerModel, WorkerSpec};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PoolError;
use crate::registry::ContainerRepository;
use crate::volume::{VolumeGraph, VolumeTarget};

/// A worker as seen by the orchestration core
#[async_trait]
pub trait Worker: Send + Sync {
    /// Registered model of the worker
    fn model(&self) -> &WorkerModel;

    fn container_service(&self) -> Arc<dyn ContainerService>;

    fn volume_service(&self) -> Arc<dyn VolumeService>;

    /// Finds the container `owner` already has on this worker, or creates it
    async fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Container>, PoolError>;

    /// Looks a container up on this worker's container-execution service
    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, PoolError>;

    fn name(&self) -> &str {
        &self.model().name
    }

    fn active_containers(&self) -> i32 {
        self.model().active_containers
    }

    fn is_owned_by_team(&self) -> bool {
        self.model().is_owned_by_team()
    }

    fn satisfies(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<(), Mismatch> {
        self.model().satisfies(spec, resource_types)
    }
}

/// A worker reached over the network
pub struct RemoteWorker {
    model: WorkerModel,
    containers: Arc<dyn ContainerService>,
    volumes: Arc<dyn VolumeService>,
    volume_graph: Arc<VolumeGraph>,
    repository: Arc<dyn ContainerRepository>,
}

impl RemoteWorker {
    pub fn new(
        model: WorkerModel,
        containers: Arc<dyn ContainerService>,
        volumes: Arc<dyn VolumeService>,
        volume_graph: Arc<VolumeGraph>,
        repository: Arc<dyn ContainerRepository>,
    ) -> Self {
        Self {
            model,
            containers,
            volumes,
            volume_graph,
            repository,
        }
    }

    /// Worker-local root filesystem path for a container image
    fn image_path(
        &self,
        image: &ImageSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<String, PoolError> {
        match image {
            ImageSpec::RootfsPath(path) => Ok(path.clone()),
            ImageSpec::ResourceType(name) => {
                let underlying = resource_types.underlying_type(name);
                self.model
                    .resource_type(underlying)
                    .map(|installed| installed.image.clone())
                    .ok_or_else(|| PoolError::UnknownResourceType {
                        worker: self.model.name.clone(),
                        resource_type: underlying.to_string(),
                    })
            }
        }
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    fn model(&self) -> &WorkerModel {
        &self.model
    }

    fn container_service(&self) -> Arc<dyn ContainerService> {
        Arc::clone(&self.containers)
    }

    fn volume_service(&self) -> Arc<dyn VolumeService> {
        Arc::clone(&self.volumes)
    }

    async fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Container>, PoolError> {
        let image_path = self.image_path(&spec.image, resource_types)?;

        let existing = self
            .repository
            .find_container_on_worker(&self.model.name, owner)
            .await?;

        let handle = match existing {
            Some(record) if record.state == ContainerState::Created => {
                debug!(worker = %self.model.name, handle = %record.handle, "Found existing container");
                return Ok(self.containers.lookup(&record.handle).await?);
            }
            // Creation was interrupted; the services are idempotent by handle
            Some(record) => record.handle,
            None => {
                let handle = Uuid::new_v4().to_string();
                self.repository
                    .create_container(&self.model.name, &handle, owner, spec.team.as_deref())
                    .await?;
                handle
            }
        };

        let target = VolumeTarget::new(&self.model.name, self.volumes.as_ref());
        let rootfs = self
            .volume_graph
            .container_rootfs(target, &image_path, &handle)
            .await?;

        let container = self
            .containers
            .create(CreateContainer {
                handle: handle.clone(),
                rootfs_path: format!("raw://{}", rootfs.path()),
                bind_mounts: spec.bind_mounts.clone(),
                privileged: spec.privileged,
            })
            .await?;

        self.repository.mark_container_created(&handle).await?;

        info!(worker = %self.model.name, handle = %handle, "Created container");
        Ok(container)
    }

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, PoolError> {
        match self.containers.lookup(handle).await {
            Ok(container) => Ok(Some(container)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
